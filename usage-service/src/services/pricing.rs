//! Price evaluation: flat fee, package and tiered (volume or slab) models.

use rust_decimal::Decimal;

use crate::models::{BillingModel, Price, PriceTier, RoundingMode, TierMode};

/// Cost of `quantity` units under `price`. Non-positive quantities cost zero.
pub fn calculate_cost(price: &Price, quantity: Decimal) -> Decimal {
    if quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    match price.billing_model {
        BillingModel::FlatFee => price.amount * quantity,
        BillingModel::Package => {
            let Some(transform) = price.transform_quantity.as_ref().filter(|t| t.divide_by > 0)
            else {
                return price.amount * quantity;
            };
            let packages = quantity / Decimal::from(transform.divide_by);
            let packages = match transform.round {
                RoundingMode::Up => packages.ceil(),
                RoundingMode::Down => packages.floor(),
            };
            price.amount * packages
        }
        BillingModel::Tiered => match price.tier_mode {
            TierMode::Volume => volume_cost(&price.tiers, quantity),
            TierMode::Slab => slab_cost(&price.tiers, quantity),
        },
    }
}

/// Sum of the cost of each bucket priced independently.
pub fn calculate_bucketed_cost(price: &Price, buckets: &[Decimal]) -> Decimal {
    buckets
        .iter()
        .map(|bucket| calculate_cost(price, *bucket))
        .sum()
}

/// The whole quantity priced at the first tier whose bound contains it.
fn volume_cost(tiers: &[PriceTier], quantity: Decimal) -> Decimal {
    let tier = tiers
        .iter()
        .find(|tier| tier.up_to.map_or(true, |up_to| quantity <= Decimal::from(up_to)))
        .or_else(|| tiers.last());

    match tier {
        Some(tier) => tier.unit_amount * quantity + tier.flat_amount.unwrap_or_default(),
        None => Decimal::ZERO,
    }
}

/// Each slice `(previous bound, bound]` priced at its own tier.
fn slab_cost(tiers: &[PriceTier], quantity: Decimal) -> Decimal {
    let mut cost = Decimal::ZERO;
    let mut lower = Decimal::ZERO;

    for tier in tiers {
        if quantity <= lower {
            break;
        }
        let upper = tier.up_to.map(Decimal::from);
        let slice = match upper {
            Some(upper) => quantity.min(upper) - lower,
            None => quantity - lower,
        };
        if slice > Decimal::ZERO {
            cost += tier.unit_amount * slice + tier.flat_amount.unwrap_or_default();
        }
        match upper {
            Some(upper) => lower = upper,
            None => break,
        }
    }
    cost
}
