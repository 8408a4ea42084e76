//! Line item minimum-commitment rules.
//!
//! Within one window (the whole period when not windowed):
//!
//! - `utilized = min(raw, commitment)`
//! - `overage = max(0, raw - commitment) * overage_factor`
//! - `true_up = commitment - utilized` when true-up is enabled, else zero
//! - `cost = utilized + overage + true_up`
//!
//! Windowed commitments apply the rule to every window independently and sum
//! the window costs.

use rust_decimal::Decimal;
use service_core::error::AppError;

use crate::models::{Commitment, CommitmentInfo, Price, SubscriptionLineItem};
use crate::services::pricing::calculate_cost;

/// Applies the line item's commitment.
///
/// Non-windowed commitments apply once to `raw_cost`. Windowed commitments
/// price each entry of `usage_values` as one window. Without a commitment
/// `raw_cost` is returned unchanged.
pub fn apply_commitment(
    line_item: &SubscriptionLineItem,
    price: &Price,
    usage_values: &[Decimal],
    raw_cost: Decimal,
) -> Result<(Decimal, Option<CommitmentInfo>), AppError> {
    let Some(commitment) = line_item.commitment.as_ref().filter(|_| line_item.has_commitment())
    else {
        return Ok((raw_cost, None));
    };
    validate(commitment, &line_item.id)?;

    if !commitment.windowed {
        let (cost, info) = apply_to_window(commitment, raw_cost);
        return Ok((cost, Some(info)));
    }

    if usage_values.is_empty() {
        return Err(AppError::ValidationError(format!(
            "windowed commitment on line item {} needs at least one usage window",
            line_item.id
        )));
    }

    let mut total = Decimal::ZERO;
    let mut summary = CommitmentInfo {
        commitment_amount: commitment.amount,
        windowed: true,
        overage_factor: commitment.overage_factor,
        ..Default::default()
    };
    for usage in usage_values {
        let (cost, window) = apply_to_window(commitment, calculate_cost(price, *usage));
        total += cost;
        summary.computed_commitment_utilized_amount += window.computed_commitment_utilized_amount;
        summary.computed_overage_amount += window.computed_overage_amount;
        summary.computed_true_up_amount += window.computed_true_up_amount;
    }
    Ok((total, Some(summary)))
}

/// Commitment outcome for a single window's raw cost.
pub fn apply_to_window(commitment: &Commitment, raw_cost: Decimal) -> (Decimal, CommitmentInfo) {
    let raw_cost = raw_cost.max(Decimal::ZERO);
    let utilized = raw_cost.min(commitment.amount);
    let overage = (raw_cost - commitment.amount).max(Decimal::ZERO) * commitment.overage_factor;
    let true_up = if commitment.true_up_enabled {
        commitment.amount - utilized
    } else {
        Decimal::ZERO
    };

    let info = CommitmentInfo {
        commitment_amount: commitment.amount,
        windowed: commitment.windowed,
        overage_factor: commitment.overage_factor,
        computed_commitment_utilized_amount: utilized,
        computed_overage_amount: overage,
        computed_true_up_amount: true_up,
    };
    (utilized + overage + true_up, info)
}

fn validate(commitment: &Commitment, line_item_id: &str) -> Result<(), AppError> {
    if commitment.overage_factor < Decimal::ZERO {
        return Err(AppError::ValidationError(format!(
            "line item {} has a negative overage factor",
            line_item_id
        )));
    }
    Ok(())
}
