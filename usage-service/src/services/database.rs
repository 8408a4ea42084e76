//! Database service for usage-service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{info, instrument};

use crate::models::{
    Addon, AggregationType, Customer, DetailedUsageAnalytic, Event, Feature, FeatureUsage,
    ListCustomersFilter, ListFeaturesFilter, ListLineItemsFilter, ListMetersFilter,
    ListPricesFilter, ListSubscriptionsFilter, Meter, Plan, Price, ReprocessEventsParams,
    Subscription, SubscriptionLineItem, UsageAnalyticPoint, UsageAnalyticsParams, WindowSize,
    WorkflowConfig,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    grouped_properties, groups_by_source, AddonRepository, BucketFeatures, CustomerRepository,
    EventRepository, FeatureRepository, FeatureUsageRepository, LineItemRepository,
    MeterRepository, PlanRepository, PriceRepository, SettingsRepository,
    SubscriptionRepository,
};

/// Settings key holding the customer onboarding workflow config.
const ONBOARDING_SETTINGS_KEY: &str = "customer_onboarding";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "usage-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seeding Operations
    // -------------------------------------------------------------------------

    /// Store a raw event. Existing events are left untouched.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn insert_event(&self, event: &Event) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_event"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO events (id, tenant_id, environment_id, event_name, external_customer_id,
                                customer_id, "timestamp", source, properties)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, environment_id, id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.tenant_id)
        .bind(&event.environment_id)
        .bind(&event.event_name)
        .bind(&event.external_customer_id)
        .bind(&event.customer_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(Json(&event.properties))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert event: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Store or replace the onboarding workflow config of an environment.
    #[instrument(skip(self, config))]
    pub async fn set_onboarding_config(
        &self,
        tenant_id: &str,
        environment_id: &str,
        config: &WorkflowConfig,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_onboarding_config"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO environment_settings (tenant_id, environment_id, key, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, environment_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(ONBOARDING_SETTINGS_KEY)
        .bind(Json(config))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to store onboarding config: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Customer Operations
// -------------------------------------------------------------------------

#[async_trait]
impl CustomerRepository for Database {
    #[instrument(skip(self))]
    async fn get_customer(
        &self,
        tenant_id: &str,
        environment_id: &str,
        customer_id: &str,
    ) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, tenant_id, environment_id, external_id, name, created_at
            FROM customers
            WHERE tenant_id = $1 AND environment_id = $2 AND id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        timer.observe_duration();

        customer
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer {} not found", customer_id)))
    }

    #[instrument(skip(self))]
    async fn get_customer_by_external_id(
        &self,
        tenant_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer_by_external_id"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, tenant_id, environment_id, external_id, name, created_at
            FROM customers
            WHERE tenant_id = $1 AND environment_id = $2 AND external_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to get customer by external id: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(customer)
    }

    #[instrument(skip(self, filter))]
    async fn list_customers(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListCustomersFilter,
    ) -> Result<Vec<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_customers"])
            .start_timer();

        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, tenant_id, environment_id, external_id, name, created_at
            FROM customers
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR external_id = ANY($3))
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(&filter.external_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list customers: {}", e)))?;

        timer.observe_duration();
        Ok(customers)
    }
}

// -------------------------------------------------------------------------
// Subscription Operations
// -------------------------------------------------------------------------

const LINE_ITEM_COLUMNS: &str = r#"
    id, tenant_id, environment_id, subscription_id, customer_id, entity_type, entity_id,
    price_id, price_type, meter_id, display_name, currency, start_date, end_date, status,
    commitment
"#;

#[async_trait]
impl SubscriptionRepository for Database {
    #[instrument(skip(self, filter))]
    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let mut subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, tenant_id, environment_id, customer_id, plan_id, status, currency,
                   start_date, end_date, cancelled_at, billing_anchor, current_period_start,
                   current_period_end, billing_period, billing_period_count
            FROM subscriptions
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR customer_id = ANY($3))
              AND (cardinality($4::text[]) = 0 OR id = ANY($4))
              AND (cardinality($5::text[]) = 0 OR status = ANY($5))
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(&filter.customer_ids)
        .bind(&filter.subscription_ids)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list subscriptions: {}", e))
        })?;

        if filter.with_line_items && !subscriptions.is_empty() {
            let ids: Vec<String> = subscriptions.iter().map(|s| s.id.clone()).collect();
            let line_items = sqlx::query_as::<_, SubscriptionLineItem>(&format!(
                r#"
                SELECT {LINE_ITEM_COLUMNS}
                FROM subscription_line_items
                WHERE tenant_id = $1 AND environment_id = $2 AND subscription_id = ANY($3)
                ORDER BY id
                "#
            ))
            .bind(tenant_id)
            .bind(environment_id)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to list subscription line items: {}",
                    e
                ))
            })?;

            let mut by_subscription: HashMap<String, Vec<SubscriptionLineItem>> = HashMap::new();
            for item in line_items {
                by_subscription
                    .entry(item.subscription_id.clone())
                    .or_default()
                    .push(item);
            }
            for subscription in &mut subscriptions {
                subscription.line_items = by_subscription
                    .remove(&subscription.id)
                    .unwrap_or_default();
            }
        }

        timer.observe_duration();
        Ok(subscriptions)
    }
}

#[async_trait]
impl LineItemRepository for Database {
    #[instrument(skip(self, filter))]
    async fn list_line_items(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListLineItemsFilter,
    ) -> Result<Vec<SubscriptionLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_line_items"])
            .start_timer();

        let line_items = sqlx::query_as::<_, SubscriptionLineItem>(&format!(
            r#"
            SELECT {LINE_ITEM_COLUMNS}
            FROM subscription_line_items
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR customer_id = ANY($3))
              AND (cardinality($4::text[]) = 0 OR subscription_id = ANY($4))
              AND (cardinality($5::text[]) = 0 OR meter_id = ANY($5))
              AND ($6::timestamptz IS NULL OR (
                    status = 'active'
                    AND start_date <= $6
                    AND (end_date IS NULL OR end_date > $6)))
            ORDER BY id
            "#
        ))
        .bind(tenant_id)
        .bind(environment_id)
        .bind(&filter.customer_ids)
        .bind(&filter.subscription_ids)
        .bind(&filter.meter_ids)
        .bind(filter.active_at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list line items: {}", e)))?;

        timer.observe_duration();
        Ok(line_items)
    }
}

// -------------------------------------------------------------------------
// Catalog Operations
// -------------------------------------------------------------------------

#[async_trait]
impl PriceRepository for Database {
    #[instrument(skip(self, filter))]
    async fn list_prices(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListPricesFilter,
    ) -> Result<Vec<Price>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_prices"])
            .start_timer();

        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let prices = sqlx::query_as::<_, Price>(
            r#"
            SELECT id, tenant_id, environment_id, amount, currency, price_type, billing_model,
                   tier_mode, tiers, transform_quantity, meter_id, entity_type, entity_id,
                   parent_price_id, status, end_date
            FROM prices
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR id = ANY($3))
              AND (cardinality($4::text[]) = 0 OR meter_id = ANY($4))
              AND (cardinality($5::text[]) = 0 OR status = ANY($5))
              AND ($6 OR end_date IS NULL OR end_date > NOW())
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(&filter.price_ids)
        .bind(&filter.meter_ids)
        .bind(&statuses)
        .bind(filter.allow_expired)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list prices: {}", e)))?;

        timer.observe_duration();
        Ok(prices)
    }
}

#[async_trait]
impl MeterRepository for Database {
    #[instrument(skip(self, filter))]
    async fn list_meters(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListMetersFilter,
    ) -> Result<Vec<Meter>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_meters"])
            .start_timer();

        let meters = sqlx::query_as::<_, Meter>(
            r#"
            SELECT id, tenant_id, environment_id, name, event_name, aggregation, filters
            FROM meters
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR id = ANY($3))
              AND ($4::text IS NULL OR event_name = $4)
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(&filter.meter_ids)
        .bind(filter.event_name.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list meters: {}", e)))?;

        timer.observe_duration();
        Ok(meters)
    }
}

#[async_trait]
impl FeatureRepository for Database {
    #[instrument(skip(self, filter))]
    async fn list_features(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListFeaturesFilter,
    ) -> Result<Vec<Feature>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_features"])
            .start_timer();

        let features = sqlx::query_as::<_, Feature>(
            r#"
            SELECT id, tenant_id, environment_id, name, meter_id, unit_singular, unit_plural
            FROM features
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR id = ANY($3))
              AND (cardinality($4::text[]) = 0 OR meter_id = ANY($4))
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(&filter.feature_ids)
        .bind(&filter.meter_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list features: {}", e)))?;

        timer.observe_duration();
        Ok(features)
    }
}

#[async_trait]
impl PlanRepository for Database {
    #[instrument(skip(self, plan_ids))]
    async fn list_plans(
        &self,
        tenant_id: &str,
        environment_id: &str,
        plan_ids: &[String],
    ) -> Result<Vec<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plans"])
            .start_timer();

        let plans = sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, tenant_id, environment_id, name
            FROM plans
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR id = ANY($3))
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(plan_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list plans: {}", e)))?;

        timer.observe_duration();
        Ok(plans)
    }
}

#[async_trait]
impl AddonRepository for Database {
    #[instrument(skip(self, addon_ids))]
    async fn list_addons(
        &self,
        tenant_id: &str,
        environment_id: &str,
        addon_ids: &[String],
    ) -> Result<Vec<Addon>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_addons"])
            .start_timer();

        let addons = sqlx::query_as::<_, Addon>(
            r#"
            SELECT id, tenant_id, environment_id, name
            FROM addons
            WHERE tenant_id = $1 AND environment_id = $2
              AND (cardinality($3::text[]) = 0 OR id = ANY($3))
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(addon_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list addons: {}", e)))?;

        timer.observe_duration();
        Ok(addons)
    }
}

#[async_trait]
impl SettingsRepository for Database {
    #[instrument(skip(self))]
    async fn get_onboarding_config(
        &self,
        tenant_id: &str,
        environment_id: &str,
    ) -> Result<Option<WorkflowConfig>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_onboarding_config"])
            .start_timer();

        let value: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT value
            FROM environment_settings
            WHERE tenant_id = $1 AND environment_id = $2 AND key = $3
            "#,
        )
        .bind(tenant_id)
        .bind(environment_id)
        .bind(ONBOARDING_SETTINGS_KEY)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get onboarding config: {}", e))
        })?;

        timer.observe_duration();

        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                AppError::ValidationError(format!("Invalid onboarding workflow config: {}", e))
            })
    }
}

// -------------------------------------------------------------------------
// Event Operations
// -------------------------------------------------------------------------

#[async_trait]
impl EventRepository for Database {
    #[instrument(skip(self, params), fields(tenant_id = %params.tenant_id))]
    async fn find_unprocessed(
        &self,
        params: &ReprocessEventsParams,
        last_id: Option<&str>,
        last_timestamp: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> Result<Vec<Event>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_unprocessed_events"])
            .start_timer();

        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT e.id, e.tenant_id, e.environment_id, e.event_name, e.external_customer_id,
                   e.customer_id, e."timestamp", e.source, e.properties
            FROM events e
            WHERE e.tenant_id = $1 AND e.environment_id = $2
              AND ($3::text IS NULL OR e.external_customer_id = $3)
              AND ($4::text IS NULL OR e.event_name = $4)
              AND ($5::timestamptz IS NULL OR e."timestamp" >= $5)
              AND ($6::timestamptz IS NULL OR e."timestamp" <= $6)
              AND ($7::timestamptz IS NULL OR (e."timestamp", e.id) > ($7, $8::text))
              AND NOT EXISTS (
                  SELECT 1 FROM feature_usage fu
                  WHERE fu.tenant_id = e.tenant_id
                    AND fu.environment_id = e.environment_id
                    AND fu.event_id = e.id)
            ORDER BY e."timestamp", e.id
            LIMIT $9
            "#,
        )
        .bind(&params.tenant_id)
        .bind(&params.environment_id)
        .bind(params.external_customer_id.as_deref())
        .bind(params.event_name.as_deref())
        .bind(params.start_time)
        .bind(params.end_time)
        .bind(last_timestamp)
        .bind(last_id.unwrap_or_default())
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find unprocessed events: {}", e))
        })?;

        timer.observe_duration();
        Ok(events)
    }
}

// -------------------------------------------------------------------------
// Feature Usage Operations
// -------------------------------------------------------------------------

/// One grouped analytics row. `point_ts` is set for time-series rows.
#[derive(Debug, FromRow)]
struct AnalyticsRow {
    feature_id: String,
    price_id: String,
    meter_id: String,
    sub_line_item_id: String,
    subscription_id: String,
    event_name: String,
    source: Option<String>,
    properties: Json<BTreeMap<String, String>>,
    sources: Vec<String>,
    total_usage: Decimal,
    max_usage: Decimal,
    latest_usage: Decimal,
    count_unique_usage: i64,
    event_count: i64,
    point_ts: Option<DateTime<Utc>>,
}

type RowKey = (String, String, String, String, Option<String>, BTreeMap<String, String>);

impl AnalyticsRow {
    fn key(&self) -> RowKey {
        (
            self.feature_id.clone(),
            self.price_id.clone(),
            self.meter_id.clone(),
            self.sub_line_item_id.clone(),
            self.source.clone(),
            self.properties.0.clone(),
        )
    }

    fn into_point(self, usage: Decimal, window_start: Option<DateTime<Utc>>) -> Option<UsageAnalyticPoint> {
        Some(UsageAnalyticPoint {
            timestamp: self.point_ts?,
            window_start,
            usage,
            max_usage: self.max_usage,
            latest_usage: self.latest_usage,
            count_unique_usage: self.count_unique_usage.max(0) as u64,
            event_count: self.event_count.max(0) as u64,
            ..Default::default()
        })
    }
}

/// SQL expression truncating `"timestamp"` to the start of its window.
/// Fixed windows align to the Unix epoch, weeks start on Monday.
fn window_expr(size: WindowSize) -> &'static str {
    match size {
        WindowSize::Minute => r#"date_bin('1 minute', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::FifteenMinute => r#"date_bin('15 minutes', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::ThirtyMinute => r#"date_bin('30 minutes', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::Hour => r#"date_bin('1 hour', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::ThreeHour => r#"date_bin('3 hours', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::SixHour => r#"date_bin('6 hours', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::TwelveHour => r#"date_bin('12 hours', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::Day => r#"date_bin('1 day', "timestamp", TIMESTAMPTZ '1970-01-01 00:00:00+00')"#,
        WindowSize::Week => r#"(date_trunc('week', "timestamp" AT TIME ZONE 'UTC') AT TIME ZONE 'UTC')"#,
        WindowSize::Month => r#"(date_trunc('month', "timestamp" AT TIME ZONE 'UTC') AT TIME ZONE 'UTC')"#,
    }
}

/// Which rows a grouped analytics query covers.
enum FeatureScope<'a> {
    All,
    Only(&'a str),
    Excluding(Vec<String>),
}

impl Database {
    /// Grouped analytics, one row per group, or per group and point when
    /// `point` is given.
    async fn query_analytics(
        &self,
        params: &UsageAnalyticsParams,
        scope: FeatureScope<'_>,
        point: Option<WindowSize>,
    ) -> Result<Vec<AnalyticsRow>, AppError> {
        let properties = grouped_properties(&params.group_by);
        let by_source = groups_by_source(&params.group_by);

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT feature_id, price_id, meter_id, sub_line_item_id, \
             MIN(subscription_id) AS subscription_id, MIN(event_name) AS event_name, ",
        );
        qb.push(if by_source { "source" } else { "NULL::text" });
        qb.push(" AS source, jsonb_build_object(");
        for (i, name) in properties.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push_bind(name.clone());
            qb.push("::text, COALESCE(properties->>");
            qb.push_bind(name.clone());
            qb.push("::text, '')");
        }
        qb.push(
            ") AS properties, \
             ARRAY_REMOVE(ARRAY_AGG(DISTINCT source), '') AS sources, \
             SUM(qty_total) AS total_usage, \
             MAX(qty_total) AS max_usage, \
             (ARRAY_AGG(qty_total ORDER BY \"timestamp\" DESC, event_id DESC))[1] AS latest_usage, \
             COUNT(DISTINCT unique_hash) AS count_unique_usage, \
             COUNT(DISTINCT event_id) AS event_count, ",
        );
        match point {
            Some(size) => qb.push(window_expr(size)),
            None => qb.push("NULL::timestamptz"),
        };
        qb.push(" AS point_ts FROM feature_usage WHERE tenant_id = ");
        qb.push_bind(params.tenant_id.clone());
        qb.push(" AND environment_id = ");
        qb.push_bind(params.environment_id.clone());
        qb.push(" AND sign > 0");

        if !params.customer_id.is_empty() {
            qb.push(" AND customer_id = ");
            qb.push_bind(params.customer_id.clone());
        }
        if !params.external_customer_id.is_empty() {
            qb.push(" AND external_customer_id = ");
            qb.push_bind(params.external_customer_id.clone());
        }
        if !params.feature_ids.is_empty() {
            qb.push(" AND feature_id = ANY(");
            qb.push_bind(params.feature_ids.clone());
            qb.push(")");
        }
        match scope {
            FeatureScope::All => {}
            FeatureScope::Only(feature_id) => {
                qb.push(" AND feature_id = ");
                qb.push_bind(feature_id.to_string());
            }
            FeatureScope::Excluding(ids) => {
                if !ids.is_empty() {
                    qb.push(" AND NOT (feature_id = ANY(");
                    qb.push_bind(ids);
                    qb.push("))");
                }
            }
        }
        if !params.sources.is_empty() {
            qb.push(" AND source = ANY(");
            qb.push_bind(params.sources.clone());
            qb.push(")");
        }
        if let Some(start) = params.start_time {
            qb.push(" AND \"timestamp\" >= ");
            qb.push_bind(start);
        }
        if let Some(end) = params.end_time {
            qb.push(" AND \"timestamp\" < ");
            qb.push_bind(end);
        }
        for (key, values) in &params.property_filters {
            if values.is_empty() {
                continue;
            }
            qb.push(" AND properties->>");
            qb.push_bind(key.clone());
            qb.push(" = ANY(");
            qb.push_bind(values.clone());
            qb.push(")");
        }

        qb.push(" GROUP BY 1, 2, 3, 4, 7, 8");
        if point.is_some() {
            qb.push(", 15");
        }
        qb.push(" ORDER BY 1, 2, 3, 4, 7");
        if point.is_some() {
            qb.push(", 15");
        }

        qb.build_query_as::<AnalyticsRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to get detailed usage analytics: {}",
                    e
                ))
            })
    }
}

fn analytic_from_row(row: AnalyticsRow) -> DetailedUsageAnalytic {
    let mut item = DetailedUsageAnalytic::new(
        row.feature_id,
        row.price_id,
        row.meter_id,
        row.sub_line_item_id,
    );
    item.subscription_id = row.subscription_id;
    item.event_name = row.event_name;
    item.source = row.source;
    item.properties = row.properties.0;
    item.sources = row.sources;
    item.total_usage = row.total_usage;
    item.max_usage = row.max_usage;
    item.latest_usage = row.latest_usage;
    item.count_unique_usage = row.count_unique_usage.max(0) as u64;
    item.event_count = row.event_count.max(0) as u64;
    item
}

#[async_trait]
impl FeatureUsageRepository for Database {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn bulk_insert(&self, records: &[FeatureUsage]) -> Result<usize, AppError> {
        if records.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["bulk_insert_feature_usage"])
            .start_timer();

        let mut event_ids = Vec::with_capacity(records.len());
        let mut tenant_ids = Vec::with_capacity(records.len());
        let mut environment_ids = Vec::with_capacity(records.len());
        let mut event_names = Vec::with_capacity(records.len());
        let mut external_customer_ids = Vec::with_capacity(records.len());
        let mut customer_ids = Vec::with_capacity(records.len());
        let mut timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut properties = Vec::with_capacity(records.len());
        let mut subscription_ids = Vec::with_capacity(records.len());
        let mut line_item_ids = Vec::with_capacity(records.len());
        let mut price_ids = Vec::with_capacity(records.len());
        let mut meter_ids = Vec::with_capacity(records.len());
        let mut feature_ids = Vec::with_capacity(records.len());
        let mut period_ids: Vec<i64> = Vec::with_capacity(records.len());
        let mut hashes = Vec::with_capacity(records.len());
        let mut quantities: Vec<Decimal> = Vec::with_capacity(records.len());
        let mut signs: Vec<i32> = Vec::with_capacity(records.len());

        for record in records {
            let event = &record.event;
            event_ids.push(event.id.clone());
            tenant_ids.push(event.tenant_id.clone());
            environment_ids.push(event.environment_id.clone());
            event_names.push(event.event_name.clone());
            external_customer_ids.push(event.external_customer_id.clone());
            customer_ids.push(event.customer_id.clone());
            timestamps.push(event.timestamp);
            sources.push(event.source.clone());
            properties.push(serde_json::to_value(&event.properties).map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to encode properties: {}", e))
            })?);
            subscription_ids.push(record.subscription_id.clone());
            line_item_ids.push(record.sub_line_item_id.clone());
            price_ids.push(record.price_id.clone());
            meter_ids.push(record.meter_id.clone());
            feature_ids.push(record.feature_id.clone());
            period_ids.push(i64::try_from(record.period_id).unwrap_or(i64::MAX));
            hashes.push(record.unique_hash.clone());
            quantities.push(record.qty_total);
            signs.push(record.sign);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO feature_usage (
                event_id, tenant_id, environment_id, event_name, external_customer_id,
                customer_id, "timestamp", source, properties, subscription_id,
                sub_line_item_id, price_id, meter_id, feature_id, period_id, unique_hash,
                qty_total, sign
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[],
                $7::timestamptz[], $8::text[], $9::jsonb[], $10::text[], $11::text[],
                $12::text[], $13::text[], $14::text[], $15::bigint[], $16::text[],
                $17::numeric[], $18::int[]
            )
            ON CONFLICT (tenant_id, environment_id, sub_line_item_id, unique_hash) DO NOTHING
            "#,
        )
        .bind(&event_ids)
        .bind(&tenant_ids)
        .bind(&environment_ids)
        .bind(&event_names)
        .bind(&external_customer_ids)
        .bind(&customer_ids)
        .bind(&timestamps)
        .bind(&sources)
        .bind(&properties)
        .bind(&subscription_ids)
        .bind(&line_item_ids)
        .bind(&price_ids)
        .bind(&meter_ids)
        .bind(&feature_ids)
        .bind(&period_ids)
        .bind(&hashes)
        .bind(&quantities)
        .bind(&signs)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert feature usage: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, params, max_bucket_features, sum_bucket_features), fields(tenant_id = %params.tenant_id))]
    async fn get_detailed_usage_analytics(
        &self,
        params: &UsageAnalyticsParams,
        max_bucket_features: &BucketFeatures,
        sum_bucket_features: &BucketFeatures,
    ) -> Result<Vec<DetailedUsageAnalytic>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_detailed_usage_analytics"])
            .start_timer();

        let totals = self
            .query_analytics(params, FeatureScope::All, None)
            .await?;

        let mut order: Vec<RowKey> = Vec::with_capacity(totals.len());
        let mut items: HashMap<RowKey, DetailedUsageAnalytic> = HashMap::new();
        for row in totals {
            let key = row.key();
            order.push(key.clone());
            items.insert(key, analytic_from_row(row));
        }

        // Bucketed features: one point per bucket, tagged with the request window.
        let bucketed = max_bucket_features
            .values()
            .map(|info| (info, AggregationType::Max))
            .chain(
                sum_bucket_features
                    .values()
                    .map(|info| (info, AggregationType::Sum)),
            );
        for (info, aggregation) in bucketed {
            let rows = self
                .query_analytics(params, FeatureScope::Only(&info.feature_id), Some(info.bucket_size))
                .await?;
            for row in rows {
                let Some(item) = items.get_mut(&row.key()) else {
                    continue;
                };
                let usage = if aggregation == AggregationType::Max {
                    row.max_usage
                } else {
                    row.total_usage
                };
                let window_start = row
                    .point_ts
                    .and_then(|ts| params.window_size.map(|w| w.truncate(ts)));
                item.aggregation_type = aggregation;
                if let Some(point) = row.into_point(usage, window_start) {
                    item.points.push(point);
                }
            }
        }
        for item in items.values_mut() {
            if !item.points.is_empty()
                && (max_bucket_features.contains_key(&item.feature_id)
                    || sum_bucket_features.contains_key(&item.feature_id))
            {
                item.total_usage = item.points.iter().map(|p| p.usage).sum();
                item.max_usage = item
                    .points
                    .iter()
                    .map(|p| p.usage)
                    .fold(Decimal::ZERO, Decimal::max);
            }
        }

        if let Some(window) = params.window_size {
            let excluded: Vec<String> = max_bucket_features
                .keys()
                .chain(sum_bucket_features.keys())
                .cloned()
                .collect();
            let rows = self
                .query_analytics(params, FeatureScope::Excluding(excluded), Some(window))
                .await?;
            for row in rows {
                let Some(item) = items.get_mut(&row.key()) else {
                    continue;
                };
                let usage = row.total_usage;
                if let Some(point) = row.into_point(usage, None) {
                    item.points.push(point);
                }
            }
        }

        timer.observe_duration();

        Ok(order
            .into_iter()
            .filter_map(|key| items.remove(&key))
            .collect())
    }
}
