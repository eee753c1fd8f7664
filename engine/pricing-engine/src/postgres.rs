//! Postgres implementation of the storage traits

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::info;

use crate::config::{DatabaseConfig, EngineConfig};
use crate::config_keys::{
    engine_config_entries, parse_calibrations, parse_engine_config, ENGINE_PRICE_STEP,
    ENGINE_TICK_INTERVAL_MS, OUTLET_PREFIX,
};
use crate::error::{PricingError, Result};
use crate::models::{
    OpportunityId, OpportunityPriceState, OutletCalibration, PriceCommit, PricingVariable,
    SignalReading, Tier,
};
use crate::sampler::Signal;
use crate::store::{
    ActivityStore, CalibrationStore, EngineConfigStore, PriceStateStore, VariableStore,
};

const STATE_COLUMNS: &str = "opportunity_id, outlet, tier, status, base_price, current_price, \
                             floor_price, cutoff_price, trend, last_price_update";

#[derive(Clone)]
pub struct PgPricingStore {
    pool: PgPool,
}

impl PgPricingStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!("Connected to pricing database (pool size {})", config.max_connections);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM system_config WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Count of rows in `table` for the opportunity (optionally since `since`)
    /// plus the age of the newest one
    async fn count_events(
        &self,
        table: &str,
        time_column: &str,
        opportunity_id: OpportunityId,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<SignalReading> {
        let sql = format!(
            "SELECT COUNT(*), MAX({time_column}) FROM {table} \
             WHERE opportunity_id = $1 AND ($2::timestamptz IS NULL OR {time_column} >= $2) \
             AND {time_column} <= $3"
        );

        let (count, newest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(&sql)
            .bind(opportunity_id)
            .bind(since)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PricingError::sampling(opportunity_id, e.to_string()))?;

        let age_hours = newest.map(|ts| hours_between(ts, now)).unwrap_or(0.0);
        Ok(SignalReading::new(count as f64, age_hours))
    }

    async fn opportunity_timestamp(
        &self,
        column: &str,
        opportunity_id: OpportunityId,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT {column} FROM opportunities WHERE id = $1");
        let value: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&sql)
            .bind(opportunity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PricingError::sampling(opportunity_id, e.to_string()))?;
        Ok(value.flatten())
    }
}

fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 3_600_000.0
}

fn state_from_row(row: &PgRow) -> Result<OpportunityPriceState> {
    let tier: i16 = row.try_get("tier")?;
    let tier = u8::try_from(tier)
        .map_err(|_| PricingError::Internal(format!("Invalid tier {tier} in opportunity_prices")))
        .and_then(Tier::try_from)?;
    let status: String = row.try_get("status")?;
    let trend: String = row.try_get("trend")?;

    Ok(OpportunityPriceState {
        opportunity_id: row.try_get("opportunity_id")?,
        outlet: row.try_get("outlet")?,
        current_price: row.try_get("current_price")?,
        base_price: row.try_get("base_price")?,
        floor_price: row.try_get("floor_price")?,
        cutoff_price: row.try_get("cutoff_price")?,
        tier,
        status: status.parse()?,
        last_price_update: row.try_get("last_price_update")?,
        trend: trend.parse()?,
    })
}

fn variable_from_row(row: &PgRow) -> Result<PricingVariable> {
    let nonlinear_fn: String = row.try_get("nonlinear_fn")?;
    Ok(PricingVariable {
        name: row.try_get("name")?,
        weight: row.try_get("weight")?,
        nonlinear_fn: nonlinear_fn.parse()?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl VariableStore for PgPricingStore {
    async fn load_variables(&self) -> Result<Vec<PricingVariable>> {
        let rows = sqlx::query("SELECT name, weight, nonlinear_fn, updated_at FROM pricing_variables ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(variable_from_row).collect()
    }

    async fn find_variable(&self, name: &str) -> Result<Option<PricingVariable>> {
        let row = sqlx::query("SELECT name, weight, nonlinear_fn, updated_at FROM pricing_variables WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(variable_from_row).transpose()
    }

    async fn save_variable(&self, variable: &PricingVariable) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pricing_variables (name, weight, nonlinear_fn, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                weight = EXCLUDED.weight,
                nonlinear_fn = EXCLUDED.nonlinear_fn,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&variable.name)
        .bind(variable.weight)
        .bind(variable.nonlinear_fn.as_str())
        .bind(variable.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EngineConfigStore for PgPricingStore {
    async fn load_engine_config(&self) -> Result<Option<EngineConfig>> {
        let tick_interval = self.config_value(ENGINE_TICK_INTERVAL_MS).await?;
        let price_step = self.config_value(ENGINE_PRICE_STEP).await?;

        if tick_interval.is_none() && price_step.is_none() {
            return Ok(None);
        }

        parse_engine_config(tick_interval.as_deref(), price_step.as_deref(), EngineConfig::default())
            .map(Some)
            .ok_or_else(|| PricingError::Config("Malformed engine config in system_config".to_string()))
    }

    async fn save_engine_config(&self, config: &EngineConfig) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in engine_config_entries(config) {
            sqlx::query(
                r#"
                INSERT INTO system_config (key, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PriceStateStore for PgPricingStore {
    async fn load_open_states(&self) -> Result<Vec<OpportunityPriceState>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM opportunity_prices WHERE status = 'open' ORDER BY opportunity_id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn load_all_states(&self) -> Result<Vec<OpportunityPriceState>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM opportunity_prices ORDER BY opportunity_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn find_state(&self, opportunity_id: OpportunityId) -> Result<Option<OpportunityPriceState>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM opportunity_prices WHERE opportunity_id = $1");
        let row = sqlx::query(&sql).bind(opportunity_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn insert_state(&self, state: &OpportunityPriceState) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO opportunity_prices
                (opportunity_id, outlet, tier, status, base_price, current_price,
                 floor_price, cutoff_price, trend, last_price_update)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (opportunity_id) DO NOTHING
            "#,
        )
        .bind(state.opportunity_id)
        .bind(&state.outlet)
        .bind(u8::from(state.tier) as i16)
        .bind(state.status.as_str())
        .bind(state.base_price)
        .bind(state.current_price)
        .bind(state.floor_price)
        .bind(state.cutoff_price)
        .bind(state.trend.as_str())
        .bind(state.last_price_update)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PricingError::OpportunityExists(state.opportunity_id));
        }
        Ok(())
    }

    async fn close_opportunity(&self, opportunity_id: OpportunityId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE opportunity_prices SET status = 'closed', closed_at = $2 \
             WHERE opportunity_id = $1 AND status = 'open'",
        )
        .bind(opportunity_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit_price(&self, commit: &PriceCommit) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE opportunity_prices SET
                current_price = $2,
                floor_price = $3,
                cutoff_price = $4,
                trend = $5,
                last_price_update = $6
            WHERE opportunity_id = $1 AND status = 'open' AND current_price = $7
            "#,
        )
        .bind(commit.opportunity_id)
        .bind(commit.new_price)
        .bind(commit.floor_price)
        .bind(commit.cutoff_price)
        .bind(commit.trend.as_str())
        .bind(commit.timestamp)
        .bind(commit.expected_price)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.find_state(commit.opportunity_id).await? {
            Some(_) => Ok(false),
            None => Err(PricingError::OpportunityNotFound(commit.opportunity_id)),
        }
    }

    async fn update_bounds(&self, opportunity_id: OpportunityId, floor_price: f64, cutoff_price: f64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE opportunity_prices SET floor_price = $2, cutoff_price = $3
            WHERE opportunity_id = $1 AND status = 'open'
            "#,
        )
        .bind(opportunity_id)
        .bind(floor_price)
        .bind(cutoff_price)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CalibrationStore for PgPricingStore {
    async fn load_calibrations(&self) -> Result<HashMap<String, OutletCalibration>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM system_config WHERE starts_with(key, $1)")
                .bind(OUTLET_PREFIX)
                .fetch_all(&self.pool)
                .await?;
        Ok(parse_calibrations(rows))
    }
}

#[async_trait]
impl ActivityStore for PgPricingStore {
    async fn read_signal(
        &self,
        opportunity_id: OpportunityId,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<SignalReading> {
        let day_ago = Some(now - Duration::hours(24));

        match signal {
            Signal::Bids24h => self.count_events("bids", "created_at", opportunity_id, day_ago, now).await,
            Signal::Pitches24h => {
                self.count_events("pitches", "created_at", opportunity_id, day_ago, now).await
            }
            Signal::PitchesTotal => {
                self.count_events("pitches", "created_at", opportunity_id, None, now).await
            }
            Signal::Clicks24h => {
                self.count_events("opportunity_clicks", "clicked_at", opportunity_id, day_ago, now).await
            }
            Signal::Saves24h => {
                self.count_events("opportunity_saves", "saved_at", opportunity_id, day_ago, now).await
            }
            Signal::HoursToDeadline => {
                let hours = self
                    .opportunity_timestamp("deadline_at", opportunity_id)
                    .await?
                    .map(|deadline| hours_between(now, deadline).max(0.0))
                    .unwrap_or(0.0);
                Ok(SignalReading::new(hours, 0.0))
            }
            Signal::HoursSincePosted => {
                let hours = self
                    .opportunity_timestamp("posted_at", opportunity_id)
                    .await?
                    .map(|posted| hours_between(posted, now).max(0.0))
                    .unwrap_or(0.0);
                Ok(SignalReading::new(hours, 0.0))
            }
        }
    }
}
