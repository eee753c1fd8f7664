//! Postgres outcome reader and calibration writer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricing_engine::{DatabaseConfig, OutletCalibration};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::error::Result;
use crate::store::{run_entries, CalibrationSink, OutcomeStore, WinningBid};

pub struct PgCalibrationStore {
    pool: PgPool,
}

impl PgCalibrationStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!("Connected to calibration database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutcomeStore for PgCalibrationStore {
    async fn winning_bids(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<WinningBid>> {
        let rows = sqlx::query(
            r#"
            SELECT o.outlet_name, b.amount, b.decided_at
            FROM bids b
            JOIN opportunities o ON o.id = b.opportunity_id
            WHERE b.is_winner
              AND b.decided_at >= $1
              AND b.decided_at < $2
            ORDER BY o.outlet_name, b.decided_at, b.id
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(WinningBid {
                    outlet: row.try_get("outlet_name")?,
                    amount: row.try_get("amount")?,
                    decided_at: row.try_get("decided_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CalibrationSink for PgCalibrationStore {
    async fn write_calibrations(&self, calibrations: &[OutletCalibration], ran_at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in run_entries(calibrations, ran_at) {
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
