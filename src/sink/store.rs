//! Remote store bindings.
//!
//! Events become rows in three Postgres tables, one per event family.
//! Inserts are idempotent via the enqueue sequence, so the at-least-once
//! delivery from the journal never duplicates rows.

use crate::config::Config;
use crate::error::SinkError;
use crate::types::{AgentEvent, QueuedEvent};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Destination for drained events. The production implementation is
/// [`EventStore`]; tests substitute an in-memory store.
#[async_trait]
pub trait RemoteStore: Send {
    async fn commit(&mut self, event: &QueuedEvent) -> Result<(), SinkError>;
}

pub struct EventStore {
    pool: PgPool,
    meter_table: String,
    aft_table: String,
    event_table: String,
    schema_ready: bool,
}

impl EventStore {
    /// Build a lazy pool; the first actual commit connects. A backend that
    /// is down at startup therefore only delays delivery, never startup.
    pub fn connect(config: &Config) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(&config.db_connection_string)
            .map_err(|e| SinkError::StoreUnavailable(e.to_string()))?;

        Ok(EventStore {
            pool,
            meter_table: config.meter_table.clone(),
            aft_table: config.aft_table.clone(),
            event_table: config.event_table.clone(),
            schema_ready: false,
        })
    }

    async fn init_schema(&self) -> Result<(), SinkError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                sequence        BIGINT PRIMARY KEY,
                asset_number    BIGINT NOT NULL,
                meter_code      INTEGER NOT NULL,
                old_value       BIGINT NOT NULL,
                new_value       BIGINT NOT NULL,
                suspect         BOOLEAN NOT NULL DEFAULT FALSE,
                observed_at     BIGINT NOT NULL
            )
            "#,
            self.meter_table
        ))
        .execute(&self.pool)
        .await
        .map_err(map_store_err)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_meter_code ON {0} (meter_code, observed_at)",
            self.meter_table
        ))
        .execute(&self.pool)
        .await
        .map_err(map_store_err)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                sequence             BIGINT PRIMARY KEY,
                transaction_id       TEXT NOT NULL,
                transfer_type        TEXT NOT NULL,
                cashable_cents       BIGINT NOT NULL,
                restricted_cents     BIGINT NOT NULL,
                nonrestricted_cents  BIGINT NOT NULL,
                status               TEXT NOT NULL,
                observed_at          BIGINT NOT NULL
            )
            "#,
            self.aft_table
        ))
        .execute(&self.pool)
        .await
        .map_err(map_store_err)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                sequence        BIGINT PRIMARY KEY,
                kind            TEXT NOT NULL,
                code            INTEGER,
                detail          TEXT NOT NULL,
                observed_at     BIGINT NOT NULL
            )
            "#,
            self.event_table
        ))
        .execute(&self.pool)
        .await
        .map_err(map_store_err)?;

        info!("remote store schema ready");
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for EventStore {
    async fn commit(&mut self, event: &QueuedEvent) -> Result<(), SinkError> {
        if !self.schema_ready {
            self.init_schema().await?;
            self.schema_ready = true;
        }

        let decoded = event
            .decode_event()
            .ok_or_else(|| SinkError::StoreWriteFailed("undecodable event body".to_string()))?;

        match decoded {
            AgentEvent::MeterChanged {
                asset_number,
                meter_code,
                old_value,
                new_value,
                suspect,
                observed_at,
                ..
            } => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO {} (sequence, asset_number, meter_code, old_value, new_value, suspect, observed_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (sequence) DO NOTHING
                    "#,
                    self.meter_table
                ))
                .bind(event.sequence as i64)
                .bind(asset_number as i64)
                .bind(meter_code as i32)
                .bind(old_value as i64)
                .bind(new_value as i64)
                .bind(suspect)
                .bind(observed_at as i64)
                .execute(&self.pool)
                .await
                .map_err(map_store_err)?;
            }
            AgentEvent::AftResult {
                transaction_id,
                transfer_type,
                cashable_cents,
                restricted_cents,
                nonrestricted_cents,
                status,
                observed_at,
            } => {
                let transfer_type =
                    serde_json::to_value(transfer_type).ok().and_then(|v| v.as_str().map(str::to_string));
                sqlx::query(&format!(
                    r#"
                    INSERT INTO {} (sequence, transaction_id, transfer_type, cashable_cents,
                                    restricted_cents, nonrestricted_cents, status, observed_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (sequence) DO NOTHING
                    "#,
                    self.aft_table
                ))
                .bind(event.sequence as i64)
                .bind(transaction_id)
                .bind(transfer_type.unwrap_or_else(|| "unknown".to_string()))
                .bind(cashable_cents as i64)
                .bind(restricted_cents as i64)
                .bind(nonrestricted_cents as i64)
                .bind(status)
                .bind(observed_at as i64)
                .execute(&self.pool)
                .await
                .map_err(map_store_err)?;
            }
            other => {
                let (kind, code) = match &other {
                    AgentEvent::EgmException { code, .. } => ("egm_exception", Some(*code as i32)),
                    AgentEvent::HandpayDetected { .. } => ("handpay_detected", None),
                    AgentEvent::JackpotReset { .. } => ("jackpot_reset", None),
                    AgentEvent::JournalPressure { .. } => ("journal_pressure", None),
                    _ => unreachable!("meter and aft events handled above"),
                };
                let detail = String::from_utf8_lossy(&event.body).to_string();
                sqlx::query(&format!(
                    r#"
                    INSERT INTO {} (sequence, kind, code, detail, observed_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (sequence) DO NOTHING
                    "#,
                    self.event_table
                ))
                .bind(event.sequence as i64)
                .bind(kind)
                .bind(code)
                .bind(detail)
                .bind(other.observed_at() as i64)
                .execute(&self.pool)
                .await
                .map_err(map_store_err)?;
            }
        }
        Ok(())
    }
}

fn map_store_err(err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            SinkError::StoreUnavailable(err.to_string())
        }
        other => SinkError::StoreWriteFailed(other.to_string()),
    }
}
