use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::error;

use super::{CheckpointStore, StoreError};
use crate::types::{
    BridgeEvent, ChainCheckpoint, ChainName, EventId, TransferRecord, TransferStatus,
};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[derive(Debug, Clone, FromRow)]
struct CheckpointRow {
    chain: String,
    last_processed_block: i64,
}

#[derive(Debug, Clone, FromRow)]
struct TransferRow {
    event_id: String,
    event_json: String,
    message_hash: String,
    status: TransferStatus,
    dest_tx_hash: Option<String>,
    attempts: i32,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: String| {
            StoreError::Corrupt(format!("transfer {} {}: {}", row.event_id, what, e))
        };
        let event: BridgeEvent =
            serde_json::from_str(&row.event_json).map_err(|e| corrupt("event", e.to_string()))?;
        let message_hash =
            B256::from_str(&row.message_hash).map_err(|e| corrupt("message_hash", e.to_string()))?;
        let dest_tx_hash = row
            .dest_tx_hash
            .as_deref()
            .map(B256::from_str)
            .transpose()
            .map_err(|e| corrupt("dest_tx_hash", e.to_string()))?;

        Ok(TransferRecord {
            event_id: EventId::from(row.event_id.clone()),
            event,
            message_hash,
            status: row.status,
            dest_tx_hash,
            attempts: from_db_attempts(row.attempts)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error_detail: row.error_detail,
        })
    }
}

const TRANSFER_COLUMNS: &str = "event_id, event_json, message_hash, status, dest_tx_hash, \
     attempts, error_detail, created_at, updated_at";

/// Postgres backend
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn fetch_transfers(
        &self,
        sql: &str,
        context: &str,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TransferRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(context, e))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load(&self, chain: &ChainName) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT last_processed_block FROM checkpoints WHERE chain = $1",
        )
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load checkpoint", e))?;
        row.map(|(block,)| from_db_block(block)).transpose()
    }

    async fn save(&self, chain: &ChainName, block: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (chain, last_processed_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain) DO UPDATE
                SET last_processed_block = EXCLUDED.last_processed_block, updated_at = NOW()
                WHERE checkpoints.last_processed_block <= EXCLUDED.last_processed_block
            "#,
        )
        .bind(chain.as_str())
        .bind(to_db_block(block)?)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save checkpoint", e))?;

        if result.rows_affected() == 0 {
            let current = self.load(chain).await?.unwrap_or_default();
            return Err(StoreError::Regression {
                chain: chain.clone(),
                current,
                requested: block,
            });
        }
        Ok(())
    }

    async fn reset_checkpoint(&self, chain: &ChainName, block: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (chain, last_processed_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain) DO UPDATE
                SET last_processed_block = EXCLUDED.last_processed_block, updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(to_db_block(block)?)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("reset checkpoint", e))?;
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>, StoreError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT chain, last_processed_block FROM checkpoints ORDER BY chain",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list checkpoints", e))?;

        rows.into_iter()
            .map(|row| {
                Ok(ChainCheckpoint {
                    chain: ChainName::new(row.chain)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    last_processed_block: from_db_block(row.last_processed_block)?,
                })
            })
            .collect()
    }

    async fn load_transfer(&self, event_id: &EventId) -> Result<Option<TransferRecord>, StoreError> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE event_id = $1",
            TRANSFER_COLUMNS
        ))
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load transfer", e))?;
        row.map(TransferRecord::try_from).transpose()
    }

    async fn load_transfer_by_nonce(
        &self,
        chain: &ChainName,
        bridge: Address,
        nonce: u64,
    ) -> Result<Option<TransferRecord>, StoreError> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE source_chain = $1 AND source_bridge = $2 AND nonce = $3",
            TRANSFER_COLUMNS
        ))
        .bind(chain.as_str())
        .bind(format!("{:#x}", bridge))
        .bind(to_db_block(nonce)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load transfer by nonce", e))?;
        row.map(TransferRecord::try_from).transpose()
    }

    async fn transfers_by_nonce(
        &self,
        chain: &ChainName,
        nonce: u64,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE source_chain = $1 AND nonce = $2 ORDER BY source_bridge",
            TRANSFER_COLUMNS
        ))
        .bind(chain.as_str())
        .bind(to_db_block(nonce)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list transfers by nonce", e))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool, StoreError> {
        let event_json = serde_json::to_string(&record.event)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (event_id, source_chain, source_bridge, dest_chain, nonce,
                account, source_block_number, event_json, message_hash, status, dest_tx_hash,
                attempts, error_detail, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.event_id.as_str())
        .bind(record.event.source_chain.as_str())
        .bind(format!("{:#x}", record.event.source_bridge))
        .bind(record.event.dest_chain.as_str())
        .bind(to_db_block(record.nonce())?)
        .bind(format!("{:#x}", record.event.account))
        .bind(to_db_block(record.event.source_block_number)?)
        .bind(event_json)
        .bind(format!("{:#x}", record.message_hash))
        .bind(record.status)
        .bind(record.dest_tx_hash.map(|h| format!("{:#x}", h)))
        .bind(to_db_attempts(record.attempts)?)
        .bind(&record.error_detail)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert transfer", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let event_json = serde_json::to_string(&record.event)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO transfers (event_id, source_chain, source_bridge, dest_chain, nonce,
                account, source_block_number, event_json, message_hash, status, dest_tx_hash,
                attempts, error_detail, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (event_id) DO UPDATE SET
                status = EXCLUDED.status,
                dest_tx_hash = EXCLUDED.dest_tx_hash,
                attempts = EXCLUDED.attempts,
                error_detail = EXCLUDED.error_detail,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.event_id.as_str())
        .bind(record.event.source_chain.as_str())
        .bind(format!("{:#x}", record.event.source_bridge))
        .bind(record.event.dest_chain.as_str())
        .bind(to_db_block(record.nonce())?)
        .bind(format!("{:#x}", record.event.account))
        .bind(to_db_block(record.event.source_block_number)?)
        .bind(event_json)
        .bind(format!("{:#x}", record.message_hash))
        .bind(record.status)
        .bind(record.dest_tx_hash.map(|h| format!("{:#x}", h)))
        .bind(to_db_attempts(record.attempts)?)
        .bind(&record.error_detail)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert transfer", e))?;
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<TransferRecord>, StoreError> {
        self.fetch_transfers(
            &format!(
                "SELECT {} FROM transfers WHERE status IN ('pending', 'submitted') \
                 ORDER BY source_chain, nonce",
                TRANSFER_COLUMNS
            ),
            "list pending transfers",
        )
        .await
    }

    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, TransferRow>(&format!(
                    "SELECT {} FROM transfers WHERE status = $1 ORDER BY updated_at DESC LIMIT $2",
                    TRANSFER_COLUMNS
                ))
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, TransferRow>(&format!(
                    "SELECT {} FROM transfers ORDER BY updated_at DESC LIMIT $1",
                    TRANSFER_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| db_error("list transfers", e))?;

        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn list_by_account(
        &self,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE account = $1 ORDER BY updated_at DESC LIMIT $2",
            TRANSFER_COLUMNS
        ))
        .bind(format!("{:#x}", account))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list transfers by account", e))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("ping", e))?;
        Ok(())
    }
}

fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    error!(context, error = ?e, "SQL error");
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Corrupt(format!("{}: {}", context, e))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(format!("{}: {}", context, e)),
        _ => StoreError::Unavailable(format!("{}: {}", context, e)),
    }
}

fn to_db_block(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} exceeds BIGINT", value)))
}

fn from_db_block(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative block {}", value)))
}

fn to_db_attempts(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} attempts exceed INTEGER", value)))
}

fn from_db_attempts(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative attempt count {}", value)))
}
