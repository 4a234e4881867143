//! SQLite state manager

use super::records::{RelayRecord, TransferRecord, TransferStatus};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::Cursor;
use crate::types::IntentId;

use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// State manager for SQLite persistence
pub struct StateManager {
    pool: SqlitePool,
    /// Per-transfer write locks: every read-modify-write holds its id's lock.
    /// Entries are dropped once the transfer is terminal and nobody waits.
    transfer_locks: DashMap<IntentId, Arc<Mutex<()>>>,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        // Every in-memory connection is its own database; keep exactly one alive.
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let (max, min) = if in_memory {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            transfer_locks: DashMap::new(),
        })
    }

    /// Connect to a fresh in-memory database with migrations applied
    pub async fn in_memory() -> BridgeResult<Self> {
        let manager = Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        })
        .await?;
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                source_chain TEXT NOT NULL,
                target_chain TEXT NOT NULL,
                sender TEXT NOT NULL,
                token TEXT NOT NULL,
                amount TEXT NOT NULL,
                receiver TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                lock_block INTEGER,
                refunded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers (status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relays (
                intent_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                destination_tx TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listener_checkpoints (
                chain TEXT PRIMARY KEY,
                source_instance TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // Transfers

    /// Insert a new transfer; `AlreadyExists` if the id is taken
    pub async fn insert_transfer(&self, record: &TransferRecord) -> BridgeResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers
                (id, source_chain, target_chain, sender, token, amount, receiver,
                 status, error, lock_block, refunded, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.source_chain)
        .bind(&record.target_chain)
        .bind(record.sender.to_string())
        .bind(record.token.to_string())
        .bind(record.amount.to_string())
        .bind(&record.receiver)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.lock_block.map(|b| b as i64))
        .bind(record.refunded)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::AlreadyExists(record.id.clone()));
        }
        debug!("Stored transfer {}", record.id);
        Ok(())
    }

    pub async fn get_transfer(&self, id: &IntentId) -> BridgeResult<Option<TransferRecord>> {
        let row = sqlx::query("SELECT * FROM transfers WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(transfer_from_row).transpose()
    }

    pub async fn transfers_in_status(
        &self,
        status: TransferStatus,
    ) -> BridgeResult<Vec<TransferRecord>> {
        let rows = sqlx::query("SELECT * FROM transfers WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(transfer_from_row).collect()
    }

    /// Read-modify-write a transfer under its per-id lock
    pub async fn update_transfer<F>(&self, id: &IntentId, apply: F) -> BridgeResult<TransferRecord>
    where
        F: FnOnce(&mut TransferRecord) -> BridgeResult<()>,
    {
        let lock = self
            .transfer_locks
            .entry(id.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let mut record = self
            .get_transfer(id)
            .await?
            .ok_or_else(|| BridgeError::IntentNotFound(id.clone()))?;
        apply(&mut record)?;
        record.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE transfers
            SET status = ?, error = ?, lock_block = ?, refunded = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.lock_block.map(|b| b as i64))
        .bind(record.refunded)
        .bind(record.updated_at)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if record.status.is_terminal() {
            // Ours plus the map's: no other writer holds or waits on it
            self.transfer_locks
                .remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
        }

        Ok(record)
    }

    /// Number of transfer ids with a live write lock
    pub fn tracked_transfers(&self) -> usize {
        self.transfer_locks.len()
    }

    /// Move a transfer forward, recording `error` when given
    pub async fn transition(
        &self,
        id: &IntentId,
        next: TransferStatus,
        error: Option<String>,
    ) -> BridgeResult<TransferRecord> {
        let record = self
            .update_transfer(id, |record| {
                if !record.status.can_transition_to(next) {
                    return Err(BridgeError::InvalidStateTransition {
                        from: record.status.to_string(),
                        to: next.to_string(),
                    });
                }
                record.status = next;
                if error.is_some() {
                    record.error = error;
                }
                Ok(())
            })
            .await?;

        debug!("Transfer {} -> {}", id, next);
        Ok(record)
    }

    // Relays

    pub async fn upsert_relay(&self, record: &RelayRecord) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relays (intent_id, state, attempts, destination_tx, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (intent_id)
            DO UPDATE SET state = excluded.state, attempts = excluded.attempts,
                          destination_tx = excluded.destination_tx,
                          last_error = excluded.last_error, updated_at = excluded.updated_at
            "#,
        )
        .bind(record.intent_id.as_str())
        .bind(record.state.as_str())
        .bind(record.attempts as i64)
        .bind(record.destination_tx.map(|h| h.to_string()))
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_relay(&self, id: &IntentId) -> BridgeResult<Option<RelayRecord>> {
        let row = sqlx::query("SELECT * FROM relays WHERE intent_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(relay_from_row).transpose()
    }

    /// Every persisted relay, any state
    pub async fn all_relays(&self) -> BridgeResult<Vec<RelayRecord>> {
        let rows = sqlx::query("SELECT * FROM relays")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(relay_from_row).collect()
    }

    // Checkpoints

    /// Get the last settled event position for a chain
    pub async fn get_checkpoint(&self, chain: &str) -> BridgeResult<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT source_instance, block_number, log_index
            FROM listener_checkpoints
            WHERE chain = ?
            "#,
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> BridgeResult<Checkpoint> {
            Ok(Checkpoint {
                source_instance: r.try_get("source_instance")?,
                cursor: (
                    r.try_get::<i64, _>("block_number")? as u64,
                    r.try_get::<i64, _>("log_index")? as u32,
                ),
            })
        })
        .transpose()
    }

    pub async fn save_checkpoint(
        &self,
        chain: &str,
        source_instance: &str,
        cursor: Cursor,
    ) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listener_checkpoints
                (chain, source_instance, block_number, log_index, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (chain)
            DO UPDATE SET source_instance = excluded.source_instance,
                          block_number = excluded.block_number,
                          log_index = excluded.log_index, updated_at = excluded.updated_at
            "#,
        )
        .bind(chain)
        .bind(source_instance)
        .bind(cursor.0 as i64)
        .bind(cursor.1 as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: {:?}", chain, cursor);
        Ok(())
    }

    /// Get transfer statistics
    pub async fn get_stats(&self) -> BridgeResult<TransferStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM transfers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let dead_letters: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM relays WHERE state = 'dead_letter'")
                .fetch_one(&self.pool)
                .await?;

        Ok(TransferStats {
            pending: row.try_get::<i64, _>("pending")? as u64,
            processing: row.try_get::<i64, _>("processing")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            dead_letters: dead_letters as u64,
        })
    }
}

fn parse_field<T: FromStr>(value: &str, field: &str) -> BridgeResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| BridgeError::Internal(format!("corrupt {} {:?}: {}", field, value, e)))
}

fn transfer_from_row(row: &SqliteRow) -> BridgeResult<TransferRecord> {
    let id: String = row.try_get("id")?;
    let sender: String = row.try_get("sender")?;
    let token: String = row.try_get("token")?;
    let amount: String = row.try_get("amount")?;
    let status: String = row.try_get("status")?;
    let lock_block: Option<i64> = row.try_get("lock_block")?;

    Ok(TransferRecord {
        id: IntentId::from(id),
        source_chain: row.try_get("source_chain")?,
        target_chain: row.try_get("target_chain")?,
        sender: parse_field::<Address>(&sender, "sender")?,
        token: parse_field::<Address>(&token, "token")?,
        amount: parse_field::<u128>(&amount, "amount")?,
        receiver: row.try_get("receiver")?,
        status: status.parse()?,
        error: row.try_get("error")?,
        lock_block: lock_block.map(|b| b as u64),
        refunded: row.try_get("refunded")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn relay_from_row(row: &SqliteRow) -> BridgeResult<RelayRecord> {
    let intent_id: String = row.try_get("intent_id")?;
    let state: String = row.try_get("state")?;
    let destination_tx: Option<String> = row.try_get("destination_tx")?;

    Ok(RelayRecord {
        intent_id: IntentId::from(intent_id),
        state: state.parse()?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        destination_tx: destination_tx
            .map(|h| parse_field::<B256>(&h, "destination_tx"))
            .transpose()?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

/// Listener position, valid only for the event log it was taken from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub source_instance: String,
    pub cursor: Cursor,
}

/// Transfer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letters: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayState;

    fn record(id: &str) -> TransferRecord {
        TransferRecord::new(
            IntentId::from(id),
            "ethereum",
            "near",
            Address::repeat_byte(0x33),
            Address::repeat_byte(0xaa),
            u128::MAX - 1,
            "alice.near",
        )
    }

    #[tokio::test]
    async fn test_transfer_round_trip() {
        let state = StateManager::in_memory().await.unwrap();
        let original = record("42");
        state.insert_transfer(&original).await.unwrap();

        let stored = state.get_transfer(&IntentId::from("42")).await.unwrap().unwrap();
        assert_eq!(stored.amount, u128::MAX - 1);
        assert_eq!(stored.sender, original.sender);
        assert_eq!(stored.status, TransferStatus::Pending);
        assert!(state.get_transfer(&IntentId::from("43")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let state = StateManager::in_memory().await.unwrap();
        state.insert_transfer(&record("1")).await.unwrap();
        assert!(matches!(
            state.insert_transfer(&record("1")).await,
            Err(BridgeError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_transitions_are_forward_only() {
        let state = StateManager::in_memory().await.unwrap();
        let id = IntentId::from("1");
        state.insert_transfer(&record("1")).await.unwrap();

        state.transition(&id, TransferStatus::Processing, None).await.unwrap();
        let failed = state
            .transition(&id, TransferStatus::Failed, Some("lock timed out".into()))
            .await
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("lock timed out"));

        assert!(matches!(
            state.transition(&id, TransferStatus::Completed, None).await,
            Err(BridgeError::InvalidStateTransition { .. })
        ));
        assert_eq!(state.transfers_in_status(TransferStatus::Failed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        let id = IntentId::from("1");
        state.insert_transfer(&record("1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = state.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                state
                    .update_transfer(&id, |r| {
                        r.lock_block = Some(r.lock_block.unwrap_or(0) + 1);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = state.get_transfer(&id).await.unwrap().unwrap();
        assert_eq!(stored.lock_block, Some(16));
        assert_eq!(state.tracked_transfers(), 1);
    }

    #[tokio::test]
    async fn test_write_locks_released_at_terminal_status() {
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        for n in 0..8 {
            state.insert_transfer(&record(&n.to_string())).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let id = IntentId::from(n.to_string());
                state.transition(&id, TransferStatus::Processing, None).await.unwrap();
                state.transition(&id, TransferStatus::Completed, None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(state.tracked_transfers(), 0);

        // Later writes to a terminal transfer still work and clean up after themselves
        let id = IntentId::from("3");
        state
            .update_transfer(&id, |r| {
                r.refunded = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(state.get_transfer(&id).await.unwrap().unwrap().refunded);
        assert_eq!(state.tracked_transfers(), 0);

        let id = IntentId::from("pending");
        state.insert_transfer(&record("pending")).await.unwrap();
        state.transition(&id, TransferStatus::Processing, None).await.unwrap();
        assert_eq!(state.tracked_transfers(), 1);
    }

    #[tokio::test]
    async fn test_relays_and_checkpoints() {
        let state = StateManager::in_memory().await.unwrap();
        let id = IntentId::from("7");
        let mut relay = RelayRecord::in_flight(id.clone());
        state.upsert_relay(&relay).await.unwrap();

        relay.state = RelayState::Delivered;
        relay.attempts = 2;
        relay.destination_tx = Some(B256::repeat_byte(0x01));
        state.upsert_relay(&relay).await.unwrap();

        let stored = state.get_relay(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, RelayState::Delivered);
        assert_eq!(stored.destination_tx, Some(B256::repeat_byte(0x01)));
        assert_eq!(state.all_relays().await.unwrap().len(), 1);

        assert_eq!(state.get_checkpoint("ethereum").await.unwrap(), None);
        state.save_checkpoint("ethereum", "a", (12, 3)).await.unwrap();
        state.save_checkpoint("ethereum", "b", (2, 0)).await.unwrap();
        assert_eq!(
            state.get_checkpoint("ethereum").await.unwrap(),
            Some(Checkpoint {
                source_instance: "b".to_string(),
                cursor: (2, 0),
            })
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let state = StateManager::in_memory().await.unwrap();
        state.insert_transfer(&record("1")).await.unwrap();
        state.insert_transfer(&record("2")).await.unwrap();
        state
            .transition(&IntentId::from("2"), TransferStatus::Processing, None)
            .await
            .unwrap();

        let stats = state.get_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.dead_letters, 0);
    }
}
