use crate::execution::ledger::LedgerSnapshot;
use crate::strategy::StrategyState;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::time::{timeout, Duration};

const CHECKPOINT_KEY: &str = "pairtrader:checkpoint";

/// Everything needed to resume trading after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: DateTime<Utc>,
    pub ledger: LedgerSnapshot,
    /// Strategy memory keyed by trading pair
    pub strategies: BTreeMap<String, StrategyState>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Latest checkpoint, or None if nothing was saved yet
    async fn load(&self) -> Result<Option<Checkpoint>>;
}

/// JSON file checkpoint, replaced atomically through a temp file
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.temp_path();

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace checkpoint {}", self.path.display()))?;

        tracing::debug!("Saved checkpoint to {}", self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read checkpoint {}", self.path.display()))
            }
        };

        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt checkpoint {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }
}

/// Redis checkpoint stored as one JSON string
pub struct RedisCheckpointStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisCheckpointStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow::anyhow!("Redis connection timeout after 5 seconds"))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: CHECKPOINT_KEY.to_string(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let value = serde_json::to_string(checkpoint)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&self.key, value).await?;

        tracing::debug!("Saved checkpoint to Redis key {}", self.key);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(&self.key).await?;

        value
            .map(|json| serde_json::from_str(&json).context("Corrupt checkpoint in Redis"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ledger::PositionRecord;
    use rust_decimal_macros::dec;

    fn checkpoint() -> Checkpoint {
        let mut ledger = LedgerSnapshot::default();
        ledger.records.insert(
            "BTCUSDT".to_string(),
            PositionRecord {
                holding: true,
                quantity_held: dec!(0.015),
                average_entry_price: dec!(64250.12),
                allocated_capital: dec!(0),
                stop_loss_price: dec!(61037.61),
                take_profit_price: dec!(0),
            },
        );
        ledger.realized_pnl = dec!(-3.5);
        ledger.trade_count = 4;

        let mut strategies = BTreeMap::new();
        strategies.insert(
            "BTCUSDT".to_string(),
            StrategyState {
                waiting_for_secondary_buy: true,
                ..StrategyState::default()
            },
        );

        Checkpoint {
            saved_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            ledger,
            strategies,
        }
    }

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pairtrader-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_file_store_missing_is_none() {
        let store = FileCheckpointStore::new(temp_file("missing"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let path = temp_file("roundtrip");
        let store = FileCheckpointStore::new(&path);
        let saved = checkpoint();

        store.save(&saved).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, saved);

        // decimals are stored as strings, not floats
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"64250.12\""));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let path = temp_file("corrupt");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileCheckpointStore::new(&path);
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("Corrupt checkpoint"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_redis_store_save_and_load() {
        let store = RedisCheckpointStore::new("redis://127.0.0.1:6379")
            .await
            .unwrap()
            .with_key(format!("pairtrader:test:{}", uuid::Uuid::new_v4()));

        assert!(store.load().await.unwrap().is_none());
        let saved = checkpoint();
        store.save(&saved).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));
    }
}
