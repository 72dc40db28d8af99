use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rocksdb::{DB, Options};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Remembers the referrer a visitor arrived with, one per browser-like
/// profile, until a referred purchase consumes it.
#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn save_referrer(&self, profile: &str, record: &ReferralRecord) -> Result<()>;
    async fn load_referrer(&self, profile: &str) -> Result<Option<ReferralRecord>>;
    async fn clear_referrer(&self, profile: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralRecord {
    pub referrer: Address,
    pub recorded_at_epoch_ms: u128,
}

#[derive(Default)]
pub struct NoopReferralStore;

#[async_trait]
impl ReferralStore for NoopReferralStore {
    async fn save_referrer(&self, _profile: &str, _record: &ReferralRecord) -> Result<()> {
        Ok(())
    }

    async fn load_referrer(&self, _profile: &str) -> Result<Option<ReferralRecord>> {
        Ok(None)
    }

    async fn clear_referrer(&self, _profile: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryReferralStore {
    entries: RwLock<HashMap<String, ReferralRecord>>,
}

#[async_trait]
impl ReferralStore for InMemoryReferralStore {
    async fn save_referrer(&self, profile: &str, record: &ReferralRecord) -> Result<()> {
        let mut guard = self.entries.write().await;
        guard.insert(profile.to_owned(), record.clone());
        Ok(())
    }

    async fn load_referrer(&self, profile: &str) -> Result<Option<ReferralRecord>> {
        let guard = self.entries.read().await;
        Ok(guard.get(profile).cloned())
    }

    async fn clear_referrer(&self, profile: &str) -> Result<()> {
        self.entries.write().await.remove(profile);
        Ok(())
    }
}

pub struct RocksDbReferralStore {
    db: Arc<DB>,
}

impl RocksDbReferralStore {
    pub fn open_default(path: &str) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)
            .with_context(|| format!("failed to open referral store at {path}"))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key_for_profile(profile: &str) -> String {
        format!("referrer:{profile}")
    }
}

#[async_trait]
impl ReferralStore for RocksDbReferralStore {
    async fn save_referrer(&self, profile: &str, record: &ReferralRecord) -> Result<()> {
        let key = Self::key_for_profile(profile);
        let value = serde_json::to_vec(record)?;
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    async fn load_referrer(&self, profile: &str) -> Result<Option<ReferralRecord>> {
        let key = Self::key_for_profile(profile);
        match self.db.get(key.as_bytes())? {
            Some(raw) => {
                let record = serde_json::from_slice::<ReferralRecord>(&raw)
                    .with_context(|| format!("corrupt referral entry for profile {profile}"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn clear_referrer(&self, profile: &str) -> Result<()> {
        let key = Self::key_for_profile(profile);
        self.db.delete(key.as_bytes())?;
        Ok(())
    }
}
