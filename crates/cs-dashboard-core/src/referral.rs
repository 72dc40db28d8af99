use alloy_primitives::Address;
use anyhow::{Context, Result};
use cs_storage::{ReferralRecord, ReferralStore};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The referrer this profile arrived with.
///
/// Seeded from a `ref=<address>` query parameter on first visit and kept in
/// the store until a referred purchase goes through.
pub struct ReferralBook {
    store: Arc<dyn ReferralStore>,
    profile: String,
    current: Mutex<Option<Address>>,
}

/// Extracts the `ref` parameter. Accepts a bare query (`ref=0x..&a=b`), one
/// with a leading `?`, or a full URL.
pub fn referrer_from_query(query: &str) -> Option<std::result::Result<Address, String>> {
    let query = match url::Url::parse(query) {
        Ok(url) => url.query().unwrap_or_default().to_owned(),
        Err(_) => query.trim_start_matches('?').to_owned(),
    };
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "ref")
        .map(|(_, value)| value.trim().parse::<Address>().map_err(|_| value.into_owned()))
}

impl ReferralBook {
    /// Loads whatever referrer the store already holds for `profile`.
    pub async fn load(store: Arc<dyn ReferralStore>, profile: impl Into<String>) -> Result<Self> {
        let profile = profile.into();
        let stored = store
            .load_referrer(&profile)
            .await
            .with_context(|| format!("failed to load referrer for profile {profile}"))?;
        if let Some(record) = &stored {
            info!("profile {} carries referrer {}", profile, record.referrer);
        }
        Ok(Self {
            store,
            profile,
            current: Mutex::new(stored.map(|record| record.referrer)),
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub async fn current(&self) -> Option<Address> {
        *self.current.lock().await
    }

    /// Seeds the referrer from a page query. The first referrer a profile
    /// sees is kept; later ones and malformed addresses are ignored.
    pub async fn seed_from_query(&self, query: &str) -> Result<Option<Address>> {
        let mut current = self.current.lock().await;
        let referrer = match referrer_from_query(query) {
            None => return Ok(*current),
            Some(Err(raw)) => {
                warn!("ignoring malformed referral address {:?}", raw);
                return Ok(*current);
            }
            Some(Ok(referrer)) => referrer,
        };

        if let Some(existing) = *current {
            if existing != referrer {
                info!("profile {} keeps referrer {}, ignoring {}", self.profile, existing, referrer);
            }
            return Ok(Some(existing));
        }

        let record = ReferralRecord {
            referrer,
            recorded_at_epoch_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
        };
        self.store
            .save_referrer(&self.profile, &record)
            .await
            .context("failed to persist referrer")?;
        info!("profile {} referred by {}", self.profile, referrer);
        *current = Some(referrer);
        Ok(Some(referrer))
    }

    /// The referrer to attach to a purchase by `buyer`, if any.
    pub async fn referrer_for(&self, buyer: Address) -> Option<Address> {
        match self.current().await {
            Some(referrer) if referrer == buyer => {
                info!("not sending self-referral for {}", buyer);
                None
            }
            other => other,
        }
    }

    /// Drops the referrer once a referred purchase is confirmed.
    pub async fn clear(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        self.store
            .clear_referrer(&self.profile)
            .await
            .context("failed to clear referrer")?;
        *current = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use cs_storage::InMemoryReferralStore;

    const REFERRER: Address = address!("0x00000000000000000000000000000000000000e1");
    const OTHER: Address = address!("0x00000000000000000000000000000000000000e2");

    #[test]
    fn query_parsing_handles_urls_and_fragments() {
        let expected = Some(Ok(REFERRER));
        assert_eq!(referrer_from_query(&format!("ref={REFERRER}")), expected);
        assert_eq!(referrer_from_query(&format!("?utm=x&ref={REFERRER}")), expected);
        assert_eq!(
            referrer_from_query(&format!("https://cleanspark.example/?ref={REFERRER}")),
            expected
        );
        assert_eq!(referrer_from_query("utm=x"), None);
        assert_eq!(referrer_from_query("ref=0x1234"), Some(Err("0x1234".to_owned())));
    }

    #[tokio::test]
    async fn first_referrer_wins_and_survives_reload() -> Result<()> {
        let store: Arc<dyn ReferralStore> = Arc::new(InMemoryReferralStore::default());
        let book = ReferralBook::load(store.clone(), "default").await?;

        assert_eq!(book.seed_from_query("ref=not-an-address").await?, None);
        assert_eq!(book.seed_from_query(&format!("ref={REFERRER}")).await?, Some(REFERRER));
        assert_eq!(book.seed_from_query(&format!("ref={OTHER}")).await?, Some(REFERRER));

        let reloaded = ReferralBook::load(store, "default").await?;
        assert_eq!(reloaded.current().await, Some(REFERRER));
        Ok(())
    }

    #[tokio::test]
    async fn self_referral_is_dropped_and_clear_forgets() -> Result<()> {
        let store: Arc<dyn ReferralStore> = Arc::new(InMemoryReferralStore::default());
        let book = ReferralBook::load(store.clone(), "default").await?;
        book.seed_from_query(&format!("ref={REFERRER}")).await?;

        assert_eq!(book.referrer_for(REFERRER).await, None);
        assert_eq!(book.referrer_for(OTHER).await, Some(REFERRER));

        book.clear().await?;
        assert_eq!(book.current().await, None);
        assert_eq!(store.load_referrer("default").await?, None);
        Ok(())
    }
}
