use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use tokio::sync::Mutex;

use super::PaymentProviderError;

/// Bearer token as returned by a provider's OAuth endpoint.
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Caches one provider bearer token and refreshes it `margin` before expiry.
///
/// The lock is held across the refresh, so concurrent callers that find the
/// token stale wait for the single in-flight fetch instead of each starting
/// their own.
#[derive(Debug)]
pub struct TokenCache {
    provider: &'static str,
    slot: Mutex<Option<CachedToken>>,
    margin: Duration,
}

impl TokenCache {
    pub fn new(provider: &'static str, margin_secs: i64) -> Self {
        Self {
            provider,
            slot: Mutex::new(None),
            margin: Duration::try_seconds(margin_secs.max(0)).unwrap_or_else(Duration::zero),
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, PaymentProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedToken, PaymentProviderError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at - self.margin > Utc::now() {
                return Ok(cached.value.clone());
            }
        }

        let fresh = fetch().await?;
        let expires_at = Duration::try_seconds(fresh.expires_in)
            .filter(|lifetime| *lifetime > Duration::zero())
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| PaymentProviderError::InvalidResponse {
                provider: self.provider,
                message: format!("token expires_in out of range: {}", fresh.expires_in),
            })?;
        let value = fresh.access_token.clone();
        *slot = Some(CachedToken {
            value: fresh.access_token,
            expires_at,
        });
        Ok(value)
    }
}
