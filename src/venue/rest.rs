use std::future::Future;
use std::time::Duration;

use crate::config::ExchangeCreds;
use crate::error::VenueError;
use crate::venue::VenueKind;

/// Shared REST plumbing for both venue adapters: an HTTP client, the venue's
/// base URL/credentials, and the retrying-call wrapper from §4.1/§7
/// ("every venue call through a retrying wrapper, max 2-3 attempts,
/// exponential backoff base 0.3s, cap 10s"). `venue_a`/`venue_b` hold one of
/// these and add venue-specific request construction on top.
#[derive(Clone)]
pub struct RestVenueAdapter {
    pub kind: VenueKind,
    pub client: reqwest::Client,
    pub base_url: String,
    pub creds: ExchangeCreds,
}

impl RestVenueAdapter {
    pub fn new(kind: VenueKind, base_url: impl Into<String>, creds: ExchangeCreds) -> Self {
        Self {
            kind,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            creds,
        }
    }

    pub fn api_key(&self) -> &str {
        self.creds.api_key.as_deref().unwrap_or_default()
    }

    pub fn secret(&self) -> &str {
        self.creds.secret.as_deref().unwrap_or_default()
    }

    /// Retries `attempts` times with exponential backoff starting at 300ms,
    /// capped at 10s, only for errors `VenueError::is_transient()` flags as
    /// worth retrying. Terminal errors return immediately.
    pub async fn retry<T, F, Fut>(&self, attempts: u32, mut f: F) -> Result<T, VenueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        let mut backoff = Duration::from_millis(300);
        let cap = Duration::from_secs(10);
        let mut last_err = VenueError::Network("no attempts made".to_string());
        for attempt in 0..attempts {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = e;
                    if !last_err.is_transient() || attempt + 1 == attempts {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
        Err(last_err)
    }
}

pub fn map_reqwest_err(e: reqwest::Error) -> VenueError {
    if e.is_timeout() || e.is_connect() {
        VenueError::Network(e.to_string())
    } else {
        VenueError::Network(e.to_string())
    }
}
