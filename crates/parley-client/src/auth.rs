//! Bearer credential supply.
//!
//! [`TokenSource`] is the seam to the surrounding application's
//! authentication layer. [`CachedTokens`] decorates any source with a short
//! TTL so rapid reconnects and bursts of fetches do not refetch the
//! credential every time.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Default credential cache TTL.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Errors raised while obtaining a bearer credential.
///
/// Never fatal to a session: a connect attempt proceeds without the
/// credential so the server rejects it uniformly, and fetches surface the
/// failure per request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The credential could not be obtained.
    #[error("credential unavailable: {0}")]
    Unavailable(String),

    /// The provider requires the user to re-authenticate interactively.
    #[error("re-authentication required")]
    ReauthenticationRequired,
}

/// Supplies a short-lived bearer credential on demand.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Current bearer credential.
    async fn bearer_token(&self) -> Result<String, AuthError>;
}

/// A fixed credential. Useful for tests and long-lived service tokens.
#[derive(Debug, Clone)]
pub struct StaticTokens(String);

impl StaticTokens {
    /// Wrap a fixed credential string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticTokens {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Caching decorator around a [`TokenSource`].
///
/// A fetched credential is reused until the TTL elapses. Failures are not
/// cached; the next call asks the source again.
pub struct CachedTokens {
    source: Box<dyn TokenSource>,
    ttl: Duration,
    cached: Mutex<Option<(String, Instant)>>,
}

impl CachedTokens {
    /// Wrap a source with the default TTL.
    pub fn new(source: impl TokenSource) -> Self {
        Self::with_ttl(source, DEFAULT_TOKEN_TTL)
    }

    /// Wrap a source with a custom TTL.
    pub fn with_ttl(source: impl TokenSource, ttl: Duration) -> Self {
        Self { source: Box::new(source), ttl, cached: Mutex::new(None) }
    }

    /// Current bearer credential, from cache when fresh.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;

        if let Some((token, fetched_at)) = cached.as_ref()
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(token.clone());
        }

        let token = self.source.bearer_token().await?;
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}
