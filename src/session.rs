use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::blob::{BlobError, BlobResult};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Per-call context handed to every repository and index operation.
///
/// Nothing here is global: two sessions against the same repository can use
/// different timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub timeout: Duration,
    pub read_retries: u32,
    pub retry_backoff: Duration,
    pub actor: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            read_retries: DEFAULT_READ_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            actor: None,
        }
    }
}

impl Session {
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_read_retries(self, read_retries: u32) -> Self {
        Self {
            read_retries,
            ..self
        }
    }

    pub fn with_actor(self, actor: &str) -> Self {
        Self {
            actor: Some(actor.to_string()),
            ..self
        }
    }

    /// Run a single backend call under this session's timeout.
    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> BlobResult<T>
    where
        Fut: Future<Output = BlobResult<T>>,
    {
        match timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BlobError::Timeout {
                operation: operation.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Run a pure read, retrying transient failures with a linear backoff.
    pub async fn read<T, F, Fut>(&self, operation: &str, mut f: F) -> BlobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BlobResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.call(operation, f()).await {
                Err(e) if e.is_transient() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!("Retrying {operation} (attempt {attempt}) after error: {e}");
                    sleep(self.retry_backoff * attempt).await;
                }
                result => return result,
            }
        }
    }

    /// Run a write. Writes are never retried: re-applying a read-modify-write
    /// could overwrite someone else's newer state with stale data.
    pub async fn write<T, Fut>(&self, operation: &str, fut: Fut) -> BlobResult<T>
    where
        Fut: Future<Output = BlobResult<T>>,
    {
        debug!(actor = ?self.actor, "{operation}");
        self.call(operation, fut).await
    }
}
