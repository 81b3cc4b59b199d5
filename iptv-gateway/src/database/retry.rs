//! Busy-retry policies for watch-record writes.
//!
//! Two writers contend for the database: session close (one row, on the
//! relay's exit path) and the flush cycle (one transaction over every open
//! session). Session close gets a short budget so a stuck database cannot
//! hold a finished relay task for long; the background batch may wait longer.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

/// SQLite primary result codes that mean "try again later".
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// How often and how long a write is retried while the database is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BusyRetry {
    /// Closing a single session's record.
    pub const FINALIZE: Self = Self {
        max_retries: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(250),
    };

    /// The flusher's checkpoint transaction.
    pub const CHECKPOINT: Self = Self {
        max_retries: 10,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_secs(2),
    };

    /// Backoff before retry number `retry` (0-based), without jitter.
    fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }

    /// Backoff plus up to 25% random jitter, never above `max_delay`.
    fn delay(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        let spread = backoff.as_millis() as u64 / 4;
        let jitter = Duration::from_millis(rand::random_range(0..=spread));
        (backoff + jitter).min(self.max_delay)
    }

    /// Run `op`, re-running it while it fails with a busy or locked error.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(err) if is_busy(&err) && retry < self.max_retries => {
                    let delay = self.delay(retry);
                    retry += 1;
                    debug!(
                        op = op_name,
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Database busy, retrying"
                    );
                    sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    if let sqlx::Error::Database(db_err) = sqlx_err {
        // Extended codes (e.g. SQLITE_BUSY_SNAPSHOT) keep the primary code in the low byte.
        let primary = db_err
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            .map(|code| code & 0xff);
        if matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED)) {
            return true;
        }
    }

    let msg = sqlx_err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locked() -> Error {
        Error::DatabaseSqlx(sqlx::Error::Protocol("database is locked".to_string()))
    }

    const FAST: BusyRetry = BusyRetry {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };

    #[tokio::test]
    async fn test_non_busy_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = FAST
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::validation("nope")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_error_is_retried() {
        let calls = AtomicUsize::new(0);
        let result = FAST
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(locked()) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = FAST
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(locked()) }
            })
            .await;

        assert!(is_busy(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = BusyRetry::FINALIZE;
        assert_eq!(policy.backoff(0), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(10), policy.max_delay);
        assert_eq!(policy.backoff(40), policy.max_delay);
        for retry in 0..12 {
            assert!(policy.delay(retry) <= policy.max_delay);
        }
    }

    #[test]
    fn test_close_budget_is_tighter_than_flush() {
        assert!(BusyRetry::FINALIZE.max_delay < BusyRetry::CHECKPOINT.max_delay);
        assert!(BusyRetry::FINALIZE.max_retries < BusyRetry::CHECKPOINT.max_retries);
    }
}
