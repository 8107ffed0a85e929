//! Bounded, immediate retry for broker calls.

use std::future::Future;

use tracing::warn;

use crate::utils::MqError;

/// Every attempt failed, or an attempt failed with an error retrying cannot
/// fix.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub last_error: MqError,
}

impl Exhausted {
    /// Map to the operation-specific error, passing fatal errors through.
    pub fn into_error(self, op_error: impl FnOnce(u32) -> MqError) -> MqError {
        if self.last_error.is_fatal() {
            return self.last_error;
        }
        op_error(self.attempts)
    }
}

/// Run `attempt` up to `max_attempts` times (at least once) without backoff,
/// stopping at the first success. The closure receives the 1-based attempt
/// number.
pub async fn retry<T, F, Fut>(operation: &str, max_attempts: u32, mut attempt: F) -> Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MqError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let fatal = e.is_fatal();
                if fatal || n >= max_attempts {
                    warn!("{operation} failed on attempt {n}/{max_attempts}, giving up: {e}");
                    return Err(Exhausted {
                        attempts: n,
                        last_error: e,
                    });
                }
                warn!("{operation} failed on attempt {n}/{max_attempts}, retrying: {e}");
                n += 1;
            }
        }
    }
}
