use log::{error, warn};
use std::future::Future;
use std::time::Duration;

use crate::RngProvider;

/// Retry an asynchronous operation with jittered exponential backoff.
///
/// The `operation` closure is executed until it succeeds or `max_retries`
/// attempts have been made. The delay between attempts starts at
/// `initial_delay` and doubles each time up to `max_delay`, with jitter of
/// up to a tenth of the delay drawn from `rng` to avoid thundering herds.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    rng: &dyn RngProvider,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut attempts = 0;
    let mut delay = initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempts += 1;
                if attempts >= max_retries {
                    error!("Operation failed after {attempts} attempts: {err:?}");
                    return Err(err);
                }
                warn!("Operation failed (attempt {attempts}), retrying in {delay:?}: {err:?}");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
                let jitter_ceiling = (delay.as_millis() as u64 / 10).max(1);
                let jitter = Duration::from_millis(rng.next_u64() % jitter_ceiling);
                delay += jitter;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeededRngProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let rng = SeededRngProvider::new(1);

        let result: Result<u32, &str> = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            },
            &rng,
            5,
            Duration::from_millis(1),
            Duration::from_millis(4),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let rng = SeededRngProvider::new(1);

        let result: Result<(), &str> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("always") }
            },
            &rng,
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
