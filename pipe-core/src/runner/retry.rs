// Retry loop with a constant back-off between attempts

use std::future::Future;
use std::time::Duration;

pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Errors that should not be retried (e.g. an interrupt).
pub trait Retryable {
    fn retryable(&self) -> bool {
        true
    }
}

/// Run `f` up to `max_attempts` times, sleeping [`RETRY_BACKOFF`] between
/// attempts. Returns the number of attempts made alongside the final
/// result.
pub async fn retry<T, E, F, Fut>(max_attempts: u32, mut f: F) -> (u32, Result<T, E>)
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return (attempts, Ok(value)),
            Err(e) => {
                if attempts >= max_attempts || !e.retryable() {
                    return (attempts, Err(e));
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Fail(bool);

    impl Retryable for Fail {
        fn retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try() {
        let (attempts, result) =
            retry::<_, Fail, _, _>(3, || async { Ok::<_, Fail>(42) }).await;
        assert_eq!(attempts, 1);
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let (attempts, result) = retry(5, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Fail(true))
            } else {
                Ok(())
            }
        })
        .await;
        assert_eq!(attempts, 3);
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts() {
        let (attempts, result) = retry::<(), _, _, _>(3, || async { Err(Fail(true)) }).await;
        assert_eq!(attempts, 3);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_stop_immediately() {
        let (attempts, result) = retry::<(), _, _, _>(5, || async { Err(Fail(false)) }).await;
        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }
}
