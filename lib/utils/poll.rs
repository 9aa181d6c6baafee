use std::{future::Future, time::Duration};

use tokio::time::{self, Instant};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Polls `probe` at `interval` until it returns `true` or `deadline` elapses.
///
/// Returns `true` if the probe succeeded within the deadline. The deadline and
/// interval are explicit so tests can drive the loop with millisecond values
/// instead of wall-clock waits.
pub async fn poll_until<F, Fut>(deadline: Duration, interval: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let stop_at = Instant::now() + deadline;

    loop {
        if probe().await {
            return true;
        }

        if Instant::now() >= stop_at {
            return false;
        }

        time::sleep(interval).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn test_poll_until_succeeds_after_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let probe_attempts = attempts.clone();

        let ok = poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            let attempts = probe_attempts.clone();
            async move { attempts.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;

        assert!(ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_reports_deadline_exhaustion() {
        let ok = poll_until(Duration::from_millis(5), Duration::from_millis(1), || async {
            false
        })
        .await;

        assert!(!ok);
    }

    #[tokio::test]
    async fn test_poll_until_probes_at_least_once() {
        let ok = poll_until(Duration::ZERO, Duration::from_millis(1), || async { true }).await;
        assert!(ok);
    }
}
