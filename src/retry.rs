//! Bounded retry with jittered backoff, shared by operations that recover
//! from idempotent conflicts (create-room races) and transient store errors.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) async fn with_backoff<T, F, Fut, P>(
    attempts: u32,
    base_delay: Duration,
    retriable: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let attempts = attempts.max(1);
    let mut last_err = Error::CreateFailed;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retriable(&err) && attempt < attempts => {
                let delay = backoff_delay(base_delay, attempt);
                debug!(%err, attempt, delay_ms = delay.as_millis() as u64, "retrying after conflict");
                sleep(delay).await;
                last_err = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1 << (attempt - 1).min(8));
    let jitter_cap = (base.as_millis() as u64 / 2).max(1);
    scaled + Duration::from_millis(rand::random::<u64>() % jitter_cap)
}
