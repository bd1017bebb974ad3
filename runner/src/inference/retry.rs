use std::time::Duration;

use rand::Rng;

/// Invocation failures split by whether retrying can help.
#[derive(Debug)]
pub enum InvocationError {
    /// Throttling, 5xx, timeouts, network faults. Retried with backoff.
    Transient(anyhow::Error),
    /// 4xx, undecodable or schema-violating responses. Fails the tile now.
    Permanent(anyhow::Error),
}

impl InvocationError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        InvocationError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        InvocationError::Permanent(err.into())
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            InvocationError::Transient(err) | InvocationError::Permanent(err) => err,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, InvocationError::Transient(_))
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationError::Transient(err) => write!(f, "transient: {err:#}"),
            InvocationError::Permanent(err) => write!(f, "permanent: {err:#}"),
        }
    }
}

/// Classify an HTTP status per the retry policy.
pub fn classify_status(status: u16) -> fn(anyhow::Error) -> InvocationError {
    if status == 429 || status >= 500 {
        InvocationError::Transient
    } else {
        InvocationError::Permanent
    }
}

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Jittered exponential backoff delay for the given retry ordinal.
pub fn backoff_delay(attempt: usize) -> Duration {
    let exp = BASE_DELAY.as_millis() as u64 * (1u64 << attempt.min(16));
    let capped = exp.min(MAX_DELAY.as_millis() as u64);
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

/// Run `op` until it succeeds, fails permanently, or exhausts
/// `max_retries` additional attempts.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_retries: usize,
    mut op: F,
) -> Result<T, InvocationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InvocationError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_retries => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    target = label,
                    attempt = attempt + 1,
                    max_retries = max_retries,
                    delay = ?delay,
                    error = %err,
                    "transient invocation failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
