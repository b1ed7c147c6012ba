use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::{
    chunking::estimate_tokens,
    config::BatchConfig,
    error::{is_batch_unavailable, is_retryable_message},
    provider::{BatchItem, Provider},
};

/// Upper bound on the summed token estimate of one embedding call.
pub(crate) const MAX_BATCH_TOKENS: usize = 8_000;
/// Accumulated failures after which batch mode latches off for the process.
pub(crate) const BATCH_FAILURE_LIMIT: u32 = 2;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;

const QUERY_TIMEOUT_REMOTE: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT_LOCAL: Duration = Duration::from_secs(300);
const CALL_TIMEOUT_REMOTE: Duration = Duration::from_secs(120);
const CALL_TIMEOUT_LOCAL: Duration = Duration::from_secs(600);

/// Greedy bin-packing by token estimate. A single item over the limit
/// still ships, alone in its own batch.
pub(crate) fn pack_batches(items: Vec<BatchItem>) -> Vec<Vec<BatchItem>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let tokens = estimate_tokens(&item.text);
        if !current.is_empty() && current_tokens + tokens > MAX_BATCH_TOKENS {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(item);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Failure latch for provider-side batch mode: once tripped it stays
/// tripped for the life of the process, so the pipeline cannot oscillate
/// between modes.
#[derive(Debug, Default)]
pub(crate) struct BatchGate {
    failures: u32,
    disabled: bool,
}

impl BatchGate {
    pub(crate) fn enabled(&self) -> bool {
        !self.disabled
    }

    pub(crate) fn record_failure(&mut self, attempts: u32) {
        self.failures = self.failures.saturating_add(attempts.max(1));
        if self.failures >= BATCH_FAILURE_LIMIT {
            self.disabled = true;
        }
    }

    /// The provider has no batch endpoint at all; disable immediately.
    pub(crate) fn record_unavailable(&mut self) {
        self.record_failure(BATCH_FAILURE_LIMIT);
    }

    pub(crate) fn record_success(&mut self) {
        if !self.disabled {
            self.failures = 0;
        }
    }
}

/// Drives all embedding work for one manager: packs token-bounded batches,
/// retries transient failures, and routes through provider-side batch jobs
/// while the gate allows it.
pub(crate) struct BatchManager {
    settings: BatchConfig,
    gate: Mutex<BatchGate>,
}

impl BatchManager {
    pub(crate) fn new(settings: BatchConfig) -> Self {
        Self {
            settings,
            gate: Mutex::new(BatchGate::default()),
        }
    }

    pub(crate) async fn batch_mode_active(&self) -> bool {
        self.settings.enabled && self.settings.wait && self.gate.lock().await.enabled()
    }

    pub(crate) async fn embed_query(&self, provider: &Provider, text: &str) -> Result<Vec<f32>> {
        let timeout = if provider.is_local() {
            QUERY_TIMEOUT_LOCAL
        } else {
            QUERY_TIMEOUT_REMOTE
        };

        let (result, _attempts) = with_retry(timeout, || provider.embed_query(text)).await;
        result
    }

    /// Embed every item, in order. Provider-side batch jobs are preferred
    /// when configured and still trusted; any job failure falls back to
    /// per-request embedding within the same call.
    pub(crate) async fn embed_items(
        &self,
        provider: &Provider,
        items: Vec<BatchItem>,
    ) -> Result<Vec<Vec<f32>>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        if self.batch_mode_active().await && provider.batch_jobs().is_some() {
            match self.embed_via_jobs(provider, &items).await {
                Ok(Some(vectors)) => return Ok(vectors),
                Ok(None) => {
                    warn!("batch job results incomplete, falling back to per-request embedding");
                }
                Err(error) => {
                    warn!("batch mode failed, falling back to per-request embedding: {error:#}");
                }
            }
        }

        self.embed_per_request(provider, &items).await
    }

    async fn embed_via_jobs(
        &self,
        provider: &Provider,
        items: &[BatchItem],
    ) -> Result<Option<Vec<Vec<f32>>>> {
        let Some(jobs) = provider.batch_jobs() else {
            return Ok(None);
        };

        let batches = pack_batches(items.to_vec());
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms.max(100));
        let job_timeout = Duration::from_secs(self.settings.timeout_minutes.max(1) * 60);

        debug!(
            "submitting {} embedding batch job(s) for {} chunk(s)",
            batches.len(),
            items.len()
        );

        let runs = batches.iter().map(|batch| {
            let semaphore = semaphore.clone();
            let jobs = &jobs;
            async move {
                let _permit = semaphore.acquire().await;
                with_retry(job_timeout, || {
                    jobs.run_job(batch, poll_interval, job_timeout)
                })
                .await
            }
        });
        let outcomes = futures_util::future::join_all(runs).await;

        let mut merged = std::collections::HashMap::new();
        let mut failed = false;
        {
            let mut gate = self.gate.lock().await;
            for (result, attempts) in outcomes {
                match result {
                    Ok(vectors) => merged.extend(vectors),
                    Err(error) => {
                        failed = true;
                        if is_batch_unavailable(&error) {
                            gate.record_unavailable();
                        } else {
                            gate.record_failure(attempts);
                        }
                        warn!("embedding batch job failed: {error:#}");
                    }
                }
            }
            if !failed {
                gate.record_success();
            }
        }

        if failed {
            return Ok(None);
        }

        let mut aligned = Vec::with_capacity(items.len());
        for item in items {
            match merged.remove(&item.custom_id) {
                Some(vector) => aligned.push(vector),
                None => return Ok(None),
            }
        }
        Ok(Some(aligned))
    }

    async fn embed_per_request(
        &self,
        provider: &Provider,
        items: &[BatchItem],
    ) -> Result<Vec<Vec<f32>>> {
        let timeout = if provider.is_local() {
            CALL_TIMEOUT_LOCAL
        } else {
            CALL_TIMEOUT_REMOTE
        };

        let mut vectors = Vec::with_capacity(items.len());
        for batch in pack_batches(items.to_vec()) {
            let texts: Vec<String> = batch.into_iter().map(|item| item.text).collect();
            let (result, _attempts) = with_retry(timeout, || provider.embed_batch(&texts)).await;
            vectors.extend(result?);
        }
        Ok(vectors)
    }
}

/// Bounded retry with exponential backoff on transient provider errors.
/// A timed-out call earns exactly one extra attempt; anything else only
/// retries when the message says it is worth it.
async fn with_retry<T, F, Fut>(timeout: Duration, operation: F) -> (Result<T>, u32)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut timeouts = 0u32;
    let mut last_error: Option<anyhow::Error> = None;
    let mut attempts = 0u32;

    for attempt in 0..RETRY_ATTEMPTS {
        attempts = attempt + 1;

        let error = match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => return (Ok(value), attempts),
            Ok(Err(error)) => {
                let message = format!("{error:#}");
                if message.contains("timed out") {
                    timeouts += 1;
                    if timeouts > 1 {
                        return (Err(error), attempts);
                    }
                } else if !is_retryable_message(&message) {
                    return (Err(error), attempts);
                }
                error
            }
            Err(_elapsed) => {
                timeouts += 1;
                let error = anyhow!("embedding call timed out after {}s", timeout.as_secs());
                if timeouts > 1 {
                    return (Err(error), attempts);
                }
                error
            }
        };

        if attempt + 1 < RETRY_ATTEMPTS {
            let delay = backoff_delay(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient embedding error: {error:#}"
            );
            tokio::time::sleep(delay).await;
        }
        last_error = Some(error);
    }

    (
        Err(last_error.unwrap_or_else(|| anyhow!("embedding call failed"))),
        attempts,
    )
}

/// 500 ms doubling per attempt, capped at 8 s, with up to ±20% jitter
/// derived from the clock (the dependency set carries no RNG).
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(RETRY_MAX_DELAY_MS);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.subsec_nanos())
        .unwrap_or(0);
    // Map nanos onto [-20%, +20%].
    let jitter_permille = (nanos % 400) as i64 - 200;
    let jittered = base as i64 + (base as i64 * jitter_permille) / 1_000;

    Duration::from_millis(jittered.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;

    use super::{
        backoff_delay, pack_batches, with_retry, BatchGate, BATCH_FAILURE_LIMIT,
        MAX_BATCH_TOKENS,
    };
    use crate::provider::BatchItem;

    fn item(id: &str, len: usize) -> BatchItem {
        BatchItem {
            custom_id: id.to_string(),
            text: "x".repeat(len),
        }
    }

    #[test]
    fn packs_greedily_under_the_token_limit() {
        let batches = pack_batches(vec![
            item("a", 3_000),
            item("b", 3_000),
            item("c", 3_000),
            item("d", 100),
        ]);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2, "a+b fit, c overflows");
        assert_eq!(batches[1].len(), 2, "c+d fit");
    }

    #[test]
    fn oversized_item_forms_a_singleton_batch() {
        let batches = pack_batches(vec![
            item("big", MAX_BATCH_TOKENS + 500),
            item("small", 10),
        ]);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].custom_id, "big");
    }

    #[test]
    fn gate_latches_after_the_failure_limit() {
        let mut gate = BatchGate::default();
        assert!(gate.enabled());

        gate.record_failure(1);
        assert!(gate.enabled());
        gate.record_failure(1);
        assert!(!gate.enabled(), "limit {BATCH_FAILURE_LIMIT} reached");

        // A latch, not a thermostat: success never re-enables it.
        gate.record_success();
        assert!(!gate.enabled());
    }

    #[test]
    fn unavailable_endpoint_disables_immediately() {
        let mut gate = BatchGate::default();
        gate.record_unavailable();
        assert!(!gate.enabled());
    }

    #[test]
    fn success_resets_the_counter() {
        let mut gate = BatchGate::default();
        gate.record_failure(1);
        gate.record_success();
        gate.record_failure(1);
        assert!(gate.enabled(), "counter restarted from zero");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_only_transient_errors() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = with_retry(Duration::from_secs(5), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(anyhow!("HTTP 429 too many requests"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.expect("should eventually succeed"), 2);
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = with_retry(Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow!("invalid api key")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let first = backoff_delay(0);
        let third = backoff_delay(2);
        assert!(first >= Duration::from_millis(400));
        assert!(first <= Duration::from_millis(600));
        assert!(third > first);
        assert!(backoff_delay(10) <= Duration::from_millis(9_600));
    }
}
