//! Rate-limit decorator: token buckets for requests-per-minute and
//! (estimated) tokens-per-minute. Waits for capacity, never errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::ProviderError;
use crate::message::{ChatRequest, ChatResponse};

use super::{Provider, ProviderDelta};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously at `per_minute / 60` per second,
/// capped at one minute of burst.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until `amount` tokens are available, then takes them.
    /// Requests larger than the capacity are allowed through once the
    /// bucket is full (they can never fully fit).
    async fn acquire(&self, amount: f64) {
        let amount = amount.min(self.capacity);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= amount {
                    state.tokens -= amount;
                    return;
                }
                let deficit = amount - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            sleep(wait).await;
        }
    }
}

/// Decorator enforcing RPM and TPM budgets ahead of the wrapped provider.
///
/// Token counts are estimated from message content (~4 chars/token);
/// a budget of 0 disables that bucket.
pub struct RateLimitProvider {
    inner: Arc<dyn Provider>,
    rpm: Option<TokenBucket>,
    tpm: Option<TokenBucket>,
}

impl RateLimitProvider {
    pub fn new(inner: Arc<dyn Provider>, rpm: u32, tpm: u32) -> Self {
        Self {
            inner,
            rpm: (rpm > 0).then(|| TokenBucket::new(rpm)),
            tpm: (tpm > 0).then(|| TokenBucket::new(tpm)),
        }
    }

    async fn wait_for_budget(&self, request: &ChatRequest) {
        if let Some(rpm) = &self.rpm {
            rpm.acquire(1.0).await;
        }
        if let Some(tpm) = &self.tpm {
            tpm.acquire(request.estimate_tokens() as f64).await;
        }
    }
}

#[async_trait]
impl Provider for RateLimitProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.wait_for_budget(request).await;
        self.inner.chat(request).await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        delta_tx: mpsc::Sender<ProviderDelta>,
    ) -> Result<ChatResponse, ProviderError> {
        self.wait_for_budget(request).await;
        self.inner.chat_stream(request, delta_tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;
    use crate::provider::MockProvider;

    #[tokio::test]
    async fn zero_budgets_pass_through() {
        let inner = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("ok"))]));
        let provider = RateLimitProvider::new(inner, 0, 0);
        let req = ChatRequest::new(vec![ChatMessage::user("hi")]);
        assert_eq!(provider.chat(&req).await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn bucket_delays_when_exhausted() {
        // 60 RPM = 1 token/sec refill; burst capacity 60 lets the first
        // calls through, so drain the bucket first.
        let bucket = TokenBucket::new(60);
        bucket.acquire(60.0).await;
        let start = Instant::now();
        bucket.acquire(1.0).await;
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "empty bucket should wait ~1s for one token, waited {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn burst_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(600);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire(1.0).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
