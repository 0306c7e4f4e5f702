//! Recording sink with programmable failures, used as a test double

use crate::{
    error::{IotSwarmError, IotSwarmResult},
    payload::Payload,
    traits::Sink,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A payload accepted by [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Payload,
}

#[derive(Debug, Default)]
enum FailurePlan {
    #[default]
    None,
    Next(u32, IotSwarmError),
    Always(IotSwarmError),
}

/// Keeps every accepted payload in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
    plan: Arc<Mutex<FailurePlan>>,
    attempts: Arc<AtomicU64>,
    latency: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every publish call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` publish calls with `error`
    pub async fn fail_next(&self, count: u32, error: IotSwarmError) {
        *self.plan.lock().await = FailurePlan::Next(count, error);
    }

    /// Fail every publish call with `error`
    pub async fn fail_always(&self, error: IotSwarmError) {
        *self.plan.lock().await = FailurePlan::Always(error);
    }

    /// Accept publishes again
    pub async fn recover(&self) {
        *self.plan.lock().await = FailurePlan::None;
    }

    pub async fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.messages.lock().await.len()
    }

    /// Publish calls made so far, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> IotSwarmResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut plan = self.plan.lock().await;
            match &mut *plan {
                FailurePlan::None => {}
                FailurePlan::Always(error) => return Err(error.clone()),
                FailurePlan::Next(remaining, error) => {
                    let error = error.clone();
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        *plan = FailurePlan::None;
                    }
                    return Err(error);
                }
            }
        }

        self.messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
