//! Sink that only logs what it would have sent

use crate::{error::IotSwarmResult, payload::Payload, traits::Sink};
use async_trait::async_trait;
use tracing::info;

/// Accepts every payload and logs it at info level
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> IotSwarmResult<()> {
        info!(
            topic,
            station = payload.station(),
            rows = payload.row_count(),
            latest = ?payload.latest_time(),
            "Message logged"
        );
        Ok(())
    }
}
