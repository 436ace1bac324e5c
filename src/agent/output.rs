use crate::bus::MessageBus;
use crate::error::AgentResult;
use crate::orchestration::OutputSink;
use async_trait::async_trait;
use std::sync::Arc;

/// Streams job output over the bus, one publish per chunk
pub struct BusOutput {
    bus: Arc<dyn MessageBus>,
    subject: String,
}

impl BusOutput {
    pub fn new(bus: Arc<dyn MessageBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl OutputSink for BusOutput {
    async fn write(&self, chunk: Vec<u8>) -> AgentResult<()> {
        self.bus.publish(&self.subject, chunk).await
    }
}
