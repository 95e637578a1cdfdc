//! Event sinks provided by the scheduler crate.

use async_trait::async_trait;
use sieve_core::Result;
use sieve_core::events::RunEvent;
use sieve_core::ports::EventSink;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Mirrors run events into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        info!(subject = %event.subject(), run_id = %event.run_id(), payload = %payload, "Run event");
        Ok(())
    }
}

/// Keeps every event in memory, in publish order.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RunEvent> {
        self.events.lock().await.clone()
    }

    pub async fn subjects(&self) -> Vec<String> {
        self.events.lock().await.iter().map(RunEvent::subject).collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Fans events out to several sinks; the first error wins.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        for sink in &self.sinks {
            sink.publish(event.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::events::RunCompletedPayload;
    use sieve_core::ids::RunId;
    use sieve_core::run::RunState;

    fn completed() -> RunEvent {
        RunEvent::RunCompleted(RunCompletedPayload {
            run_id: RunId::new(),
            state: RunState::Completed,
            failed_jobs: vec![],
            duration_ms: Some(5),
        })
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let fanout = FanoutSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone()), Arc::new(TracingSink)]);

        fanout.publish(completed()).await.unwrap();
        assert_eq!(a.events().await.len(), 1);
        assert_eq!(b.events().await.len(), 1);
    }
}
