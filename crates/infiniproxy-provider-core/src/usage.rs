use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

/// One completed request, as seen by accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub caller_id: i64,
    pub user_id: i64,
    pub endpoint: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model_used: String,
    pub backend_used: String,
}

/// Sinks swallow their own failures; recording never fails a request.
pub trait UsageSink: Send + Sync {
    fn record<'a>(&'a self, record: &'a UsageRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Emits one structured log line per record.
#[derive(Debug, Default)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record<'a>(&'a self, record: &'a UsageRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!(
                event = "usage_recorded",
                caller_id = record.caller_id,
                user_id = record.user_id,
                endpoint = %record.endpoint,
                tokens_in = record.tokens_in,
                tokens_out = record.tokens_out,
                model = %record.model_used,
                backend = %record.backend_used
            );
        })
    }
}

#[derive(Clone, Default)]
pub struct UsageFanout {
    sinks: Vec<Arc<dyn UsageSink>>,
}

impl UsageFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl UsageSink for UsageFanout {
    fn record<'a>(&'a self, record: &'a UsageRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for sink in &self.sinks {
                sink.record(record).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<UsageRecord>>);

    impl UsageSink for Collect {
        fn record<'a>(
            &'a self,
            record: &'a UsageRecord,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                self.0.lock().await.push(record.clone());
            })
        }
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_sink() {
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());
        let fanout = UsageFanout::new()
            .with_sink(first.clone())
            .with_sink(Arc::new(TracingUsageSink))
            .with_sink(second.clone());
        let record = UsageRecord {
            caller_id: 7,
            user_id: 1,
            endpoint: "/v1/messages".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            model_used: "glm-4.6".to_string(),
            backend_used: "zhipu".to_string(),
        };
        fanout.record(&record).await;
        assert_eq!(first.0.lock().await.as_slice(), std::slice::from_ref(&record));
        assert_eq!(second.0.lock().await.len(), 1);
    }
}
