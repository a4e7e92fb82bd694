//! Emits one execution record per outcome.

use std::sync::Arc;

use crate::store::RecordStore;
use crate::types::ExecutionRecord;

/// Hands execution records to the record store.
///
/// Store failures are logged and swallowed: recording metrics never changes
/// the outcome of an execution.
#[derive(Clone, Default)]
pub struct MetricsEmitter {
    store: Option<Arc<dyn RecordStore>>,
}

impl MetricsEmitter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store: Some(store) }
    }

    /// An emitter that only logs.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn emit(&self, record: &ExecutionRecord) {
        let outcome = &record.outcome;
        tracing::info!(
            function = record.function_name.as_deref().unwrap_or("-"),
            backend = %record.backend,
            language = %record.language,
            warm_start = outcome.warm_start,
            init_ms = outcome.init_time_ms,
            exec_ms = outcome.exec_time_ms,
            total_ms = outcome.total_time_ms,
            error = outcome.error_kind().map(|k| k.to_string()).as_deref().unwrap_or("none"),
            "execution finished"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.append(record).await {
                tracing::warn!("Failed to store execution record: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for MetricsEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsEmitter")
            .field("enabled", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::store::{MemoryRecordStore, RecordQuery, StoreError, StoreResult};
    use crate::types::ExecutionOutcome;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        async fn append(&self, _record: &ExecutionRecord) -> StoreResult<()> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        async fn query(&self, _query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>> {
            Ok(Vec::new())
        }
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord {
            function_name: None,
            backend: BackendKind::Container,
            language: "python".to_string(),
            timestamp: 1,
            outcome: ExecutionOutcome::default(),
        }
    }

    #[tokio::test]
    async fn test_emit_appends() {
        let store = Arc::new(MemoryRecordStore::new());
        MetricsEmitter::new(store.clone()).emit(&record()).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        MetricsEmitter::new(Arc::new(BrokenStore)).emit(&record()).await;
        MetricsEmitter::disabled().emit(&record()).await;
    }
}
