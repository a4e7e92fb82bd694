//! Persistence collaborators: function definitions and execution records.
//!
//! The engine only appends records; everything else is used by the HTTP
//! server and the CLI. Store failures are logged by callers and never turn a
//! successful execution into a failed one.

mod json;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::types::{ExecutionRecord, FunctionDef};

pub use json::{JsonFunctionStore, JsonlRecordStore};
pub use memory::{MemoryFunctionStore, MemoryRecordStore};

/// Errors from a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("function {0:?} not found")]
    NotFound(String),

    #[error("function {0:?} already exists")]
    AlreadyExists(String),

    #[error("invalid function definition: {0}")]
    Invalid(String),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Named function definitions. Names are unique.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Insert a new definition. Fails with `AlreadyExists` on a duplicate name.
    async fn create(&self, def: FunctionDef) -> StoreResult<FunctionDef>;

    async fn get(&self, name: &str) -> StoreResult<FunctionDef>;

    /// Replace an existing definition, keeping its creation time.
    async fn update(&self, def: FunctionDef) -> StoreResult<FunctionDef>;

    async fn delete(&self, name: &str) -> StoreResult<()>;

    /// All definitions, ordered by name.
    async fn list(&self) -> StoreResult<Vec<FunctionDef>>;
}

/// Filter for record queries.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub function_name: Option<String>,
    pub backend: Option<BackendKind>,
    /// Only records at or after this unix-millisecond timestamp.
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.function_name
            .as_deref()
            .is_none_or(|name| record.function_name.as_deref() == Some(name))
            && self.backend.is_none_or(|b| record.backend == b)
            && self.since.is_none_or(|since| record.timestamp >= since)
    }

    /// Filter `records`, newest first, truncated to the limit.
    pub fn apply<'a>(
        &self,
        records: impl IntoIterator<Item = &'a ExecutionRecord>,
    ) -> Vec<ExecutionRecord> {
        let mut matched: Vec<ExecutionRecord> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Append-only execution records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()>;

    /// Records matching `query`, newest first.
    async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>>;
}

/// Reject definitions the engine could never run.
pub(crate) fn validate_def(def: &FunctionDef) -> StoreResult<()> {
    if def.name.trim().is_empty() {
        return Err(StoreError::Invalid("name must not be empty".to_string()));
    }
    if def.name.contains('/') {
        return Err(StoreError::Invalid("name must not contain '/'".to_string()));
    }
    if def.code.trim().is_empty() {
        return Err(StoreError::Invalid("code must not be empty".to_string()));
    }
    if def.timeout_seconds == 0 {
        return Err(StoreError::Invalid(
            "timeout_seconds must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionOutcome;

    fn record(name: Option<&str>, backend: BackendKind, timestamp: u64) -> ExecutionRecord {
        ExecutionRecord {
            function_name: name.map(String::from),
            backend,
            language: "python".to_string(),
            timestamp,
            outcome: ExecutionOutcome::default(),
        }
    }

    #[test]
    fn test_query_filters_and_orders() {
        let records = vec![
            record(Some("a"), BackendKind::Container, 1),
            record(Some("b"), BackendKind::Container, 2),
            record(Some("a"), BackendKind::Sandboxed, 3),
            record(None, BackendKind::Container, 4),
        ];

        let found = RecordQuery::function("a").apply(&records);
        assert_eq!(found.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![3, 1]);

        let found = RecordQuery::default().since(2).limit(2).apply(&records);
        assert_eq!(found.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![4, 3]);

        let found = RecordQuery::function("a")
            .backend(BackendKind::Container)
            .apply(&records);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_validate_def() {
        let mut def = FunctionDef {
            name: "hello".to_string(),
            language: "python".to_string(),
            code: "print('hi')".to_string(),
            timeout_seconds: 5,
            backend: None,
            description: None,
            tags: None,
            created_at: None,
        };
        assert!(validate_def(&def).is_ok());
        def.name = "a/b".to_string();
        assert!(matches!(validate_def(&def), Err(StoreError::Invalid(_))));
    }
}
