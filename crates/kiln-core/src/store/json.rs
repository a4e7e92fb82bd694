//! File-backed stores under the state directory.
//!
//! Functions are kept in one JSON document, rewritten atomically (temp file +
//! rename) on every change. Execution records are appended as JSON lines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::types::{unix_millis, ExecutionRecord, FunctionDef};

use super::{validate_def, FunctionStore, RecordQuery, RecordStore, StoreError, StoreResult};

/// Function definitions persisted to a single JSON file.
#[derive(Debug)]
pub struct JsonFunctionStore {
    path: PathBuf,
    functions: Mutex<BTreeMap<String, FunctionDef>>,
}

impl JsonFunctionStore {
    /// Open the store, loading existing definitions if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let functions = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Loaded {} functions from {:?}", functions.len(), path);
        Ok(Self {
            path,
            functions: Mutex::new(functions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, functions: &BTreeMap<String, FunctionDef>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(functions)?;

        // Write to temp file first for atomic replacement
        let temp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl FunctionStore for JsonFunctionStore {
    async fn create(&self, mut def: FunctionDef) -> StoreResult<FunctionDef> {
        validate_def(&def)?;
        let mut functions = self.functions.lock().await;
        if functions.contains_key(&def.name) {
            return Err(StoreError::AlreadyExists(def.name));
        }
        def.created_at.get_or_insert_with(unix_millis);
        functions.insert(def.name.clone(), def.clone());

        if let Err(e) = self.save(&functions).await {
            functions.remove(&def.name);
            return Err(e);
        }
        Ok(def)
    }

    async fn get(&self, name: &str) -> StoreResult<FunctionDef> {
        self.functions
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, mut def: FunctionDef) -> StoreResult<FunctionDef> {
        validate_def(&def)?;
        let mut functions = self.functions.lock().await;
        let previous = functions
            .get(&def.name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(def.name.clone()))?;
        def.created_at = previous.created_at;
        functions.insert(def.name.clone(), def.clone());

        if let Err(e) = self.save(&functions).await {
            functions.insert(previous.name.clone(), previous);
            return Err(e);
        }
        Ok(def)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let mut functions = self.functions.lock().await;
        let previous = functions
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if let Err(e) = self.save(&functions).await {
            functions.insert(previous.name.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<FunctionDef>> {
        Ok(self.functions.lock().await.values().cloned().collect())
    }
}

/// Execution records appended to a JSON lines file.
///
/// Queries scan the whole file; unreadable lines are skipped with a warning.
#[derive(Debug)]
pub struct JsonlRecordStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let records: Vec<ExecutionRecord> = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Skipping unreadable record at {:?}:{}: {}", self.path, n + 1, e);
                    None
                }
            })
            .collect();

        Ok(query.apply(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::types::ExecutionOutcome;
    use tempfile::TempDir;

    fn def(name: &str) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            language: "javascript".to_string(),
            code: "console.log('hi')".to_string(),
            timeout_seconds: 10,
            backend: Some(BackendKind::Sandboxed),
            description: Some("greets".to_string()),
            tags: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_functions_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("functions.json");

        let store = JsonFunctionStore::open(&path).await.unwrap();
        store.create(def("greet")).await.unwrap();
        store.create(def("other")).await.unwrap();
        store.delete("other").await.unwrap();
        drop(store);

        let reopened = JsonFunctionStore::open(&path).await.unwrap();
        let all = reopened.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "greet");
        assert_eq!(all[0].backend, Some(BackendKind::Sandboxed));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_records_append_and_query() {
        let temp = TempDir::new().unwrap();
        let store = JsonlRecordStore::new(temp.path().join("records").join("executions.jsonl"));

        assert!(store.query(&RecordQuery::default()).await.unwrap().is_empty());

        for (i, name) in ["a", "b", "a"].iter().enumerate() {
            let record = ExecutionRecord {
                function_name: Some(name.to_string()),
                backend: BackendKind::Container,
                language: "python".to_string(),
                timestamp: 1_000 + i as u64,
                outcome: ExecutionOutcome {
                    stdout: format!("run {i}\n"),
                    exit_code: Some(0),
                    ..ExecutionOutcome::default()
                },
            };
            store.append(&record).await.unwrap();
        }

        let found = store.query(&RecordQuery::function("a")).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].timestamp, 1_002);
        assert_eq!(found[0].outcome.stdout, "run 2\n");
    }
}
