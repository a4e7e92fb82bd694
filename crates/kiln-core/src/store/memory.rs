//! In-memory stores.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::types::{unix_millis, ExecutionRecord, FunctionDef};

use super::{validate_def, FunctionStore, RecordQuery, RecordStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryFunctionStore {
    functions: Mutex<BTreeMap<String, FunctionDef>>,
}

impl MemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, FunctionDef>> {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FunctionStore for MemoryFunctionStore {
    async fn create(&self, mut def: FunctionDef) -> StoreResult<FunctionDef> {
        validate_def(&def)?;
        let mut functions = self.lock();
        if functions.contains_key(&def.name) {
            return Err(StoreError::AlreadyExists(def.name));
        }
        def.created_at.get_or_insert_with(unix_millis);
        functions.insert(def.name.clone(), def.clone());
        Ok(def)
    }

    async fn get(&self, name: &str) -> StoreResult<FunctionDef> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, mut def: FunctionDef) -> StoreResult<FunctionDef> {
        validate_def(&def)?;
        let mut functions = self.lock();
        let existing = functions
            .get(&def.name)
            .ok_or_else(|| StoreError::NotFound(def.name.clone()))?;
        def.created_at = existing.created_at;
        functions.insert(def.name.clone(), def.clone());
        Ok(def)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<FunctionDef>> {
        Ok(self.lock().values().cloned().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ExecutionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn append(&self, record: &ExecutionRecord) -> StoreResult<()> {
        self.lock().push(record.clone());
        Ok(())
    }

    async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>> {
        Ok(query.apply(self.lock().iter()))
    }
}
