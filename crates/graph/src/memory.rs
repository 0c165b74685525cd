use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{GraphError, GraphStore};

/// HashMap-backed store with the same observable behavior as the ArangoDB
/// implementation. Used by publisher and glossary sync tests.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self, collection: &str) -> Vec<String> {
        let guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = guard
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn ensure_collections(&self) -> Result<(), GraphError> {
        let mut guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        for name in crate::DOCUMENT_COLLECTIONS.iter().chain(crate::EDGE_COLLECTIONS) {
            guard.entry(name.to_string()).or_default();
        }
        Ok(())
    }

    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Value>, GraphError> {
        let guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(collection).and_then(|c| c.get(key)).cloned())
    }

    async fn insert_document(&self, collection: &str, doc: Value) -> Result<(), GraphError> {
        let key = doc
            .get("_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GraphError::InvalidDocument("document missing _key".to_string()))?
            .to_string();
        let mut guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(collection.to_string()).or_default().insert(key, doc);
        Ok(())
    }

    async fn patch_document(
        &self,
        collection: &str,
        key: &str,
        patch: Value,
    ) -> Result<(), GraphError> {
        let mut guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let coll = guard
            .get_mut(collection)
            .ok_or_else(|| GraphError::UnknownCollection(collection.to_string()))?;
        let existing = coll
            .get_mut(key)
            .ok_or_else(|| GraphError::InvalidDocument(format!("no document {collection}/{key}")))?;
        if let (Some(target), Some(source)) = (existing.as_object_mut(), patch.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, GraphError> {
        let guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(collection).map(|c| c.len() as u64).unwrap_or(0))
    }

    async fn documents_by_status(
        &self,
        collection: &str,
        status: &str,
    ) -> Result<Vec<Value>, GraphError> {
        let guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let mut docs: Vec<Value> = guard
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|d| d.get("status").and_then(|s| s.as_str()) == Some(status))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| {
            let ka = a.get("_key").and_then(|v| v.as_str()).unwrap_or("");
            let kb = b.get("_key").and_then(|v| v.as_str()).unwrap_or("");
            ka.cmp(kb)
        });
        Ok(docs)
    }
}
