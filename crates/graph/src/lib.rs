pub mod arango;
pub mod memory;

mod error;

pub use arango::ArangoStore;
pub use error::GraphError;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Vertex collections of the methodology graph.
pub const DOCUMENT_COLLECTIONS: &[&str] = &[
    "methodologies",
    "stages",
    "tools",
    "indicators",
    "rules",
    "glossary_terms",
    "embeddings",
    "chunks",
];

/// Edge collections, named after the relation they express.
pub const EDGE_COLLECTIONS: &[&str] = &[
    "methodology_has_stage",
    "stage_uses_tool",
    "stage_uses_indicator",
    "stage_has_rule",
    "indicator_depends_on",
    "methodology_uses_term",
    "stage_uses_term",
    "indicator_uses_term",
    "tool_uses_term",
    "term_relates_to",
    "chunk_of",
];

pub fn is_edge_collection(name: &str) -> bool {
    EDGE_COLLECTIONS.contains(&name)
}

/// Deterministic edge key: same (_from, _to, relation) always collapses to
/// the same document, which is what makes republishing idempotent.
pub fn edge_key(from: &str, to: &str, relation: &str) -> String {
    let digest = Sha256::digest(format!("{from}|{to}|{relation}").as_bytes());
    hex::encode(digest)[..32].to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertStats {
    pub fn absorb(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// Storage seam between the publisher/glossary sync and the database.
///
/// The production implementation talks to ArangoDB over REST; tests use
/// [`MemoryStore`].
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn ensure_collections(&self) -> Result<(), GraphError>;

    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Value>, GraphError>;

    async fn insert_document(&self, collection: &str, doc: Value) -> Result<(), GraphError>;

    /// Partial update of an existing document.
    async fn patch_document(
        &self,
        collection: &str,
        key: &str,
        patch: Value,
    ) -> Result<(), GraphError>;

    async fn count(&self, collection: &str) -> Result<u64, GraphError>;

    async fn documents_by_status(
        &self,
        collection: &str,
        status: &str,
    ) -> Result<Vec<Value>, GraphError>;
}

/// Insert-or-merge a document by `_key`.
///
/// On update the original `created_at` wins and everything else (including
/// the fresh `updated_at`) is patched in. Returns true when the document
/// was inserted.
pub async fn upsert_document(
    store: &dyn GraphStore,
    collection: &str,
    doc: Value,
) -> Result<bool, GraphError> {
    let key = doc
        .get("_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GraphError::InvalidDocument("document missing _key".to_string()))?
        .to_string();

    match store.get_document(collection, &key).await? {
        Some(_) => {
            let mut patch = doc;
            if let Some(obj) = patch.as_object_mut() {
                obj.remove("created_at");
            }
            store.patch_document(collection, &key, patch).await?;
            Ok(false)
        }
        None => {
            store.insert_document(collection, doc).await?;
            Ok(true)
        }
    }
}

/// Upsert a batch into one collection, accumulating insert/update counts.
pub async fn upsert_batch(
    store: &dyn GraphStore,
    collection: &str,
    docs: Vec<Value>,
) -> Result<UpsertStats, GraphError> {
    let mut stats = UpsertStats::default();
    for doc in docs {
        if upsert_document(store, collection, doc).await? {
            stats.inserted += 1;
        } else {
            stats.updated += 1;
        }
    }
    Ok(stats)
}
