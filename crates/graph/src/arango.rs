use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{GraphError, GraphStore};

/// ArangoDB REST client.
///
/// Connection settings come from [`finkb_config::ArangoConfig`], which in
/// turn honors the `ARANGO_{HOST,PORT,USER,PASSWORD,DB}` environment.
pub struct ArangoStore {
    client: reqwest::Client,
    endpoint: String,
    database: String,
    username: String,
    password: String,
}

impl ArangoStore {
    pub fn new(config: &finkb_config::ArangoConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            endpoint: config.endpoint(),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn db_url(&self, path: &str) -> String {
        format!("{}/_db/{}/_api/{}", self.endpoint, self.database, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Create the target database through `_system` when it does not exist.
    pub async fn ensure_database(&self) -> Result<(), GraphError> {
        let url = format!("{}/_db/_system/_api/database", self.endpoint);
        let resp = self.request(reqwest::Method::GET, url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let data: Value = resp.json().await?;
        let exists = data
            .get("result")
            .and_then(|r| r.as_array())
            .map(|dbs| dbs.iter().any(|d| d.as_str() == Some(self.database.as_str())))
            .unwrap_or(false);
        if exists {
            return Ok(());
        }

        tracing::info!(database = %self.database, "Creating ArangoDB database");
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&json!({"name": self.database}))
            .send()
            .await?;
        let status = resp.status();
        // 409: created concurrently, fine
        if !status.is_success() && status.as_u16() != 409 {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn ensure_collection(&self, name: &str, edge: bool) -> Result<(), GraphError> {
        let body = json!({
            "name": name,
            "type": if edge { 3 } else { 2 },
        });
        let resp = self
            .request(reqwest::Method::POST, self.db_url("collection"))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        // 409: duplicate name, collection already there
        if !status.is_success() && status.as_u16() != 409 {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn aql(&self, query: &str, bind_vars: Value) -> Result<Vec<Value>, GraphError> {
        let resp = self
            .request(reqwest::Method::POST, self.db_url("cursor"))
            .json(&json!({"query": query, "bindVars": bind_vars}))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let data: Value = resp.json().await?;
        Ok(data
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl GraphStore for ArangoStore {
    async fn ensure_collections(&self) -> Result<(), GraphError> {
        self.ensure_database().await?;
        for name in crate::DOCUMENT_COLLECTIONS {
            self.ensure_collection(name, false).await?;
        }
        for name in crate::EDGE_COLLECTIONS {
            self.ensure_collection(name, true).await?;
        }
        Ok(())
    }

    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Value>, GraphError> {
        let url = self.db_url(&format!("document/{collection}/{key}"));
        let resp = self.request(reqwest::Method::GET, url).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(resp.json().await?))
    }

    async fn insert_document(&self, collection: &str, doc: Value) -> Result<(), GraphError> {
        let url = self.db_url(&format!("document/{collection}"));
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&doc)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn patch_document(
        &self,
        collection: &str,
        key: &str,
        patch: Value,
    ) -> Result<(), GraphError> {
        let url = self.db_url(&format!("document/{collection}/{key}?keepNull=true&mergeObjects=true"));
        let resp = self
            .request(reqwest::Method::PATCH, url)
            .json(&patch)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, GraphError> {
        let url = self.db_url(&format!("collection/{collection}/count"));
        let resp = self.request(reqwest::Method::GET, url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let data: Value = resp.json().await?;
        Ok(data.get("count").and_then(|c| c.as_u64()).unwrap_or(0))
    }

    async fn documents_by_status(
        &self,
        collection: &str,
        status: &str,
    ) -> Result<Vec<Value>, GraphError> {
        if !crate::DOCUMENT_COLLECTIONS.contains(&collection) {
            return Err(GraphError::UnknownCollection(collection.to_string()));
        }
        let query = format!("FOR d IN {collection} FILTER d.status == @status RETURN d");
        self.aql(&query, json!({"status": status})).await
    }
}
