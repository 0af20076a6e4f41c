use crate::traits::{ScrollPage, VectorStore};
use crate::{PointPayload, ScoredPoint, SearchError, SearchQuery, StoredPoint};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Qdrant REST adapter bound to one collection.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    api_key: Option<String>,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>, vector_size: usize) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            api_key: None,
            client: Client::new(),
            vector_size,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    /// Builds the store and checks that the server answers before any work starts.
    pub async fn connect(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
        api_key: Option<String>,
    ) -> Result<Self, SearchError> {
        let store = Self::new(endpoint, collection, vector_size).with_api_key(api_key);
        let response = store
            .authorized(store.client.get(format!("{}/collections", store.endpoint)))
            .send()
            .await
            .map_err(|error| SearchError::NotReady(format!("{}: {error}", store.endpoint)))?;
        if !response.status().is_success() {
            return Err(SearchError::NotReady(format!(
                "{} answered {}",
                store.endpoint,
                response.status()
            )));
        }
        Ok(store)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.header("api-key", api_key),
            None => request,
        }
    }

    async fn create_collection(&self) -> Result<(), SearchError> {
        let response = self
            .authorized(self.client.put(self.collection_url()))
            .json(&json!({
                "vectors": {
                    "size": self.vector_size,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;
        ensure_success(response).await?;
        info!(collection = %self.collection, vector_size = self.vector_size, "created collection");
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, SearchError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let details = response.text().await.unwrap_or_default();
    Err(SearchError::BackendResponse {
        backend: "qdrant".to_string(),
        details: format!("{status}: {details}"),
    })
}

fn point_body(point: &StoredPoint) -> Result<Value, SearchError> {
    Ok(json!({
        "id": point.id,
        "vector": point.vector,
        "payload": serde_json::to_value(&point.payload)?,
    }))
}

fn exclusion_filter(categories: &[String]) -> Option<Value> {
    if categories.is_empty() {
        return None;
    }
    Some(json!({
        "must_not": [
            { "key": "filter", "match": { "any": categories } }
        ]
    }))
}

fn search_body(query_vector: &[f32], query: &SearchQuery) -> Value {
    let mut body = json!({
        "vector": query_vector,
        "limit": query.top_k,
        "with_payload": true,
    });
    if let Some(filter) = exclusion_filter(&query.exclude_categories) {
        body["filter"] = filter;
    }
    body
}

fn parse_scroll(parsed: &Value) -> Result<ScrollPage, SearchError> {
    let points = parsed
        .pointer("/result/points")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::BackendResponse {
            backend: "qdrant".to_string(),
            details: "scroll response has no result.points".to_string(),
        })?;

    Ok(ScrollPage {
        ids: points
            .iter()
            .filter_map(|point| point.pointer("/id").and_then(Value::as_u64))
            .collect(),
        next_offset: parsed
            .pointer("/result/next_page_offset")
            .and_then(Value::as_u64),
    })
}

fn parse_hits(parsed: &Value) -> Vec<ScoredPoint> {
    let hits = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut result = Vec::new();
    for hit in hits {
        let Some(id) = hit.pointer("/id").and_then(Value::as_u64) else {
            continue;
        };
        let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
        let payload = hit.get("payload").cloned().unwrap_or(Value::Null);

        match serde_json::from_value::<PointPayload>(payload) {
            Ok(payload) => result.push(ScoredPoint { id, score, payload }),
            Err(error) => warn!(point_id = id, %error, "skipping hit with malformed payload"),
        }
    }
    result
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn vector_size(&self) -> usize {
        self.vector_size
    }

    async fn recreate_collection(&self) -> Result<(), SearchError> {
        let response = self
            .authorized(self.client.delete(self.collection_url()))
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            ensure_success(response).await?;
        }
        warn!(collection = %self.collection, "dropped collection");
        self.create_collection().await
    }

    async fn ensure_collection(&self) -> Result<(), SearchError> {
        let response = self
            .authorized(self.client.get(self.collection_url()))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        self.create_collection().await
    }

    async fn scroll_ids(&self, offset: Option<u64>, limit: usize) -> Result<ScrollPage, SearchError> {
        let mut body = json!({
            "limit": limit,
            "with_payload": false,
            "with_vector": false,
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }

        let response = self
            .authorized(
                self.client
                    .post(format!("{}/points/scroll", self.collection_url())),
            )
            .json(&body)
            .send()
            .await?;
        let parsed: Value = ensure_success(response).await?.json().await?;
        parse_scroll(&parsed)
    }

    async fn upsert(&self, points: &[StoredPoint]) -> Result<(), SearchError> {
        if points.is_empty() {
            return Ok(());
        }

        let bodies = points
            .iter()
            .map(|point| {
                point.validate(self.vector_size)?;
                point_body(point)
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let response = self
            .authorized(
                self.client
                    .put(format!("{}/points?wait=true", self.collection_url())),
            )
            .json(&json!({ "points": bodies }))
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(collection = %self.collection, points = points.len(), "upserted points");
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        query: &SearchQuery,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        if query_vector.len() != self.vector_size {
            return Err(SearchError::Request(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }

        let response = self
            .authorized(
                self.client
                    .post(format!("{}/points/search", self.collection_url())),
            )
            .json(&search_body(query_vector, query))
            .send()
            .await?;
        let parsed: Value = ensure_success(response).await?.json().await?;
        Ok(parse_hits(&parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DocType;

    #[test]
    fn exclusions_become_must_not_filter() {
        let query = SearchQuery::new("dorm", 10).excluding(["forum", "mail"]);
        let body = search_body(&[0.1, 0.2], &query);
        assert_eq!(body["limit"], 10);
        assert_eq!(
            body["filter"],
            json!({ "must_not": [{ "key": "filter", "match": { "any": ["forum", "mail"] } }] })
        );

        let unfiltered = search_body(&[0.1], &SearchQuery::new("dorm", 3));
        assert!(unfiltered.get("filter").is_none());
    }

    #[test]
    fn scroll_response_yields_ids_and_cursor() -> Result<(), SearchError> {
        let page = parse_scroll(&json!({
            "result": { "points": [{ "id": 1000 }, { "id": 2003 }], "next_page_offset": 2004 }
        }))?;
        assert_eq!(page.ids, vec![1000, 2003]);
        assert_eq!(page.next_offset, Some(2004));

        let last = parse_scroll(&json!({ "result": { "points": [], "next_page_offset": null } }))?;
        assert_eq!(last.next_offset, None);
        assert!(parse_scroll(&json!({ "status": "error" })).is_err());
        Ok(())
    }

    #[test]
    fn hits_are_typed_and_malformed_payloads_skipped() {
        let hits = parse_hits(&json!({
            "result": [
                {
                    "id": 3001,
                    "score": 0.87,
                    "payload": {
                        "doc_title": "rules.docx",
                        "doc_source": "https://example.edu/rules",
                        "raw_text": "Quiet hours start at 23:00.",
                        "summary": "Quiet hours.",
                        "doc_type": "word",
                        "page": 2
                    }
                },
                { "id": 3002, "score": 0.5, "payload": { "raw_text": "legacy" } }
            ]
        }));

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3001);
        assert_eq!(hits[0].payload.summary.as_deref(), Some("Quiet hours."));
        assert_eq!(hits[0].payload.doc_type, Some(DocType::Word));
        assert_eq!(hits[0].payload.page, Some(2));
    }

    #[test]
    fn point_body_serializes_typed_payload() -> Result<(), SearchError> {
        let point = StoredPoint {
            id: 4_002,
            vector: vec![0.5, 0.5],
            payload: PointPayload {
                doc_title: "a.pdf".to_string(),
                doc_source: "a.pdf".to_string(),
                raw_text: "text".to_string(),
                filter: Some("forum".to_string()),
                ..Default::default()
            },
        };
        let body = point_body(&point)?;
        assert_eq!(body["id"], 4_002);
        assert_eq!(body["payload"]["filter"], "forum");
        assert!(body["payload"].get("summary").is_none());
        Ok(())
    }
}
