//! Elasticsearch 8 [`ItemVectorStorage`] implementation.
//!
//! Talks to the REST API directly with `reqwest`. Layout:
//!
//! | Index | Contents |
//! |-------|----------|
//! | `<prefix>-groups` | one document per group, `_id` = group id |
//! | `<prefix>-chunks-<D>` | chunks of every group whose dimension is `D` |
//!
//! Each chunk index maps `embedding` as an indexed `dense_vector` with
//! cosine similarity, so searches run as approximate k-NN with the group,
//! item and chunk-type predicates applied as a pre-filter. Elasticsearch
//! scores cosine hits as `(1 + cos) / 2`; [`score_to_similarity`] undoes
//! that before the shared ranking pass.
//!
//! Elasticsearch has no multi-document transactions. Group deletion removes
//! the group document first and reads skip chunks whose group is gone;
//! a failed bulk insert deletes whatever part of the batch it wrote, as does
//! an insert whose group disappears before its status is updated.
//!
//! Reads that can exceed one search window page through a point in time
//! with `search_after`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use item_vectors_core::chunk::{prepare_batch, prepare_chunk, sort_item_chunks};
use item_vectors_core::models::{
    ChunkEmbedGroup, ChunkView, GroupDeletion, GroupList, GroupStatus, GroupUpdate, ItemChunk,
    NewGroup, RankedChunk, SearchQuery,
};
use item_vectors_core::registry::{apply_update, check_transition, sort_groups};
use item_vectors_core::similarity::{finalize, validate_query};
use item_vectors_core::{Error, ItemVectorStorage, Result};

use crate::config::ElasticsearchConfig;

/// Upper bound Elasticsearch accepts for `size`, `k` and `num_candidates`.
const MAX_WINDOW: usize = 10_000;

/// Documents fetched per page when reading a whole result set.
const PAGE_SIZE: usize = 1_000;

const PIT_KEEP_ALIVE: &str = "1m";

const PASSWORD_ENV: &str = "ELASTICSEARCH_PASSWORD";

pub struct ElasticStore {
    client: Client,
    base: Url,
    prefix: String,
    num_candidates: usize,
    page_size: usize,
    username: Option<String>,
    password: Option<String>,
    known_chunk_indices: Mutex<HashSet<usize>>,
}

/// Optimistic concurrency token of a stored document.
#[derive(Debug, Clone, Copy)]
struct Version {
    seq_no: u64,
    primary_term: u64,
}

#[derive(Debug, Deserialize)]
struct GetResponse<T> {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_seq_no", default)]
    seq_no: u64,
    #[serde(rename = "_primary_term", default)]
    primary_term: u64,
    #[serde(rename = "_source")]
    source: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    #[serde(default)]
    pit_id: Option<String>,
    hits: Hits<T>,
}

#[derive(Debug, Deserialize)]
struct Hits<T> {
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(default)]
    sort: Vec<Value>,
    #[serde(rename = "_source")]
    source: T,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    deleted: u64,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct PitResponse {
    id: String,
}

/// The fields of a stored chunk needed to tell which group owns it.
#[derive(Debug, Deserialize)]
struct ChunkOwner {
    id: String,
    group_id: String,
}

#[derive(Debug, Deserialize)]
struct MgetResponse {
    docs: Vec<MgetDoc>,
}

#[derive(Debug, Deserialize)]
struct MgetDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    found: bool,
}

#[derive(Debug, Serialize)]
struct BulkAction<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
}

impl ElasticStore {
    /// Build a client for the configured cluster. The password, if any, is
    /// read from `ELASTICSEARCH_PASSWORD`.
    pub fn new(config: &ElasticsearchConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.url)
            .with_context(|| format!("invalid elasticsearch url: {}", config.url))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build Elasticsearch HTTP client")?;

        Ok(Self {
            client,
            base,
            prefix: config.index_prefix.clone(),
            num_candidates: config.num_candidates,
            page_size: PAGE_SIZE,
            username: config.username.clone(),
            password: std::env::var(PASSWORD_ENV).ok(),
            known_chunk_indices: Mutex::new(HashSet::new()),
        })
    }

    fn groups_index(&self) -> String {
        format!("{}-groups", self.prefix)
    }

    fn chunks_index(&self, dimension: usize) -> String {
        format!("{}-chunks-{}", self.prefix, dimension)
    }

    fn all_chunks(&self) -> String {
        format!("{}-chunks-*", self.prefix)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::storage("elasticsearch url cannot carry a path"))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let req = self.client.request(method, self.url(segments)?);
        Ok(match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_ref()),
            None => req,
        })
    }

    async fn send(&self, req: RequestBuilder) -> Result<(StatusCode, Value)> {
        let resp = req.send().await.map_err(Error::storage)?;
        let status = resp.status();
        let body = resp.text().await.map_err(Error::storage)?;
        let value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).map_err(Error::storage)?
        };
        debug!(%status, "elasticsearch response");
        Ok((status, value))
    }

    /// Send and require a 2xx answer.
    async fn send_ok(&self, req: RequestBuilder) -> Result<Value> {
        let (status, value) = self.send(req).await?;
        if !status.is_success() {
            return Err(response_error(status, &value));
        }
        Ok(value)
    }

    async fn create_index(&self, index: &str, body: Value) -> Result<()> {
        let req = self.request(Method::PUT, &[index])?.json(&body);
        let (status, value) = self.send(req).await?;
        if status.is_success() || error_type(&value) == Some("resource_already_exists_exception") {
            return Ok(());
        }
        Err(response_error(status, &value))
    }

    async fn ensure_chunk_index(&self, dimension: usize) -> Result<()> {
        if self.known_chunk_indices()?.contains(&dimension) {
            return Ok(());
        }
        let index = self.chunks_index(dimension);
        self.create_index(&index, chunk_index_mapping(dimension))
            .await?;
        self.known_chunk_indices()?.insert(dimension);
        debug!(index = %index, "chunk index ready");
        Ok(())
    }

    fn known_chunk_indices(&self) -> Result<std::sync::MutexGuard<'_, HashSet<usize>>> {
        self.known_chunk_indices
            .lock()
            .map_err(|_| Error::storage("index cache lock poisoned"))
    }

    async fn fetch_group(&self, group_id: &str) -> Result<Option<(ChunkEmbedGroup, Version)>> {
        let req = self.request(Method::GET, &[&self.groups_index(), "_doc", group_id])?;
        let (status, value) = self.send(req).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(response_error(status, &value));
        }
        let doc: GetResponse<ChunkEmbedGroup> = decode(value)?;
        match (doc.found, doc.source) {
            (true, Some(group)) => Ok(Some((
                group,
                Version {
                    seq_no: doc.seq_no,
                    primary_term: doc.primary_term,
                },
            ))),
            _ => Ok(None),
        }
    }

    /// Overwrite a group document if nobody changed it since `version`.
    async fn replace_group(&self, group: &ChunkEmbedGroup, version: Version) -> Result<()> {
        let req = self
            .request(Method::PUT, &[&self.groups_index(), "_doc", &group.id])?
            .query(&[
                ("refresh", "wait_for".to_string()),
                ("if_seq_no", version.seq_no.to_string()),
                ("if_primary_term", version.primary_term.to_string()),
            ])
            .json(group);
        let (status, value) = self.send(req).await?;
        if status == StatusCode::CONFLICT {
            return Err(Error::Storage(format!(
                "group {} was modified concurrently",
                group.id
            )));
        }
        if !status.is_success() {
            return Err(response_error(status, &value));
        }
        Ok(())
    }

    async fn mark_inserted(&self, group_id: &str) -> Result<()> {
        let req = self
            .request(Method::POST, &[&self.groups_index(), "_update", group_id])?
            .query(&[("refresh", "wait_for")])
            .json(&mark_inserted_body(Utc::now()));
        let (status, value) = self.send(req).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(Error::group_not_found(group_id));
        }
        if !status.is_success() {
            return Err(response_error(status, &value));
        }
        Ok(())
    }

    async fn delete_by_query(&self, query: Value) -> Result<u64> {
        let req = self
            .request(Method::POST, &[&self.all_chunks(), "_delete_by_query"])?
            .query(&[
                ("refresh", "true"),
                ("conflicts", "proceed"),
                ("ignore_unavailable", "true"),
                ("allow_no_indices", "true"),
            ])
            .json(&json!({ "query": query }));
        let resp: DeleteByQueryResponse = decode(self.send_ok(req).await?)?;
        Ok(resp.deleted)
    }

    /// Advance the group's status after a write. When the group was deleted
    /// while the chunks were being written, they are removed again.
    async fn finish_write(&self, group_id: &str, index: &str, ids: &[String]) -> Result<()> {
        match self.mark_inserted(group_id).await {
            Err(Error::NotFound(reason)) => {
                self.delete_written(index, ids).await;
                Err(Error::NotFound(reason))
            }
            other => other,
        }
    }

    /// Fails when any of `ids` is stored under another group that still
    /// exists. Orphans of deleted groups do not count.
    async fn check_ownership(&self, group_id: &str, ids: &[String]) -> Result<()> {
        let req = self
            .request(Method::POST, &[&self.all_chunks(), "_search"])?
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .json(&ownership_query(group_id, ids));
        let resp: SearchResponse<ChunkOwner> = decode(self.send_ok(req).await?)?;
        if resp.hits.hits.is_empty() {
            return Ok(());
        }

        let owners: Vec<ChunkOwner> = resp.hits.hits.into_iter().map(|h| h.source).collect();
        let owner_ids: Vec<String> = owners
            .iter()
            .map(|o| o.group_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let live = self.existing_groups(&owner_ids).await?;
        match owners.iter().find(|o| live.contains(&o.group_id)) {
            Some(owner) => Err(Error::chunk_in_other_group(&owner.id, &owner.group_id)),
            None => Ok(()),
        }
    }

    /// Ids among `group_ids` that still have a group document.
    async fn existing_groups(&self, group_ids: &[String]) -> Result<HashSet<String>> {
        if group_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let req = self
            .request(Method::POST, &[&self.groups_index(), "_mget"])?
            .query(&[("_source", "false")])
            .json(&json!({ "ids": group_ids }));
        let (status, value) = self.send(req).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(HashSet::new());
        }
        if !status.is_success() {
            return Err(response_error(status, &value));
        }
        let resp: MgetResponse = decode(value)?;
        Ok(resp
            .docs
            .into_iter()
            .filter(|d| d.found)
            .map(|d| d.id)
            .collect())
    }

    async fn search_groups(&self, query: Value) -> Result<Vec<ChunkEmbedGroup>> {
        let sort = json!([{ "created_at": "asc" }, { "id": "asc" }]);
        let mut groups: Vec<ChunkEmbedGroup> = self.scan(&self.groups_index(), query, sort).await?;
        sort_groups(&mut groups);
        Ok(groups)
    }

    /// Ids of the groups holding chunks of `item_id`, paged through a
    /// composite aggregation.
    async fn item_group_ids(&self, item_id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut after: Option<Value> = None;
        loop {
            let req = self
                .request(Method::POST, &[&self.all_chunks(), "_search"])?
                .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
                .json(&item_groups_body(item_id, after.take(), self.page_size));
            let value = self.send_ok(req).await?;

            let buckets = value
                .pointer("/aggregations/groups/buckets")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            ids.extend(
                buckets
                    .iter()
                    .filter_map(|b| b.pointer("/key/group_id").and_then(Value::as_str))
                    .map(str::to_string),
            );
            match value.pointer("/aggregations/groups/after_key") {
                Some(key) if buckets.len() >= self.page_size => after = Some(key.clone()),
                _ => return Ok(ids),
            }
        }
    }

    /// Every document of `index` matching `query`, read page by page under
    /// a point in time. A missing index reads as empty.
    async fn scan<T>(&self, index: &str, query: Value, sort: Value) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        let req = self
            .request(Method::POST, &[index, "_pit"])?
            .query(&[("keep_alive", PIT_KEEP_ALIVE), ("ignore_unavailable", "true")]);
        let (status, value) = self.send(req).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(response_error(status, &value));
        }
        let pit: PitResponse = decode(value)?;

        let mut pit_id = pit.id;
        let result = self.scan_pages(&mut pit_id, &query, &sort).await;
        self.close_pit(&pit_id).await;
        result
    }

    async fn scan_pages<T>(&self, pit_id: &mut String, query: &Value, sort: &Value) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        let mut docs = Vec::new();
        let mut after: Vec<Value> = Vec::new();
        loop {
            let body = page_body(query, sort, pit_id.as_str(), &after, self.page_size);
            let req = self.request(Method::POST, &["_search"])?.json(&body);
            let resp: SearchResponse<T> = decode(self.send_ok(req).await?)?;
            if let Some(id) = resp.pit_id {
                *pit_id = id;
            }

            let full_page = resp.hits.hits.len() >= self.page_size;
            for hit in resp.hits.hits {
                after = hit.sort;
                docs.push(hit.source);
            }
            if !full_page || after.is_empty() {
                return Ok(docs);
            }
        }
    }

    async fn close_pit(&self, pit_id: &str) {
        let req = match self.request(Method::DELETE, &["_pit"]) {
            Ok(req) => req.json(&json!({ "id": pit_id })),
            Err(e) => {
                warn!(error = %e, "could not close point in time");
                return;
            }
        };
        if let Err(e) = self.send_ok(req).await {
            warn!(error = %e, "could not close point in time");
        }
    }

    async fn delete_written(&self, index: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let query = json!({ "terms": { "id": ids } });
        let req = match self.request(Method::POST, &[index, "_delete_by_query"]) {
            Ok(req) => req
                .query(&[("refresh", "true"), ("conflicts", "proceed")])
                .json(&json!({ "query": query })),
            Err(e) => {
                warn!(error = %e, "could not remove written chunks");
                return;
            }
        };
        match self.send_ok(req).await {
            Ok(_) => warn!(index, removed = ids.len(), "removed written chunks"),
            Err(e) => warn!(index, error = %e, "could not remove written chunks"),
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(Error::storage)
}

fn error_type(value: &Value) -> Option<&str> {
    value.pointer("/error/type").and_then(Value::as_str)
}

fn response_error(status: StatusCode, value: &Value) -> Error {
    let reason = value
        .pointer("/error/reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given");
    match error_type(value) {
        Some(kind) => Error::Storage(format!("elasticsearch {}: {} ({})", status, reason, kind)),
        None => Error::Storage(format!("elasticsearch {}: {}", status, reason)),
    }
}

/// Elasticsearch cosine `_score` is `(1 + cos) / 2`.
fn score_to_similarity(score: f64) -> f64 {
    (2.0 * score - 1.0).clamp(-1.0, 1.0)
}

fn group_index_mapping() -> Value {
    json!({
        "mappings": {
            "dynamic": false,
            "properties": {
                "id": { "type": "keyword" },
                "name": { "type": "keyword" },
                "status": { "type": "keyword" },
                "is_default": { "type": "boolean" },
                "is_active": { "type": "boolean" },
                "created_at": { "type": "date" },
                "updated_at": { "type": "date" }
            }
        }
    })
}

fn chunk_index_mapping(dimension: usize) -> Value {
    json!({
        "mappings": {
            "dynamic": false,
            "properties": {
                "id": { "type": "keyword" },
                "item_id": { "type": "keyword" },
                "group_id": { "type": "keyword" },
                "title": { "type": "text" },
                "content": { "type": "text" },
                "index": { "type": "long" },
                "embedding": {
                    "type": "dense_vector",
                    "dims": dimension,
                    "index": true,
                    "similarity": "cosine"
                },
                "metadata": {
                    "properties": {
                        "chunk_type": { "type": "keyword" }
                    }
                },
                "strategy_metadata": { "type": "object", "enabled": false },
                "created_at": { "type": "date" },
                "updated_at": { "type": "date" }
            }
        }
    })
}

/// Pre-filter for a k-NN query: group, optional item set, optional chunk type.
fn knn_filter(query: &SearchQuery) -> Value {
    let mut filter = vec![json!({ "term": { "group_id": query.group_id } })];
    if !query.item_ids.is_empty() {
        filter.push(json!({ "terms": { "item_id": query.item_ids } }));
    }
    if let Some(chunk_type) = &query.filter.chunk_type {
        filter.push(json!({ "term": { "metadata.chunk_type": chunk_type } }));
    }
    json!({ "bool": { "filter": filter } })
}

/// Asks for more neighbours than `top_k` so every chunk tied at the cut
/// reaches [`finalize`], which applies the shared order and truncates.
fn knn_body(query: &SearchQuery, num_candidates: usize) -> Value {
    let k = query
        .top_k
        .saturating_mul(2)
        .max(num_candidates)
        .min(MAX_WINDOW);
    json!({
        "knn": {
            "field": "embedding",
            "query_vector": query.vector,
            "k": k,
            "num_candidates": k,
            "filter": knn_filter(query),
            "similarity": query.threshold,
        },
        "size": k,
        "_source": { "excludes": ["embedding"] },
    })
}

/// Moves a group to COMPLETED when it is still PENDING or PROCESSING. The
/// script never turns into a no-op, so every insert bumps the group's
/// `_seq_no` and a concurrent `update_group` sees the version change.
fn mark_inserted_body(now: DateTime<Utc>) -> Value {
    json!({
        "script": {
            "lang": "painless",
            "source": "if (params.from.contains(ctx._source.status)) { \
                       ctx._source.status = params.to; ctx._source.updated_at = params.now }",
            "params": {
                "from": [GroupStatus::Pending.as_str(), GroupStatus::Processing.as_str()],
                "to": GroupStatus::Completed.as_str(),
                "now": now,
            }
        }
    })
}

/// Chunks among `ids` stored under any group other than `group_id`.
fn ownership_query(group_id: &str, ids: &[String]) -> Value {
    json!({
        "size": ids.len().min(MAX_WINDOW),
        "_source": ["id", "group_id"],
        "query": {
            "bool": {
                "filter": [{ "terms": { "id": ids } }],
                "must_not": [{ "term": { "group_id": group_id } }]
            }
        }
    })
}

fn item_groups_body(item_id: &str, after: Option<Value>, size: usize) -> Value {
    let mut composite = json!({
        "size": size,
        "sources": [{ "group_id": { "terms": { "field": "group_id" } } }]
    });
    if let Some(key) = after {
        composite["after"] = key;
    }
    json!({
        "size": 0,
        "query": { "term": { "item_id": item_id } },
        "aggs": { "groups": { "composite": composite } }
    })
}

/// One page of a point-in-time read. `after` holds the sort values of the
/// previous page's last hit and is empty for the first page.
fn page_body(query: &Value, sort: &Value, pit_id: &str, after: &[Value], size: usize) -> Value {
    let mut body = json!({
        "size": size,
        "query": query,
        "sort": sort,
        "pit": { "id": pit_id, "keep_alive": PIT_KEEP_ALIVE },
        "track_total_hits": false
    });
    if !after.is_empty() {
        body["search_after"] = json!(after);
    }
    body
}

/// NDJSON payload for a `_bulk` index request.
fn bulk_body(index: &str, chunks: &[ItemChunk]) -> Result<String> {
    let mut body = String::new();
    for chunk in chunks {
        let action = json!({ "index": BulkAction { index, id: &chunk.id } });
        body.push_str(&serde_json::to_string(&action).map_err(Error::storage)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(chunk).map_err(Error::storage)?);
        body.push('\n');
    }
    Ok(body)
}

/// Split a bulk response into the ids that were written and the first
/// failure reason, if any item failed.
fn bulk_outcome(resp: BulkResponse) -> (Vec<String>, Option<String>) {
    let mut written = Vec::new();
    let mut failure = None;
    for item in resp.items.into_iter().flat_map(|m| m.into_values()) {
        if (200..300).contains(&item.status) {
            written.push(item.id);
        } else if failure.is_none() {
            let reason = item
                .error
                .as_ref()
                .and_then(|e| e.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            failure = Some(format!("chunk {}: {}", item.id, reason));
        }
    }
    if resp.errors && failure.is_none() {
        failure = Some("bulk request reported errors".to_string());
    }
    (written, failure)
}

fn parse_hits(value: Value) -> Result<Vec<RankedChunk>> {
    let resp: SearchResponse<ChunkView> = decode(value)?;
    Ok(resp
        .hits
        .hits
        .into_iter()
        .map(|hit| RankedChunk {
            chunk: hit.source,
            similarity: score_to_similarity(hit.score.unwrap_or(0.0)),
        })
        .collect())
}

#[async_trait]
impl ItemVectorStorage for ElasticStore {
    async fn initialize(&self) -> Result<()> {
        self.create_index(&self.groups_index(), group_index_mapping())
            .await?;
        info!(index = %self.groups_index(), "elasticsearch indices ready");
        Ok(())
    }

    async fn create_group(&self, new_group: NewGroup) -> Result<ChunkEmbedGroup> {
        let group = new_group.into_group(Utc::now())?;
        self.ensure_chunk_index(group.dimension()).await?;

        let req = self
            .request(Method::PUT, &[&self.groups_index(), "_create", &group.id])?
            .query(&[("refresh", "wait_for")])
            .json(&group);
        self.send_ok(req).await?;

        info!(group_id = %group.id, dimension = group.dimension(), "created group");
        Ok(group)
    }

    async fn get_group(&self, group_id: &str) -> Result<ChunkEmbedGroup> {
        self.fetch_group(group_id)
            .await?
            .map(|(group, _)| group)
            .ok_or_else(|| Error::group_not_found(group_id))
    }

    async fn list_groups(&self, item_id: Option<&str>) -> Result<GroupList> {
        let groups = match item_id {
            None => self.search_groups(json!({ "match_all": {} })).await?,
            Some(item_id) => {
                let ids = self.item_group_ids(item_id).await?;
                let mut groups = Vec::new();
                for batch in ids.chunks(MAX_WINDOW) {
                    groups.extend(self.search_groups(json!({ "terms": { "id": batch } })).await?);
                }
                sort_groups(&mut groups);
                groups
            }
        };
        let total_count = groups.len();
        Ok(GroupList {
            groups,
            total_count,
        })
    }

    async fn update_group(&self, group_id: &str, update: GroupUpdate) -> Result<ChunkEmbedGroup> {
        let (current, version) = self
            .fetch_group(group_id)
            .await?
            .ok_or_else(|| Error::group_not_found(group_id))?;
        let chunk_count = self.count_chunks(group_id).await?;
        let patched = apply_update(&current, update, chunk_count, Utc::now())?;

        if patched.dimension() != current.dimension() {
            self.ensure_chunk_index(patched.dimension()).await?;
        }
        self.replace_group(&patched, version).await?;
        Ok(patched)
    }

    async fn delete_group(&self, group_id: &str) -> Result<GroupDeletion> {
        let req = self
            .request(Method::DELETE, &[&self.groups_index(), "_doc", group_id])?
            .query(&[("refresh", "wait_for")]);
        let (status, value) = self.send(req).await?;

        let deleted_chunk_count = if status == StatusCode::NOT_FOUND {
            0
        } else if status.is_success() {
            self.delete_by_query(json!({ "term": { "group_id": group_id } }))
                .await?
        } else {
            return Err(response_error(status, &value));
        };

        info!(group_id, deleted_chunk_count, "deleted group");
        Ok(GroupDeletion {
            deleted_group_id: group_id.to_string(),
            deleted_chunk_count,
        })
    }

    async fn set_status(&self, group_id: &str, status: GroupStatus) -> Result<ChunkEmbedGroup> {
        let (mut group, version) = self
            .fetch_group(group_id)
            .await?
            .ok_or_else(|| Error::group_not_found(group_id))?;
        check_transition(group.status, status)?;

        if group.status != status {
            group.status = status;
            group.updated_at = Utc::now();
            self.replace_group(&group, version).await?;
        }
        Ok(group)
    }

    async fn insert_chunk(&self, group: &ChunkEmbedGroup, chunk: ItemChunk) -> Result<bool> {
        let now = Utc::now();
        let chunk = prepare_chunk(group, chunk, now)?;
        let stored = self.get_group(&group.id).await?;
        let chunk = prepare_chunk(&stored, chunk, now)?;

        let ids = [chunk.id.clone()];
        self.check_ownership(&group.id, &ids).await?;

        let index = self.chunks_index(stored.dimension());
        self.ensure_chunk_index(stored.dimension()).await?;
        let req = self
            .request(Method::PUT, &[&index, "_doc", &chunk.id])?
            .query(&[("refresh", "wait_for")])
            .json(&chunk);
        self.send_ok(req).await?;
        debug!(chunk_id = %chunk.id, group_id = %group.id, "insert chunk");

        self.finish_write(&group.id, &index, &ids).await?;
        Ok(true)
    }

    async fn batch_insert_chunks(
        &self,
        group: &ChunkEmbedGroup,
        chunks: Vec<ItemChunk>,
    ) -> Result<bool> {
        let now = Utc::now();
        let chunks = prepare_batch(group, chunks, now)?;
        if chunks.is_empty() {
            return Ok(true);
        }
        let stored = self.get_group(&group.id).await?;
        let chunks = prepare_batch(&stored, chunks, now)?;
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        self.check_ownership(&group.id, &ids).await?;

        let index = self.chunks_index(stored.dimension());
        self.ensure_chunk_index(stored.dimension()).await?;
        let req = self
            .request(Method::POST, &["_bulk"])?
            .query(&[("refresh", "wait_for")])
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&index, &chunks)?);
        let resp: BulkResponse = decode(self.send_ok(req).await?)?;

        let (written, failure) = bulk_outcome(resp);
        if let Some(reason) = failure {
            self.delete_written(&index, &written).await;
            return Err(Error::Storage(format!("batch insert failed: {}", reason)));
        }
        debug!(group_id = %group.id, count = written.len(), "batch insert chunks");

        self.finish_write(&group.id, &index, &written).await?;
        Ok(true)
    }

    async fn get_chunks_by_item_id(&self, item_id: &str) -> Result<Vec<ItemChunk>> {
        let sort = json!([{ "group_id": "asc" }, { "index": "asc" }, { "id": "asc" }]);
        let mut chunks: Vec<ItemChunk> = self
            .scan(
                &self.all_chunks(),
                json!({ "term": { "item_id": item_id } }),
                sort,
            )
            .await?;

        let group_ids: Vec<String> = chunks
            .iter()
            .map(|c| c.group_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let live = self.existing_groups(&group_ids).await?;
        chunks.retain(|c| live.contains(&c.group_id));

        sort_item_chunks(&mut chunks);
        Ok(chunks)
    }

    async fn count_chunks(&self, group_id: &str) -> Result<u64> {
        let req = self
            .request(Method::POST, &[&self.all_chunks(), "_count"])?
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .json(&json!({ "query": { "term": { "group_id": group_id } } }));
        let resp: CountResponse = decode(self.send_ok(req).await?)?;
        Ok(resp.count)
    }

    async fn delete_chunks_by_item_id(&self, item_id: &str) -> Result<u64> {
        let deleted = self
            .delete_by_query(json!({ "term": { "item_id": item_id } }))
            .await?;
        info!(item_id, deleted, "deleted chunks by item");
        Ok(deleted)
    }

    async fn delete_chunks_by_group_id(&self, group_id: &str) -> Result<u64> {
        let deleted = self
            .delete_by_query(json!({ "term": { "group_id": group_id } }))
            .await?;
        info!(group_id, deleted, "deleted chunks by group");
        Ok(deleted)
    }

    async fn search_chunks(&self, query: &SearchQuery) -> Result<Vec<RankedChunk>> {
        let group = self.get_group(&query.group_id).await?;
        validate_query(group.dimension(), query)?;
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let req = self
            .request(Method::POST, &[&self.chunks_index(group.dimension()), "_search"])?
            .json(&knn_body(query, self.num_candidates));
        let (status, value) = self.send(req).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(response_error(status, &value));
        }

        let hits = parse_hits(value)?;
        debug!(group_id = %query.group_id, hits = hits.len(), "knn search");
        Ok(finalize(hits, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use item_vectors_core::conformance;
    use item_vectors_core::models::ChunkFilter;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        path: String,
        body: String,
    }

    type Handler = dyn Fn(&Recorded) -> (u16, Value) + Send + Sync;
    type Log = Arc<Mutex<Vec<Recorded>>>;

    /// Local HTTP/1.1 responder standing in for a cluster. Every request is
    /// answered by `handler` and recorded.
    async fn fake_cluster(
        handler: impl Fn(&Recorded) -> (u16, Value) + Send + Sync + 'static,
    ) -> (ElasticStore, Log) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let seen = log.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, seen.clone(), handler.clone()));
            }
        });

        let mut store = ElasticStore::new(&ElasticsearchConfig {
            url: format!("http://{}", addr),
            index_prefix: "iv".to_string(),
            timeout_secs: 5,
            num_candidates: 100,
            username: None,
        })
        .unwrap();
        store.page_size = 2;
        (store, log)
    }

    async fn serve(socket: TcpStream, log: Log, handler: Arc<Handler>) {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let mut parts = line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();

            let mut length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).await.unwrap();
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0; length];
            reader.read_exact(&mut body).await.unwrap();

            let request = Recorded {
                method,
                path,
                body: String::from_utf8(body).unwrap(),
            };
            let (status, reply) = handler(&request);
            log.lock().unwrap().push(request);

            let payload = reply.to_string();
            let head = format!(
                "HTTP/1.1 {} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                status,
                payload.len()
            );
            write.write_all(head.as_bytes()).await.unwrap();
            write.write_all(payload.as_bytes()).await.unwrap();
        }
    }

    fn stored_group(dimension: usize) -> ChunkEmbedGroup {
        conformance::sample_group("remote", dimension)
            .into_group(Utc::now())
            .unwrap()
    }

    fn group_doc(group: &ChunkEmbedGroup) -> Value {
        json!({ "found": true, "_seq_no": 3, "_primary_term": 1, "_source": group })
    }

    fn missing_group() -> Value {
        json!({ "error": { "type": "document_missing_exception", "reason": "missing" } })
    }

    #[test]
    fn test_score_round_trips_cosine() {
        assert!((score_to_similarity(1.0) - 1.0).abs() < 1e-12);
        assert!(score_to_similarity(0.5).abs() < 1e-12);
        assert!((score_to_similarity(0.0) + 1.0).abs() < 1e-12);
        let cos = 0.9939_f64;
        assert!((score_to_similarity((1.0 + cos) / 2.0) - cos).abs() < 1e-12);
    }

    #[test]
    fn test_chunk_mapping_declares_vector_width() {
        let mapping = chunk_index_mapping(1536);
        let embedding = &mapping["mappings"]["properties"]["embedding"];
        assert_eq!(embedding["type"], "dense_vector");
        assert_eq!(embedding["dims"], 1536);
        assert_eq!(embedding["similarity"], "cosine");
        assert_eq!(
            mapping["mappings"]["properties"]["metadata"]["properties"]["chunk_type"]["type"],
            "keyword"
        );
    }

    #[test]
    fn test_knn_body_filters_before_k() {
        let query = SearchQuery::new("g1", vec![1.0, 0.0, 0.0, 0.0])
            .items(["item-a", "item-b"])
            .top_k(2)
            .threshold(0.5)
            .filter(ChunkFilter::chunk_type("table"));
        let body = knn_body(&query, 100);

        assert_eq!(body["knn"]["k"], 100);
        assert_eq!(body["knn"]["num_candidates"], 100);
        assert_eq!(body["knn"]["similarity"], 0.5);
        assert_eq!(body["size"], 100);
        assert_eq!(body["_source"]["excludes"][0], "embedding");

        let filter = body["knn"]["filter"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filter.len(), 3);
        assert_eq!(filter[0]["term"]["group_id"], "g1");
        assert_eq!(filter[1]["terms"]["item_id"][1], "item-b");
        assert_eq!(filter[2]["term"]["metadata.chunk_type"], "table");
    }

    #[test]
    fn test_knn_body_without_items_or_filter() {
        let query = SearchQuery::new("g1", vec![1.0, 0.0]).top_k(500);
        let body = knn_body(&query, 100);
        assert_eq!(body["knn"]["num_candidates"], 1000);
        let filter = body["knn"]["filter"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_knn_body_fetches_past_top_k() {
        let query = SearchQuery::new("g1", vec![1.0, 0.0]).top_k(1);
        let body = knn_body(&query, 1);
        assert_eq!(body["knn"]["k"], 2);
        assert_eq!(body["size"], 2);

        let huge = SearchQuery::new("g1", vec![1.0, 0.0]).top_k(9_000);
        let body = knn_body(&huge, 100);
        assert_eq!(body["knn"]["k"], MAX_WINDOW);
        assert_eq!(body["knn"]["num_candidates"], MAX_WINDOW);
        assert_eq!(body["size"], MAX_WINDOW);
    }

    #[test]
    fn test_mark_inserted_script_always_writes() {
        let body = mark_inserted_body(Utc::now());
        let source = body["script"]["source"].as_str().unwrap();
        assert!(!source.contains("noop"));
        assert!(source.contains("ctx._source.status = params.to"));
        assert_eq!(body["script"]["params"]["from"][0], "WAIT_FOR_CHUNK_EMBED");
        assert_eq!(body["script"]["params"]["to"], "COMPLETED");
    }

    #[test]
    fn test_page_body_continues_after_last_sort() {
        let query = json!({ "term": { "item_id": "book" } });
        let sort = json!([{ "group_id": "asc" }]);
        let first = page_body(&query, &sort, "pit-1", &[], 50);
        assert_eq!(first["pit"]["id"], "pit-1");
        assert_eq!(first["size"], 50);
        assert!(first.get("search_after").is_none());

        let next = page_body(&query, &sort, "pit-2", &[json!("g1"), json!(7)], 50);
        assert_eq!(next["pit"]["id"], "pit-2");
        assert_eq!(next["search_after"], json!(["g1", 7]));
    }

    #[test]
    fn test_ownership_query_excludes_own_group() {
        let body = ownership_query("g1", &["c1".to_string(), "c2".to_string()]);
        assert_eq!(body["size"], 2);
        assert_eq!(body["query"]["bool"]["filter"][0]["terms"]["id"][1], "c2");
        assert_eq!(body["query"]["bool"]["must_not"][0]["term"]["group_id"], "g1");
    }

    #[test]
    fn test_bulk_body_is_ndjson() {
        let chunks = vec![
            ItemChunk::new("item", 0, "first", vec![1.0, 0.0]).with_id("c1"),
            ItemChunk::new("item", 1, "second", vec![0.0, 1.0]).with_id("c2"),
        ];
        let body = bulk_body("iv-chunks-2", &chunks).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "iv-chunks-2");
        assert_eq!(action["index"]["_id"], "c1");
        let doc: Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(doc["content"], "second");
        assert_eq!(doc["embedding"][1], 1.0);
    }

    #[test]
    fn test_bulk_outcome_reports_partial_failure() {
        let resp: BulkResponse = serde_json::from_value(json!({
            "took": 3,
            "errors": true,
            "items": [
                { "index": { "_id": "c1", "status": 201 } },
                { "index": { "_id": "c2", "status": 400,
                    "error": { "type": "mapper_parsing_exception", "reason": "bad vector" } } },
                { "index": { "_id": "c3", "status": 200 } }
            ]
        }))
        .unwrap();
        let (written, failure) = bulk_outcome(resp);
        assert_eq!(written, vec!["c1".to_string(), "c3".to_string()]);
        assert_eq!(failure.as_deref(), Some("chunk c2: bad vector"));
    }

    #[test]
    fn test_bulk_outcome_clean() {
        let resp: BulkResponse = serde_json::from_value(json!({
            "errors": false,
            "items": [{ "index": { "_id": "c1", "status": 201 } }]
        }))
        .unwrap();
        let (written, failure) = bulk_outcome(resp);
        assert_eq!(written.len(), 1);
        assert!(failure.is_none());
    }

    #[test]
    fn test_parse_hits_converts_scores() {
        let now = Utc::now();
        let value = json!({
            "hits": {
                "total": { "value": 1, "relation": "eq" },
                "hits": [{
                    "_index": "iv-chunks-4",
                    "_id": "c1",
                    "_score": 1.0,
                    "_source": {
                        "id": "c1",
                        "item_id": "item",
                        "group_id": "g1",
                        "title": "",
                        "content": "hello",
                        "index": 0,
                        "created_at": now,
                        "updated_at": now
                    }
                }]
            }
        });
        let hits = parse_hits(value).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "c1");
        assert!((hits[0].similarity - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_response_error_carries_reason() {
        let err = response_error(
            StatusCode::BAD_REQUEST,
            &json!({ "error": { "type": "illegal_argument_exception", "reason": "dims mismatch" } }),
        );
        assert_eq!(
            err,
            Error::Storage(
                "elasticsearch 400 Bad Request: dims mismatch (illegal_argument_exception)"
                    .to_string()
            )
        );
    }

    #[test]
    fn test_url_escapes_document_ids() {
        let store = ElasticStore::new(&ElasticsearchConfig {
            url: "http://localhost:9200/".to_string(),
            index_prefix: "iv".to_string(),
            timeout_secs: 5,
            num_candidates: 100,
            username: None,
        })
        .unwrap();
        let url = store.url(&["iv-groups", "_doc", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9200/iv-groups/_doc/a%2Fb%20c");
        assert_eq!(store.chunks_index(512), "iv-chunks-512");
    }

    #[tokio::test]
    async fn test_insert_removes_chunk_when_group_vanishes() {
        let group = stored_group(2);
        let doc = group_doc(&group);
        let (store, log) = fake_cluster(move |req| {
            let path = req.path.as_str();
            match req.method.as_str() {
                "GET" => (200, doc.clone()),
                "POST" if path.starts_with("/iv-groups/_update/") => (404, missing_group()),
                "POST" if path.contains("/_delete_by_query") => (200, json!({ "deleted": 1 })),
                "POST" if path.contains("/_search") => (200, json!({ "hits": { "hits": [] } })),
                _ => (200, json!({ "acknowledged": true })),
            }
        })
        .await;

        let err = store
            .insert_chunk(
                &group,
                ItemChunk::new("book", 0, "late", vec![1.0, 0.0]).with_id("c1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let log = log.lock().unwrap();
        assert!(log
            .iter()
            .any(|r| r.method == "PUT" && r.path.starts_with("/iv-chunks-2/_doc/c1")));
        let cleanup = log
            .iter()
            .find(|r| r.path.starts_with("/iv-chunks-2/_delete_by_query"))
            .unwrap();
        assert!(cleanup.body.contains("\"c1\""));
    }

    #[tokio::test]
    async fn test_batch_removes_chunks_when_group_vanishes() {
        let group = stored_group(2);
        let doc = group_doc(&group);
        let (store, log) = fake_cluster(move |req| {
            let path = req.path.as_str();
            match req.method.as_str() {
                "GET" => (200, doc.clone()),
                "POST" if path.starts_with("/_bulk") => (
                    200,
                    json!({ "errors": false, "items": [
                        { "index": { "_id": "c1", "status": 201 } },
                        { "index": { "_id": "c2", "status": 201 } }
                    ] }),
                ),
                "POST" if path.starts_with("/iv-groups/_update/") => (404, missing_group()),
                "POST" if path.contains("/_delete_by_query") => (200, json!({ "deleted": 2 })),
                "POST" if path.contains("/_search") => (200, json!({ "hits": { "hits": [] } })),
                _ => (200, json!({ "acknowledged": true })),
            }
        })
        .await;

        let batch = vec![
            ItemChunk::new("book", 0, "a", vec![1.0, 0.0]).with_id("c1"),
            ItemChunk::new("book", 1, "b", vec![0.0, 1.0]).with_id("c2"),
        ];
        let err = store.batch_insert_chunks(&group, batch).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let log = log.lock().unwrap();
        let cleanup = log
            .iter()
            .find(|r| r.path.starts_with("/iv-chunks-2/_delete_by_query"))
            .unwrap();
        assert!(cleanup.body.contains("\"c1\""));
        assert!(cleanup.body.contains("\"c2\""));
    }

    async fn insert_owned_elsewhere(owner_alive: bool) -> (Result<bool>, Log) {
        let group = stored_group(2);
        let doc = group_doc(&group);
        let (store, log) = fake_cluster(move |req| {
            let path = req.path.as_str();
            match req.method.as_str() {
                "GET" => (200, doc.clone()),
                "POST" if path.contains("/_search") => (
                    200,
                    json!({ "hits": { "hits": [
                        { "_source": { "id": "c1", "group_id": "other" } }
                    ] } }),
                ),
                "POST" if path.contains("/_mget") => (
                    200,
                    json!({ "docs": [{ "_id": "other", "found": owner_alive }] }),
                ),
                _ => (200, json!({ "acknowledged": true })),
            }
        })
        .await;
        let result = store
            .insert_chunk(
                &group,
                ItemChunk::new("book", 0, "moved", vec![1.0, 0.0]).with_id("c1"),
            )
            .await;
        (result, log)
    }

    #[tokio::test]
    async fn test_insert_rejects_chunk_id_of_other_group() {
        let (result, log) = insert_owned_elsewhere(true).await;
        assert_eq!(result.unwrap_err(), Error::chunk_in_other_group("c1", "other"));
        assert!(!log
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.method == "PUT" && r.path.contains("/_doc/")));

        // A leftover of a deleted group does not block the id.
        let (result, log) = insert_owned_elsewhere(false).await;
        assert!(result.unwrap());
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.method == "PUT" && r.path.starts_with("/iv-chunks-2/_doc/c1")));
    }

    #[tokio::test]
    async fn test_item_chunks_read_past_one_page() {
        let now = Utc::now();
        let chunk = move |i: i64| {
            let mut c = ItemChunk::new("book", i, format!("part {}", i), vec![1.0, 0.0])
                .with_id(format!("c{}", i));
            c.group_id = "g1".to_string();
            c.created_at = now;
            c.updated_at = now;
            c
        };
        let pages = vec![
            json!({ "pit_id": "pit-2", "hits": { "hits": [
                { "_source": chunk(0), "sort": ["g1", 0, "c0", 11] },
                { "_source": chunk(1), "sort": ["g1", 1, "c1", 12] }
            ] } }),
            json!({ "pit_id": "pit-3", "hits": { "hits": [
                { "_source": chunk(2), "sort": ["g1", 2, "c2", 13] }
            ] } }),
        ];
        let (store, log) = fake_cluster(move |req| {
            let path = req.path.as_str();
            match req.method.as_str() {
                "POST" if path.contains("/_pit") => (200, json!({ "id": "pit-1" })),
                "POST" if path.starts_with("/_search") => {
                    let page = usize::from(req.body.contains("search_after"));
                    (200, pages[page].clone())
                }
                "POST" if path.contains("/_mget") => {
                    (200, json!({ "docs": [{ "_id": "g1", "found": true }] }))
                }
                "DELETE" => (200, json!({ "succeeded": true, "num_freed": 1 })),
                _ => (404, json!({})),
            }
        })
        .await;

        let chunks = store.get_chunks_by_item_id("book").await.unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2"]);

        let log = log.lock().unwrap();
        let pages: Vec<&Recorded> = log.iter().filter(|r| r.path.starts_with("/_search")).collect();
        assert_eq!(pages.len(), 2);
        assert!(pages[1].body.contains("\"pit-2\""));
        assert!(pages[1].body.contains("\"c1\""));
        let close = log.iter().find(|r| r.method == "DELETE").unwrap();
        assert_eq!(close.path, "/_pit");
        assert!(close.body.contains("pit-3"));
    }
}
