//! In-memory backend shared by the integration tests.
//!
//! Interprets just enough of the query DSL for the repository: term and
//! match equality on top-level fields, `match_all`, `must_not`, `_id`
//! ordering with `search_after`, a per-request page cap, scripted sums over
//! the returned page, and NDJSON bulk lines.

#![allow(dead_code)]

use armature_docstore::{BackendRequest, BackendResponse, Executor, RepositoryError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct MemoryBackend {
    indices: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    resources: Mutex<BTreeSet<String>>,
    requests: Mutex<Vec<BackendRequest>>,
    next_id: AtomicUsize,
    page_cap: AtomicUsize,
    /// Fail the search with this 1-based sequence number.
    fail_search_at: AtomicUsize,
    searches: AtomicUsize,
    pub fail_bulk: AtomicBool,
    pub omit_sort: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            page_cap: AtomicUsize::new(usize::MAX),
            ..Default::default()
        })
    }

    pub fn with_page_cap(self: Arc<Self>, cap: usize) -> Arc<Self> {
        self.page_cap.store(cap, Ordering::SeqCst);
        self
    }

    pub fn fail_search_at(&self, n: usize) {
        self.fail_search_at.store(n, Ordering::SeqCst);
    }

    pub fn insert(&self, index: &str, id: &str, source: Value) {
        self.indices
            .lock()
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), source);
    }

    pub fn seed(&self, index: &str, count: usize, source: impl Fn(usize) -> Value) {
        for i in 0..count {
            self.insert(index, &format!("doc-{:05}", i), source(i));
        }
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.indices.lock().get(index).and_then(|docs| docs.get(id).cloned())
    }

    pub fn len(&self, index: &str) -> usize {
        self.indices.lock().get(index).map_or(0, BTreeMap::len)
    }

    pub fn add_resource(&self, name: &str) {
        self.resources.lock().insert(name.to_string());
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.lock().contains(name)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn matching(&self, index: &str, query: &Value) -> Vec<(String, Value)> {
        let indices = self.indices.lock();
        let Some(docs) = indices.get(index) else {
            return Vec::new();
        };
        docs.iter()
            .filter(|(_, source)| matches_query(query, source))
            .map(|(id, source)| (id.clone(), source.clone()))
            .collect()
    }

    fn search(&self, index: &str, body: &Value) -> BackendResponse {
        let n = self.searches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_search_at.load(Ordering::SeqCst) == n {
            return BackendResponse::json(
                503,
                &json!({ "error": { "type": "unavailable_shards_exception", "reason": "shard failure" } }),
            );
        }

        let mut matched = self.matching(index, &body["query"]);
        let total = matched.len();

        if let Some(after) = body["search_after"].get(0).and_then(Value::as_str) {
            matched.retain(|(id, _)| id.as_str() > after);
        }

        let size = body["size"].as_u64().map_or(10, |s| s as usize);
        matched.truncate(size.min(self.page_cap.load(Ordering::SeqCst)));

        let source_disabled = body["_source"] == json!(false);
        let omit_sort = self.omit_sort.load(Ordering::SeqCst);
        let hits: Vec<Value> = matched
            .iter()
            .map(|(id, source)| {
                let mut hit = json!({ "_index": index, "_id": id });
                if !source_disabled {
                    hit["_source"] = source.clone();
                }
                if !omit_sort && body.get("sort").is_some() {
                    hit["sort"] = json!([id, 0]);
                }
                hit
            })
            .collect();

        let mut response = json!({
            "took": 1,
            "hits": { "total": { "value": total, "relation": "eq" }, "hits": hits }
        });

        if let Some(aggs) = body["aggs"].as_object() {
            let mut out = Map::new();
            for (key, agg) in aggs {
                let field = summed_field(agg);
                let sum: f64 = matched
                    .iter()
                    .filter_map(|(_, source)| source[&field].as_f64())
                    .sum();
                out.insert(key.clone(), json!({ "value": sum }));
            }
            response["aggregations"] = Value::Object(out);
        }

        BackendResponse::json(200, &response)
    }

    fn bulk(&self, lines: &[Value]) -> BackendResponse {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return BackendResponse::json(
                503,
                &json!({ "error": { "type": "cluster_block_exception", "reason": "read only" } }),
            );
        }

        let mut items = Vec::new();
        let mut errors = false;
        let mut lines = lines.iter();
        while let Some(action_line) = lines.next() {
            let Some((action, meta)) = action_line.as_object().and_then(|m| m.iter().next()) else {
                break;
            };
            let index = meta["_index"].as_str().unwrap_or_default().to_string();
            let id = meta["_id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| self.generate_id());
            let body = if action == "delete" { None } else { lines.next().cloned() };

            let status = if body.as_ref().is_some_and(|b| b["reject"] == json!(true)) {
                errors = true;
                items.push(json!({ action: {
                    "_index": index, "_id": id, "status": 400,
                    "error": { "type": "mapper_parsing_exception", "reason": "rejected" }
                }}));
                continue;
            } else {
                match action.as_str() {
                    "delete" => {
                        let removed = self
                            .indices
                            .lock()
                            .get_mut(&index)
                            .and_then(|docs| docs.remove(&id));
                        if removed.is_some() { 200 } else { 404 }
                    }
                    "update" => {
                        let doc = body.map(|b| b["doc"].clone()).unwrap_or_default();
                        self.insert(&index, &id, doc);
                        200
                    }
                    _ => {
                        self.insert(&index, &id, body.unwrap_or_default());
                        201
                    }
                }
            };

            if status >= 300 {
                errors = true;
            }
            items.push(json!({ action: { "_index": index, "_id": id, "status": status } }));
        }

        BackendResponse::json(200, &json!({ "took": 1, "errors": errors, "items": items }))
    }

    fn generate_id(&self) -> String {
        format!("gen-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn exists(&self, name: &str) -> BackendResponse {
        let status = if self.has_resource(name) { 200 } else { 404 };
        BackendResponse { status, ..Default::default() }
    }

    fn provision(&self, name: &str) -> BackendResponse {
        self.add_resource(name);
        BackendResponse::json(200, &json!({ "acknowledged": true }))
    }
}

#[async_trait]
impl Executor for MemoryBackend {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse> {
        self.requests.lock().push(request.clone());

        let response = match &request {
            BackendRequest::Info => BackendResponse::json(
                200,
                &json!({ "cluster_name": "memory", "version": { "number": "2.11.0" } }),
            ),
            BackendRequest::Search { index, body } => self.search(index, body),
            BackendRequest::Count { index, body } => {
                let count = self.matching(index, &body["query"]).len();
                BackendResponse::json(200, &json!({ "count": count }))
            }
            BackendRequest::Index { index, id, body, .. } => {
                let id = id.clone().unwrap_or_else(|| self.generate_id());
                self.insert(index, &id, body.clone());
                BackendResponse::json(201, &json!({ "_index": index, "_id": id, "result": "created" }))
            }
            BackendRequest::Update { index, id, body, .. } => match self.get(index, id) {
                Some(mut existing) => {
                    merge(&mut existing, &body["doc"]);
                    self.insert(index, id, existing);
                    BackendResponse::json(200, &json!({ "_index": index, "_id": id, "result": "updated" }))
                }
                None => BackendResponse::json(
                    404,
                    &json!({ "error": { "type": "document_missing_exception", "reason": "document missing" } }),
                ),
            },
            BackendRequest::DeleteByQuery { index, body, .. } => {
                let matched = self.matching(index, &body["query"]);
                if let Some(docs) = self.indices.lock().get_mut(index) {
                    for (id, _) in &matched {
                        docs.remove(id);
                    }
                }
                BackendResponse::json(200, &json!({ "deleted": matched.len() }))
            }
            BackendRequest::Bulk { lines, .. } => self.bulk(lines),
            BackendRequest::ComponentTemplateExists { name }
            | BackendRequest::IndexTemplateExists { name }
            | BackendRequest::DataStreamExists { name }
            | BackendRequest::IndexExists { name } => self.exists(name),
            BackendRequest::PutComponentTemplate { name, .. }
            | BackendRequest::PutIndexTemplate { name, .. }
            | BackendRequest::CreateDataStream { name }
            | BackendRequest::CreateIndex { name } => self.provision(name),
        };

        Ok(response)
    }
}

/// Executor whose transport always fails.
pub struct Unreachable;

#[async_trait]
impl Executor for Unreachable {
    async fn execute(&self, _request: BackendRequest) -> Result<BackendResponse> {
        Err(RepositoryError::Backend("connection refused".into()))
    }
}

fn matches_query(query: &Value, source: &Value) -> bool {
    let clauses = |predicate: &str| -> Vec<Value> {
        query["bool"][predicate].as_array().cloned().unwrap_or_default()
    };

    let required = clauses("filter").into_iter().chain(clauses("must"));
    let required_ok = required.into_iter().all(|c| matches_clause(&c, source));
    let excluded = clauses("must_not").iter().any(|c| matches_clause(c, source));

    required_ok && !excluded
}

fn matches_clause(clause: &Value, source: &Value) -> bool {
    let Some((query_type, params)) = clause.as_object().and_then(|m| m.iter().next()) else {
        return false;
    };
    match query_type.as_str() {
        "match_all" => true,
        "term" | "match" => params.as_object().is_some_and(|fields| {
            fields.iter().all(|(field, expected)| {
                let expected = expected.get("value").unwrap_or(expected);
                source.get(field) == Some(expected)
            })
        }),
        _ => true,
    }
}

fn summed_field(agg: &Value) -> String {
    agg["scripted_metric"]["map_script"]
        .as_str()
        .and_then(|script| script.split("doc['").nth(1))
        .and_then(|rest| rest.split("']").next())
        .unwrap_or_default()
        .to_string()
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
