//! Query DSL for the repository.
//!
//! [`Query`] is the request document sent to the backend. Clauses are added
//! through [`Query::add_bool`], which groups them by predicate and silently
//! drops anything it cannot place.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Maximum number of documents returned by a single search request.
pub const MAX_RESULT_SIZE: usize = 100_000;

/// Role a clause plays inside a bool query.
///
/// Ordering follows the serialized key order: filter, must, must_not, should.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolPredicate {
    /// Must match, no scoring.
    Filter,
    /// Must match (AND).
    Must,
    /// Must not match (NOT).
    MustNot,
    /// Should match (OR).
    Should,
}

impl BoolPredicate {
    /// Wire name of the predicate.
    pub fn as_str(&self) -> &'static str {
        match self {
            BoolPredicate::Filter => "filter",
            BoolPredicate::Must => "must",
            BoolPredicate::MustNot => "must_not",
            BoolPredicate::Should => "should",
        }
    }
}

impl FromStr for BoolPredicate {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "filter" => Ok(BoolPredicate::Filter),
            "must" => Ok(BoolPredicate::Must),
            "must_not" => Ok(BoolPredicate::MustNot),
            "should" => Ok(BoolPredicate::Should),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BoolPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bool clause: `{ <query_type>: <value> }` under `<predicate>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    /// One of filter, must, must_not, should.
    pub predicate: String,
    /// Backend clause name, e.g. `term`, `match`, `query_string`.
    pub query_type: String,
    /// Clause payload.
    pub value: Option<Value>,
}

impl BoolQuery {
    /// Create a clause.
    pub fn new(
        predicate: impl Into<String>,
        query_type: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            predicate: predicate.into(),
            query_type: query_type.into(),
            value: Some(value.into()),
        }
    }

    /// `term` clause on a single field.
    pub fn term(field: &str, value: impl Into<Value>, predicate: impl Into<String>) -> Self {
        let value: Value = value.into();
        Self::new(predicate, "term", json!({ field: value }))
    }

    /// `match` clause on a single field.
    pub fn matches(field: &str, value: impl Into<Value>, predicate: impl Into<String>) -> Self {
        let value: Value = value.into();
        Self::new(predicate, "match", json!({ field: value }))
    }

    /// Validate and split into predicate and rendered clause.
    fn resolve(&self) -> Option<(BoolPredicate, Value)> {
        let predicate = self.predicate.parse::<BoolPredicate>().ok()?;
        let query_type = self.query_type.trim().to_lowercase();
        if query_type.is_empty() {
            return None;
        }
        let value = self.value.as_ref().filter(|v| !v.is_null())?;
        Some((predicate, json!({ query_type: value })))
    }
}

/// Sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    /// Wire name of the order.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(()),
        }
    }
}

/// One `{field: {order}}` entry of a sort clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    /// Field to sort on.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

impl SortField {
    /// Create a sort entry.
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }

    /// Parse a `<field>:<asc|desc>` pair.
    pub fn parse(pair: &str) -> Option<Self> {
        let (field, order) = pair.split_once(':')?;
        let field = field.trim();
        if field.is_empty() {
            return None;
        }
        Some(Self::new(field, order.parse().ok()?))
    }

    fn to_json(&self) -> Value {
        json!({ &self.field: { "order": self.order.as_str() } })
    }
}

/// Source retrieval mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// `"_source": false`.
    Disabled,
    /// Source filtering with include/exclude lists.
    Filter {
        /// Fields to include.
        includes: Vec<String>,
        /// Fields to exclude.
        excludes: Vec<String>,
    },
}

impl Source {
    fn to_json(&self) -> Value {
        match self {
            Source::Disabled => Value::Bool(false),
            Source::Filter { includes, excludes } => {
                let mut source = Map::new();
                if !includes.is_empty() {
                    source.insert("includes".to_string(), json!(includes));
                }
                if !excludes.is_empty() {
                    source.insert("excludes".to_string(), json!(excludes));
                }
                Value::Object(source)
            }
        }
    }
}

/// Scripted metric aggregation summing a numeric field server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedSum {
    /// Field to sum.
    pub field: String,
}

impl ScriptedSum {
    /// Create a scripted sum over `field`.
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }

    /// Convert to the aggregation body.
    pub fn to_json(&self) -> Value {
        let field = &self.field;
        json!({
            "scripted_metric": {
                "init_script": "state.sum = []",
                "map_script": format!(
                    "state.sum.add(doc['{field}'].size() > 0 ? doc['{field}'].value : 0L)"
                ),
                "combine_script": "long total = 0; for (s in state['sum']) { total += s } return total",
                "reduce_script": "long total = 0; for (s in states) { total += s } return total",
            }
        })
    }
}

/// Range bounds for numeric/date fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeQuery {
    /// Greater than.
    pub gt: Option<Value>,
    /// Greater than or equal.
    pub gte: Option<Value>,
    /// Less than.
    pub lt: Option<Value>,
    /// Less than or equal.
    pub lte: Option<Value>,
    /// Date format (for date fields).
    pub format: Option<String>,
}

impl RangeQuery {
    /// Create an unbounded range.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set greater than.
    pub fn gt(mut self, value: impl Into<Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    /// Set greater than or equal.
    pub fn gte(mut self, value: impl Into<Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    /// Set less than.
    pub fn lt(mut self, value: impl Into<Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    /// Set less than or equal.
    pub fn lte(mut self, value: impl Into<Value>) -> Self {
        self.lte = Some(value.into());
        self
    }

    /// Set date format.
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Whether no bound is set.
    pub fn is_empty(&self) -> bool {
        self.gt.is_none() && self.gte.is_none() && self.lt.is_none() && self.lte.is_none()
    }

    /// Clause value for `field`: `{ field: { gte: .., lt: .. } }`.
    pub fn to_json(&self, field: &str) -> Value {
        let mut range = Map::new();

        if let Some(v) = &self.gt {
            range.insert("gt".to_string(), v.clone());
        }
        if let Some(v) = &self.gte {
            range.insert("gte".to_string(), v.clone());
        }
        if let Some(v) = &self.lt {
            range.insert("lt".to_string(), v.clone());
        }
        if let Some(v) = &self.lte {
            range.insert("lte".to_string(), v.clone());
        }
        if let Some(v) = &self.format {
            range.insert("format".to_string(), json!(v));
        }

        json!({ field: range })
    }
}

/// The request document sent to the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Result size.
    pub size: Option<usize>,
    /// Source retrieval mode.
    pub source: Option<Source>,
    /// Sort clauses.
    pub sort: Vec<SortField>,
    /// Pagination cursor.
    pub search_after: Vec<Value>,
    /// Whether to track exact total hits.
    pub track_total_hits: Option<bool>,
    /// Fields returned from doc values.
    pub docvalue_fields: Vec<String>,
    /// Aggregation requests by name.
    pub aggs: Map<String, Value>,
    clauses: BTreeMap<BoolPredicate, Vec<Value>>,
}

impl Query {
    /// Create an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bool clauses.
    ///
    /// Clauses with an unknown predicate, a blank query type, or a missing
    /// value are dropped. Clauses sharing a predicate accumulate.
    pub fn add_bool(&mut self, clauses: impl IntoIterator<Item = BoolQuery>) {
        for clause in clauses {
            if let Some((predicate, value)) = clause.resolve() {
                self.clauses.entry(predicate).or_default().push(value);
            }
        }
    }

    /// Clauses recorded under `predicate`.
    pub fn clauses(&self, predicate: BoolPredicate) -> &[Value] {
        self.clauses.get(&predicate).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any clause was added.
    pub fn has_query(&self) -> bool {
        !self.clauses.is_empty()
    }

    /// The `{"bool": {...}}` query tree.
    pub fn query_json(&self) -> Value {
        let bool_query: Map<String, Value> = self
            .clauses
            .iter()
            .map(|(predicate, values)| (predicate.as_str().to_string(), Value::Array(values.clone())))
            .collect();
        json!({ "bool": bool_query })
    }

    /// Body for count and delete-by-query requests.
    pub fn query_body(&self) -> Value {
        json!({ "query": self.query_json() })
    }

    /// Full search body.
    pub fn to_json(&self) -> Value {
        let mut body = Map::new();

        if let Some(size) = self.size {
            body.insert("size".to_string(), json!(size));
        }
        if let Some(source) = &self.source {
            body.insert("_source".to_string(), source.to_json());
        }

        body.insert("query".to_string(), self.query_json());

        if !self.sort.is_empty() {
            body.insert(
                "sort".to_string(),
                Value::Array(self.sort.iter().map(SortField::to_json).collect()),
            );
        }
        if !self.search_after.is_empty() {
            body.insert("search_after".to_string(), Value::Array(self.search_after.clone()));
        }
        if let Some(track) = self.track_total_hits {
            body.insert("track_total_hits".to_string(), json!(track));
        }
        if !self.docvalue_fields.is_empty() {
            body.insert("docvalue_fields".to_string(), json!(self.docvalue_fields));
        }
        if !self.aggs.is_empty() {
            body.insert("aggs".to_string(), Value::Object(self.aggs.clone()));
        }

        Value::Object(body)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.to_json()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_parse() {
        assert_eq!(" Filter ".parse::<BoolPredicate>(), Ok(BoolPredicate::Filter));
        assert_eq!("MUST_NOT".parse::<BoolPredicate>(), Ok(BoolPredicate::MustNot));
        assert!("maybe".parse::<BoolPredicate>().is_err());
    }

    #[test]
    fn test_add_bool_drops_invalid_clauses() {
        let mut query = Query::new();
        query.add_bool(vec![
            BoolQuery::new("sometimes", "term", json!({ "a": 1 })),
            BoolQuery::new("filter", "  ", json!({ "a": 1 })),
            BoolQuery {
                predicate: "must".into(),
                query_type: "term".into(),
                value: None,
            },
            BoolQuery::new("must", "term", Value::Null),
        ]);

        assert!(!query.has_query());
    }

    #[test]
    fn test_add_bool_accumulates_across_calls() {
        let mut query = Query::new();
        query.add_bool(vec![BoolQuery::term("status", "open", "filter")]);
        query.add_bool(vec![
            BoolQuery::term("region", "eu", "filter"),
            BoolQuery::matches("title", "rust", "should"),
        ]);

        assert_eq!(
            query.clauses(BoolPredicate::Filter),
            &[
                json!({ "term": { "status": "open" } }),
                json!({ "term": { "region": "eu" } }),
            ]
        );
        assert_eq!(query.clauses(BoolPredicate::Should).len(), 1);
        assert!(query.clauses(BoolPredicate::MustNot).is_empty());
    }

    #[test]
    fn test_add_bool_commutative_within_predicate() {
        let a = BoolQuery::term("status", "open", "filter");
        let b = BoolQuery::term("region", "eu", "filter");

        let mut ab = Query::new();
        ab.add_bool(vec![a.clone(), b.clone()]);
        let mut ba = Query::new();
        ba.add_bool(vec![b, a]);

        let mut left = ab.clauses(BoolPredicate::Filter).to_vec();
        let mut right = ba.clauses(BoolPredicate::Filter).to_vec();
        left.sort_by_key(|v| v.to_string());
        right.sort_by_key(|v| v.to_string());
        assert_eq!(left, right);
    }

    #[test]
    fn test_query_type_is_normalized() {
        let mut query = Query::new();
        query.add_bool(vec![BoolQuery::new("Must", " MATCH_ALL ", json!({}))]);
        assert_eq!(query.clauses(BoolPredicate::Must), &[json!({ "match_all": {} })]);
    }

    #[test]
    fn test_to_json_wire_shape() {
        let mut query = Query::new();
        query.add_bool(vec![BoolQuery::term("status", "open", "filter")]);
        query.size = Some(10);
        query.source = Some(Source::Disabled);
        query.sort = vec![SortField::new("_id", SortOrder::Asc)];
        query.search_after = vec![json!(""), json!("1970-01-01T00:00:00Z")];
        query.track_total_hits = Some(false);

        assert_eq!(
            query.to_json(),
            json!({
                "size": 10,
                "_source": false,
                "query": { "bool": { "filter": [ { "term": { "status": "open" } } ] } },
                "sort": [ { "_id": { "order": "asc" } } ],
                "search_after": ["", "1970-01-01T00:00:00Z"],
                "track_total_hits": false
            })
        );
    }

    #[test]
    fn test_sort_field_parse() {
        assert_eq!(
            SortField::parse("@timestamp:desc"),
            Some(SortField::new("@timestamp", SortOrder::Desc))
        );
        assert_eq!(SortField::parse("field"), None);
        assert_eq!(SortField::parse(":asc"), None);
        assert_eq!(SortField::parse("field:sideways"), None);
    }

    #[test]
    fn test_scripted_sum_body() {
        let agg = ScriptedSum::new("bytes").to_json();
        let metric = &agg["scripted_metric"];
        assert_eq!(metric["init_script"], "state.sum = []");
        assert_eq!(
            metric["map_script"],
            "state.sum.add(doc['bytes'].size() > 0 ? doc['bytes'].value : 0L)"
        );
    }

    #[test]
    fn test_range_query() {
        let range = RangeQuery::new().gte(10).lt(20);
        assert!(!range.is_empty());
        assert_eq!(range.to_json("total"), json!({ "total": { "gte": 10, "lt": 20 } }));
        assert!(RangeQuery::new().format("yyyy").is_empty());
    }
}
