//! Search options.
//!
//! [`SearchOption`] is the declarative, caller-facing description of a
//! search, count, or delete-by-query. It is turned into a [`Query`] by
//! [`SearchOption::prepare_query`] and [`SearchOption::prepare_search`].
//! Options that cannot be applied are dropped rather than reported.

use crate::query::{
    BoolPredicate, BoolQuery, Query, RangeQuery, ScriptedSum, SortField, Source, MAX_RESULT_SIZE,
};
use serde_json::{json, Map, Value};
use std::fmt;

/// Options for search, count and delete-by-query operations.
///
/// Cloning produces an independent deep copy.
///
/// # Example
///
/// ```rust
/// use armature_docstore::SearchOption;
///
/// let options = SearchOption::new()
///     .with_term("status", "open", "filter")
///     .with_sort(&["created:desc"])
///     .with_size(10);
///
/// let query = options.prepare_search();
/// assert_eq!(query.size, Some(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOption {
    docvalue_fields: bool,
    exclude_fields: Vec<String>,
    include_fields: Vec<String>,
    matches: Vec<BoolQuery>,
    match_all: bool,
    query_string: String,
    query_string_fields: Vec<String>,
    search_after: Vec<Value>,
    size: usize,
    sort: Vec<SortField>,
    source_enabled: bool,
    sum_field: String,
    sum_key: String,
    terms: Vec<BoolQuery>,
}

impl Default for SearchOption {
    fn default() -> Self {
        Self {
            docvalue_fields: false,
            exclude_fields: Vec::new(),
            include_fields: Vec::new(),
            matches: Vec::new(),
            match_all: false,
            query_string: String::new(),
            query_string_fields: Vec::new(),
            search_after: Vec::new(),
            size: 0,
            sort: Vec::new(),
            source_enabled: true,
            sum_field: String::new(),
            sum_key: String::new(),
            terms: Vec::new(),
        }
    }
}

impl SearchOption {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `term` clause. Ignored when the field or predicate is blank or
    /// the value is null.
    pub fn with_term(
        mut self,
        field: &str,
        value: impl Into<Value>,
        predicate: impl Into<String>,
    ) -> Self {
        if let Some(clause) = field_clause("term", field, value.into(), predicate.into()) {
            self.terms.push(clause);
        }
        self
    }

    /// Add a `match` clause. Ignored when the field or predicate is blank or
    /// the value is null.
    pub fn with_match(
        mut self,
        field: &str,
        value: impl Into<Value>,
        predicate: impl Into<String>,
    ) -> Self {
        if let Some(clause) = field_clause("match", field, value.into(), predicate.into()) {
            self.matches.push(clause);
        }
        self
    }

    /// Add a `range` clause. Ignored when no bound is set.
    pub fn with_range(mut self, field: &str, range: RangeQuery, predicate: impl Into<String>) -> Self {
        let field = field.trim();
        if !field.is_empty() && !range.is_empty() {
            self.terms.push(BoolQuery::new(predicate, "range", range.to_json(field)));
        }
        self
    }

    /// Add an arbitrary bool clause.
    pub fn with_bool(mut self, clause: BoolQuery) -> Self {
        self.terms.push(clause);
        self
    }

    /// Add a `match_all` must clause.
    pub fn with_match_all(mut self, match_all: bool) -> Self {
        self.match_all = match_all;
        self
    }

    /// Set a free-text `query_string` filter.
    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query_string = query.trim().to_string();
        self
    }

    /// Restrict the query string to these fields. Without fields every field
    /// is searched.
    pub fn with_query_string_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_string_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Include only these source fields.
    pub fn with_include_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Exclude these source fields.
    pub fn with_exclude_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Return include fields from doc values as well.
    pub fn with_docvalue_fields(mut self, enabled: bool) -> Self {
        self.docvalue_fields = enabled;
        self
    }

    /// Whether hits carry their source. Include/exclude fields are ignored
    /// when disabled.
    pub fn with_source(mut self, enabled: bool) -> Self {
        self.source_enabled = enabled;
        self
    }

    /// Replace the sort with `<field>:<asc|desc>` pairs. Malformed pairs are
    /// dropped.
    pub fn with_sort(mut self, pairs: &[&str]) -> Self {
        self.sort = pairs.iter().filter_map(|p| SortField::parse(p)).collect();
        self
    }

    /// Append cursor values. Only used together with a sort.
    pub fn with_search_after(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.search_after.extend(values);
        self
    }

    /// Cap the number of results. Without a size the search paginates over
    /// every match.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sum a numeric field, given as `<field>:<key>`. The total is reported
    /// under `<key>` in the result metrics.
    pub fn with_sum(mut self, sum: &str) -> Self {
        let parts: Vec<&str> = sum.trim().split(':').collect();
        if let [field, key] = parts.as_slice() {
            let (field, key) = (field.trim(), key.trim());
            if !field.is_empty() && !key.is_empty() {
                self.sum_field = field.to_string();
                self.sum_key = key.to_string();
            }
        }
        self
    }

    /// Whether the result size is capped.
    pub fn limit_result(&self) -> bool {
        self.size > 0
    }

    /// Whether a field sum was requested.
    pub fn sum(&self) -> bool {
        !self.sum_field.is_empty() && !self.sum_key.is_empty()
    }

    /// Metric key for the requested sum.
    pub fn sum_key(&self) -> &str {
        &self.sum_key
    }

    /// Current cursor values.
    pub fn search_after(&self) -> &[Value] {
        &self.search_after
    }

    /// Replace sort and cursor in one step.
    pub(crate) fn set_cursor(&mut self, sort: Vec<SortField>, search_after: Vec<Value>) {
        self.sort = sort;
        self.search_after = search_after;
    }

    /// Build the bool query: terms, then matches, then the query string
    /// filter, then `match_all`.
    pub fn prepare_query(&self) -> Query {
        let mut query = Query::new();

        query.add_bool(self.terms.iter().cloned());
        query.add_bool(self.matches.iter().cloned());

        if !self.query_string.is_empty() {
            let mut params = json!({ "query": self.query_string });
            if !self.query_string_fields.is_empty() {
                params["fields"] = json!(self.query_string_fields);
            }
            query.add_bool([BoolQuery::new(BoolPredicate::Filter.as_str(), "query_string", params)]);
        }

        if self.match_all {
            query.add_bool([BoolQuery::new(BoolPredicate::Must.as_str(), "match_all", json!({}))]);
        }

        query
    }

    /// Build the full search request.
    ///
    /// Size is clamped to [`MAX_RESULT_SIZE`]. With a sort and a cursor the
    /// size is forced to the maximum and total hit tracking is disabled. A
    /// sum suppresses source retrieval.
    pub fn prepare_search(&self) -> Query {
        let mut query = self.prepare_query();

        if self.size > 0 {
            query.size = Some(self.size.min(MAX_RESULT_SIZE));
        }

        query.source = if !self.source_enabled {
            Some(Source::Disabled)
        } else if self.include_fields.is_empty() && self.exclude_fields.is_empty() {
            None
        } else {
            Some(Source::Filter {
                includes: self.include_fields.clone(),
                excludes: self.exclude_fields.clone(),
            })
        };

        if !self.sort.is_empty() {
            query.sort = self.sort.clone();

            if !self.search_after.is_empty() {
                query.search_after = self.search_after.clone();
                query.size = Some(MAX_RESULT_SIZE);
                query.track_total_hits = Some(false);
            }
        }

        if self.sum() {
            query
                .aggs
                .insert(self.sum_key.clone(), ScriptedSum::new(&self.sum_field).to_json());
            query.source = Some(Source::Disabled);
        }

        if self.docvalue_fields && !self.include_fields.is_empty() {
            query.docvalue_fields = self.include_fields.clone();
        }

        query
    }
}

impl fmt::Display for SearchOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut options = Map::new();
        options.insert("exclude_fields".into(), json!(self.exclude_fields));
        options.insert("include_fields".into(), json!(self.include_fields));
        options.insert("matches".into(), json!(self.matches));
        options.insert("match_all".into(), json!(self.match_all));
        options.insert("query_string".into(), json!(self.query_string));
        options.insert("query_string_fields".into(), json!(self.query_string_fields));
        options.insert("search_after".into(), json!(self.search_after));
        options.insert("size".into(), json!(self.size));
        options.insert("sort".into(), json!(self.sort));
        options.insert("source_enabled".into(), json!(self.source_enabled));
        options.insert("sum_field".into(), json!(self.sum_field));
        options.insert("sum_key".into(), json!(self.sum_key));
        options.insert("terms".into(), json!(self.terms));

        let rendered = serde_json::to_string_pretty(&options).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

fn field_clause(query_type: &str, field: &str, value: Value, predicate: String) -> Option<BoolQuery> {
    let field = field.trim();
    let predicate = predicate.trim();
    if field.is_empty() || predicate.is_empty() || value.is_null() {
        return None;
    }
    Some(BoolQuery::new(predicate, query_type, json!({ field: value })))
}
