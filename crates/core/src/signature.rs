//! Query signatures.
//!
//! Turns an element query into a canonical, comparable signature plus the set of
//! source ids it is restricted to, or explains why the query cannot be tracked.
//!
//! Filter values are canonicalized once, here: `1`, `"1"`, `["1"]` and `[1]` all
//! become `["1"]`, comma-separated strings are split, and negations (`"not 1"`,
//! `["not", 1]`) become `["not", "1"]`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::hash::signature_index;
use crate::registry::ElementTypeRegistry;

/// Source id recorded for queries that match any element of their type.
pub const WILDCARD_SOURCE: i64 = 0;

const COMPARISON_OPERATORS: &[&str] = &[">=", "<=", "!=", ">", "<", "="];

/// Ordering clause of an element query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderBy {
    Column { column: String, descending: bool },
    /// Raw SQL expression; cannot be represented in a stable signature.
    Expression(String),
}

/// Table join of an element query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub kind: String,
    pub table: String,
}

/// A content query as executed by the render pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementQuery {
    pub element_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub joins: Vec<Join>,
}

impl ElementQuery {
    pub fn new(element_type: impl Into<String>) -> Self {
        Self { element_type: element_type.into(), params: BTreeMap::new(), order_by: Vec::new(), joins: Vec::new() }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy::Column { column: column.into(), descending });
        self
    }

    pub fn order_by_expression(mut self, sql: impl Into<String>) -> Self {
        self.order_by.push(OrderBy::Expression(sql.into()));
        self
    }

    pub fn join(mut self, kind: impl Into<String>, table: impl Into<String>) -> Self {
        self.joins.push(Join { kind: kind.into(), table: table.into() });
        self
    }
}

/// Why a query was not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Random ordering makes the result set non-deterministic.
    RandomOrder,
    /// A raw expression cannot be serialized into a stable signature.
    OpaqueExpression,
    /// A relations join filters on rows outside the queried element type.
    RelationJoin,
    /// The query fetches fixed elements, which are tracked as element dependencies.
    FixedElements,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::RandomOrder => "random_order",
            SkipReason::OpaqueExpression => "opaque_expression",
            SkipReason::RelationJoin => "relation_join",
            SkipReason::FixedElements => "fixed_elements",
        };
        f.write_str(reason)
    }
}

/// Canonical signature of a trackable query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySignature {
    pub element_type: String,
    /// Canonical params as JSON with sorted keys and string-array values.
    pub params: String,
    /// Lookup index over `(element_type, params)`.
    pub index: String,
    /// Source ids; `{WILDCARD_SOURCE}` when unrestricted.
    pub source_ids: BTreeSet<i64>,
}

impl QuerySignature {
    pub fn is_wildcard(&self) -> bool {
        self.source_ids.contains(&WILDCARD_SOURCE)
    }
}

/// Encodes element queries into signatures, using the registry for source params.
#[derive(Debug, Clone, Copy)]
pub struct SignatureCodec<'a> {
    registry: &'a ElementTypeRegistry,
}

impl<'a> SignatureCodec<'a> {
    pub fn new(registry: &'a ElementTypeRegistry) -> Self {
        Self { registry }
    }

    /// Decide trackability and build the signature.
    pub fn encode(&self, query: &ElementQuery) -> Result<QuerySignature, SkipReason> {
        let mut canonical: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &query.params {
            let tokens = canonicalize(value);
            if tokens.is_empty() || is_default(name, &tokens) {
                continue;
            }
            canonical.insert(name.clone(), tokens);
        }

        if canonical.get("id").and_then(|ids| closed_positive_ids(ids)).is_some() {
            return Err(SkipReason::FixedElements);
        }
        if canonical.get("slug").is_some_and(|slug| !is_negated(slug)) {
            return Err(SkipReason::FixedElements);
        }

        let mut order = canonical.remove("orderBy").unwrap_or_default();
        for clause in &query.order_by {
            match clause {
                OrderBy::Column { column, descending } => {
                    let direction = if *descending { "desc" } else { "asc" };
                    order.push(format!("{} {direction}", column.trim()));
                }
                OrderBy::Expression(_) => return Err(SkipReason::OpaqueExpression),
            }
        }
        if order.iter().any(|clause| clause.to_ascii_lowercase().contains("rand(")) {
            return Err(SkipReason::RandomOrder);
        }
        if !order.is_empty() {
            canonical.insert("orderBy".to_string(), order);
        }

        let mut joins = Vec::with_capacity(query.joins.len());
        for join in &query.joins {
            let table = join_table_name(&join.table);
            if table == "relations" {
                return Err(SkipReason::RelationJoin);
            }
            joins.push(format!("{} {table}", join.kind.trim().to_ascii_lowercase()));
        }
        if !joins.is_empty() {
            canonical.insert("join".to_string(), joins);
        }

        let source_ids = self
            .registry
            .source_param(&query.element_type)
            .and_then(|param| canonical.get(param))
            .and_then(|tokens| closed_positive_ids(tokens))
            .unwrap_or_else(|| BTreeSet::from([WILDCARD_SOURCE]));

        let params = serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string());
        let index = signature_index(&query.element_type, &params);

        Ok(QuerySignature { element_type: query.element_type.clone(), params, index, source_ids })
    }
}

/// Canonicalize a filter value into an ordered list of string tokens.
pub fn canonicalize(value: &Value) -> Vec<String> {
    let mut tokens = Vec::new();
    flatten(value, &mut tokens);

    let Some(first) = tokens.first().cloned() else {
        return tokens;
    };
    let lower = first.to_ascii_lowercase();
    if matches!(lower.as_str(), "not" | "and" | "or") {
        tokens[0] = lower;
    } else if let Some(rest) = lower.strip_prefix("not ") {
        let negated = first[first.len() - rest.len()..].trim().to_string();
        tokens[0] = negated;
        tokens.insert(0, "not".to_string());
    }
    tokens
}

fn flatten(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => out.push(n.to_string()),
        Value::String(s) => out.extend(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(collapse_operator),
        ),
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        Value::Object(_) => out.push(value.to_string()),
    }
}

/// `"> 1"` becomes `">1"`.
fn collapse_operator(token: &str) -> String {
    for op in COMPARISON_OPERATORS {
        if let Some(rest) = token.strip_prefix(op) {
            return format!("{op}{}", rest.trim_start());
        }
    }
    token.to_string()
}

fn is_default(name: &str, tokens: &[String]) -> bool {
    name == "offset" && tokens == ["0"]
}

fn is_negated(tokens: &[String]) -> bool {
    tokens.first().is_some_and(|first| first == "not")
}

/// Ids of a closed, positive, operator-free list; `None` otherwise.
fn closed_positive_ids(tokens: &[String]) -> Option<BTreeSet<i64>> {
    if tokens.is_empty() {
        return None;
    }
    tokens
        .iter()
        .map(|token| {
            if !token.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            token.parse::<i64>().ok().filter(|id| *id > 0)
        })
        .collect()
}

/// `"{{%relations}} relations"` becomes `"relations"`.
fn join_table_name(table: &str) -> String {
    let name = table.split_whitespace().next().unwrap_or_default();
    name.trim_start_matches("{{")
        .trim_start_matches('%')
        .trim_end_matches("}}")
        .to_ascii_lowercase()
}
