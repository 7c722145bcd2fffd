// Copyright 2025 c-fraser
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An [`AggregationService`] that groups fact nodes stored in *Neo4j*.

use crate::{
    Aggregate, AggregationService, AnalysisMode, FilterContext, Hierarchy, LeafRecord,
    MalformedResponse, Path,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{Stream, TryStreamExt};
use neo4rs::{ConfigBuilder, Graph, Query, Row};
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Debug;
use std::pin::Pin;
use tracing::debug;

/// Labels and property names must match this pattern, since they are interpolated into
/// queries.
const IDENTIFIER_PATTERN: &str = "^[A-Za-z_][A-Za-z0-9_]*$";

/// Connection configuration for a *Neo4j* [`Graph`].
#[derive(Clone)]
pub struct GraphConfig {
    uri: String,
    user: String,
    password: String,
    database: String,
}

impl GraphConfig {
    /// Creates a new [`GraphConfig`] with the given connection details.
    ///
    /// If `database` is `None`, defaults to `"neo4j"`.
    pub fn new(
        uri: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: Option<&str>,
    ) -> Self {
        Self {
            uri: uri.into(),
            user: user.into(),
            password: password.into(),
            database: database.unwrap_or("neo4j").to_string(),
        }
    }

    /// Returns the connection URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    async fn connect(&self) -> Result<Graph, Box<dyn Error + Send + Sync>> {
        let cfg = ConfigBuilder::default()
            .uri(&self.uri)
            .user(&self.user)
            .password(&self.password)
            .db(self.database.as_str())
            .build()?;
        Ok(Graph::connect(cfg).await?)
    }
}

impl Debug for GraphConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConfig")
            .field("uri", &self.uri)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .finish()
    }
}

/// Where the facts live: the node label, one property per hierarchy level, and the measure
/// properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSchema {
    label: String,
    levels: Vec<String>,
    quantity: String,
    unit_value: String,
    date: String,
    payment_condition: Option<String>,
}

impl SourceSchema {
    /// Creates a [`SourceSchema`] for facts labelled `label`, grouped by the `levels`
    /// properties, with the default measure properties `quantity`, `unit_value`, `date` and
    /// `payment_condition`.
    pub fn new(
        label: impl Into<String>,
        levels: Vec<String>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let schema = Self {
            label: label.into(),
            levels,
            quantity: "quantity".into(),
            unit_value: "unit_value".into(),
            date: "date".into(),
            payment_condition: Some("payment_condition".into()),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Replaces the measure properties. A `payment_condition` of `None` leaves it off leaf
    /// records.
    pub fn with_properties(
        mut self,
        quantity: impl Into<String>,
        unit_value: impl Into<String>,
        date: impl Into<String>,
        payment_condition: Option<&str>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        self.quantity = quantity.into();
        self.unit_value = unit_value.into();
        self.date = date.into();
        self.payment_condition = payment_condition.map(str::to_string);
        self.validate()?;
        Ok(self)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Returns the [`Hierarchy`] formed by the level properties.
    pub fn hierarchy(&self) -> Result<Hierarchy, Box<dyn Error + Send + Sync>> {
        Hierarchy::new(self.levels.iter().cloned())
    }

    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        check_identifiers(
            [&self.label, &self.quantity, &self.unit_value, &self.date]
                .into_iter()
                .chain(&self.levels)
                .chain(&self.payment_condition)
                .map(String::as_str),
        )?;
        self.hierarchy().map(|_| ())
    }
}

fn check_identifiers<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let identifier = Regex::new(IDENTIFIER_PATTERN)?;
    for name in names {
        if !identifier.is_match(name) {
            return Err(format!("Invalid identifier '{name}'").into());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Param {
    Text(String),
    List(Vec<String>),
}

/// A query with its parameters, kept apart from [`Query`] so it can be inspected.
#[derive(Debug, Clone, PartialEq)]
struct CypherQuery {
    text: String,
    params: BTreeMap<String, Param>,
}

impl CypherQuery {
    fn into_query(self) -> Query {
        self.params
            .into_iter()
            .fold(Query::new(self.text), |query, (key, value)| match value {
                Param::Text(text) => query.param(&key, text),
                Param::List(values) => query.param(&key, values),
            })
    }
}

/// Returns the conditions the filter context places on the fact bound to `var`.
fn filter_conditions(
    schema: &SourceSchema,
    filter: &FilterContext,
    var: &str,
    params: &mut BTreeMap<String, Param>,
) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
    let mut conditions = Vec::new();

    if let Some(from) = &filter.date_from {
        conditions.push(format!("toString({var}.{}) >= $date_from", schema.date));
        params.insert("date_from".into(), Param::Text(from.clone()));
    }
    if let Some(to) = &filter.date_to {
        conditions.push(format!("toString({var}.{}) <= $date_to", schema.date));
        params.insert("date_to".into(), Param::Text(to.clone()));
    }

    check_identifiers(filter.exclusions.iter().map(String::as_str))?;
    for flag in &filter.exclusions {
        conditions.push(format!("NOT coalesce({var}.{flag}, false)"));
    }

    check_identifiers(filter.dimensions.keys().map(String::as_str))?;
    for (i, (dimension, values)) in filter.dimensions.iter().enumerate() {
        let param = format!("dimension_{i}");
        conditions.push(format!("toString({var}.{dimension}) IN ${param}"));
        params.insert(param, Param::List(values.iter().cloned().collect()));
    }

    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        conditions.push(format!(
            "any(p IN $search_properties WHERE toLower(toString({var}[p])) CONTAINS toLower($search))"
        ));
        params.insert("search".into(), Param::Text(search.to_string()));
        params.insert(
            "search_properties".into(),
            Param::List(schema.levels.clone()),
        );
    }

    Ok(conditions)
}

/// Returns the conditions pinning the fact bound to `var` below `parent_keys`.
fn ancestor_conditions(
    schema: &SourceSchema,
    parent_keys: &Path,
    var: &str,
    params: &mut BTreeMap<String, Param>,
) -> Vec<String> {
    schema
        .levels
        .iter()
        .zip(parent_keys.keys())
        .enumerate()
        .map(|(i, (level, key))| {
            let param = format!("key_{i}");
            params.insert(param.clone(), Param::Text(key.clone()));
            format!("toString({var}.{level}) = ${param}")
        })
        .collect()
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn metric(schema: &SourceSchema, mode: AnalysisMode, var: &str) -> String {
    match mode {
        AnalysisMode::Value => format!(
            "sum(toFloat({var}.{}) * toFloat({var}.{}))",
            schema.quantity, schema.unit_value
        ),
        AnalysisMode::Quantity => format!("sum(toFloat({var}.{}))", schema.quantity),
        AnalysisMode::Count => format!("count({var})"),
    }
}

fn siblings_query(
    schema: &SourceSchema,
    filter: &FilterContext,
    depth: usize,
    parent_keys: &Path,
) -> Result<CypherQuery, Box<dyn Error + Send + Sync>> {
    if parent_keys.len() != depth || depth + 1 >= schema.levels.len() {
        return Err(format!(
            "Cannot aggregate level {depth} below {parent_keys} in a {} level hierarchy",
            schema.levels.len()
        )
        .into());
    }
    let level = &schema.levels[depth];
    let mut params = BTreeMap::new();
    let mut conditions = ancestor_conditions(schema, parent_keys, "n", &mut params);
    conditions.extend(filter_conditions(schema, filter, "n", &mut params)?);
    conditions.push(format!("n.{level} IS NOT NULL"));
    let text = format!(
        "MATCH (n:{label}){where_clause} \
         RETURN toString(n.{level}) AS key, toFloat({metric}) AS value \
         ORDER BY value DESC, key",
        label = schema.label,
        where_clause = where_clause(&conditions),
        metric = metric(schema, filter.mode, "n"),
    );
    Ok(CypherQuery { text, params })
}

fn leaf_query(
    schema: &SourceSchema,
    filter: &FilterContext,
    parent_keys: &Path,
) -> Result<CypherQuery, Box<dyn Error + Send + Sync>> {
    if parent_keys.len() + 1 != schema.levels.len() {
        return Err(format!(
            "Cannot itemize below {parent_keys} in a {} level hierarchy",
            schema.levels.len()
        )
        .into());
    }
    let name = &schema.levels[parent_keys.len()];
    let mut params = BTreeMap::new();
    let mut conditions = ancestor_conditions(schema, parent_keys, "n", &mut params);
    conditions.extend(filter_conditions(schema, filter, "n", &mut params)?);
    conditions.push(format!("n.{name} IS NOT NULL"));

    // the average spans every fact with the same name, not only those below the parent
    let mut peer_conditions = vec![format!("m.{name} = n.{name}")];
    peer_conditions.extend(filter_conditions(schema, filter, "m", &mut params)?);

    let payment = match &schema.payment_condition {
        Some(property) => format!("toString(n.{property})"),
        None => "null".to_string(),
    };
    let text = format!(
        "MATCH (n:{label}){where_clause} \
         OPTIONAL MATCH (m:{label}){peer_clause} \
         WITH n, avg(toFloat(m.{unit_value})) AS average \
         RETURN elementId(n) AS key, toString(n.{name}) AS name, \
         toFloat(n.{quantity}) AS quantity, toFloat(n.{unit_value}) AS unit_value, \
         average, {payment} AS payment_condition, toString(n.{date}) AS date \
         ORDER BY date, key",
        label = schema.label,
        where_clause = where_clause(&conditions),
        peer_clause = where_clause(&peer_conditions),
        unit_value = schema.unit_value,
        quantity = schema.quantity,
        date = schema.date,
    );
    Ok(CypherQuery { text, params })
}

/// Async stream of database rows.
type BoxStream<'a, T> =
    Pin<Box<dyn Stream<Item = Result<T, Box<dyn Error + Send + Sync>>> + Send + 'a>>;

fn malformed(column: &str, e: impl Debug) -> MalformedResponse {
    MalformedResponse(format!("column '{column}': {e:?}"))
}

fn column<T: serde::de::DeserializeOwned>(row: &Row, name: &str) -> Result<T, MalformedResponse> {
    row.get::<T>(name).map_err(|e| malformed(name, e))
}

fn stream_aggregates(graph: &Graph, query: CypherQuery) -> BoxStream<'_, Aggregate> {
    Box::pin(try_stream! {
        let mut result = graph.execute(query.into_query()).await?;
        while let Some(row) = result.next().await? {
            let key: String = column(&row, "key")?;
            let value: f64 = column(&row, "value")?;
            yield Aggregate { label: key.clone(), key, value };
        }
    })
}

fn stream_leaf_records(graph: &Graph, query: CypherQuery) -> BoxStream<'_, LeafRecord> {
    Box::pin(try_stream! {
        let mut result = graph.execute(query.into_query()).await?;
        while let Some(row) = result.next().await? {
            let quantity: f64 = column(&row, "quantity")?;
            let unit_value: f64 = column(&row, "unit_value")?;
            let average: Option<f64> = column(&row, "average")?;
            yield LeafRecord {
                key: column(&row, "key")?,
                name: column(&row, "name")?,
                quantity,
                unit_value,
                average_unit_value: average.unwrap_or(unit_value),
                total_value: quantity * unit_value,
                payment_condition: column(&row, "payment_condition")?,
            };
        }
    })
}

/// Aggregates the facts of a [`SourceSchema`] on request.
pub struct Neo4jService {
    graph: Graph,
    schema: SourceSchema,
}

impl Neo4jService {
    /// Connects to the graph described by `config`.
    pub async fn connect(
        config: &GraphConfig,
        schema: SourceSchema,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        debug!("Connecting to {:?}", config);
        let graph = config.connect().await?;
        Ok(Self { graph, schema })
    }

    pub fn schema(&self) -> &SourceSchema {
        &self.schema
    }
}

impl Debug for Neo4jService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jService")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AggregationService for Neo4jService {
    async fn fetch_siblings(
        &self,
        filter: &FilterContext,
        depth: usize,
        parent_keys: &Path,
    ) -> Result<Vec<Aggregate>, Box<dyn Error + Send + Sync>> {
        let query = siblings_query(&self.schema, filter, depth, parent_keys)?;
        debug!(drilldown.path = %parent_keys, "{}", query.text);
        stream_aggregates(&self.graph, query).try_collect().await
    }

    async fn fetch_leaf_records(
        &self,
        filter: &FilterContext,
        parent_keys: &Path,
    ) -> Result<Vec<LeafRecord>, Box<dyn Error + Send + Sync>> {
        let query = leaf_query(&self.schema, filter, parent_keys)?;
        debug!(drilldown.path = %parent_keys, "{}", query.text);
        stream_leaf_records(&self.graph, query).try_collect().await
    }
}
