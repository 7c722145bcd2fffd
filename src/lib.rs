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

//! # drilldown
//!
//! A lazy, hierarchical aggregation explorer. The [`Explorer`] owns a tree of aggregate
//! [`Node`]s (e.g. *region* → *client* → *item*) whose levels are fetched from an
//! [`AggregationService`] only when a node is first expanded, then cached until the
//! [`FilterContext`] changes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use drilldown::{Explorer, FilterContext, GraphConfig, Neo4jService, Path, SourceSchema};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let graph = GraphConfig::new("bolt://localhost:7687", "neo4j", "pass", None);
//!     let schema = SourceSchema::new("Sale", vec!["region".into(), "client".into(), "item".into()])?;
//!     let hierarchy = schema.hierarchy()?;
//!     let service = Neo4jService::connect(&graph, schema).await?;
//!     let explorer = Explorer::new(Arc::new(service), hierarchy, FilterContext::default());
//!     explorer.load().await;
//!     explorer.request_expand(&"South/ClientA".parse()?).await;
//!     drilldown::write_jsonl(&explorer.tree(), std::io::stdout())?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::convert::Infallible;
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::{EnumString, IntoStaticStr, VariantNames as VariantNamesMacro};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub mod neo4j;

pub use neo4j::{GraphConfig, Neo4jService, SourceSchema};

/// The ordered keys from the first level down to a target [`Node`].
///
/// The empty path addresses the virtual root whose children are the first level. Paths
/// display and parse as `/`-separated keys, so keys containing `/` cannot round-trip through
/// [`FromStr`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<String>);

impl Path {
    /// Returns the path of the virtual root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Creates a path from the ancestor keys, outermost first.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of keys, which is also the depth of the level below the target.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Returns a new path addressing the child `key` of this path's target.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut keys = self.0.clone();
        keys.push(key.into());
        Self(keys)
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, ancestors) = self.0.split_last()?;
        Some(Self(ancestors.to_vec()))
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl FromStr for Path {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.split('/').filter(|k| !k.is_empty())))
    }
}

impl From<Vec<String>> for Path {
    fn from(keys: Vec<String>) -> Self {
        Self(keys)
    }
}

/// The fetch state of a node's children, independent of whether the node is expanded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message")]
pub enum FetchStatus {
    /// Never requested in the current generation.
    #[default]
    Idle,
    /// A request is outstanding.
    Loading,
    /// The children were fetched (possibly empty).
    Loaded,
    /// The request failed; the children are empty.
    Failed(String),
}

impl FetchStatus {
    /// Returns `true` once the request has completed, successfully or not.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Loaded | Self::Failed(_))
    }
}

/// Whether a hierarchy level holds aggregate nodes or itemized records.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    IntoStaticStr,
    VariantNamesMacro,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Expansion yields more aggregate siblings.
    Branch,
    /// Expansion yields [`LeafRecord`]s.
    Leaf,
}

/// The fixed, ordered levels of the aggregation hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    levels: Vec<String>,
}

impl Hierarchy {
    /// Creates a [`Hierarchy`] from level names, outermost first. At least one level is
    /// required; the last level is itemized.
    pub fn new<I, S>(levels: I) -> Result<Self, Box<dyn Error + Send + Sync>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        if levels.is_empty() {
            return Err("A hierarchy requires at least one level".into());
        }
        for (i, level) in levels.iter().enumerate() {
            if levels[..i].contains(level) {
                return Err(format!("Duplicate hierarchy level '{level}'").into());
            }
        }
        Ok(Self { levels })
    }

    /// Returns the hierarchy length `D`.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Returns the name of the level at `depth`.
    pub fn level(&self, depth: usize) -> Option<&str> {
        self.levels.get(depth).map(String::as_str)
    }

    /// Returns [`Mode::Leaf`] for the deepest level (`D - 1`) and [`Mode::Branch`] above it.
    pub fn mode_of(&self, depth: usize) -> Mode {
        if depth + 1 >= self.levels.len() {
            Mode::Leaf
        } else {
            Mode::Branch
        }
    }
}

/// How aggregate values are computed.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    IntoStaticStr,
    VariantNamesMacro,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Sum of quantity × unit value.
    #[default]
    Value,
    /// Sum of quantity.
    Quantity,
    /// Number of underlying facts.
    Count,
}

impl AnalysisMode {
    /// Returns the name used on the command line and in serialized filters.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Returns the next mode, wrapping around.
    pub fn next(self) -> Self {
        match self {
            Self::Value => Self::Quantity,
            Self::Quantity => Self::Count,
            Self::Count => Self::Value,
        }
    }
}

/// The query context passed unchanged to every fetch. Any change to it invalidates the
/// whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterContext {
    /// Inclusive lower bound on the fact date (ISO-8601).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    /// Inclusive upper bound on the fact date (ISO-8601).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
    /// Boolean fact flags; facts with any of these flags set are excluded.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclusions: BTreeSet<String>,
    /// Dimension → allowed values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, BTreeSet<String>>,
    /// Case-insensitive text matched against every hierarchy level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default)]
    pub mode: AnalysisMode,
}

impl FilterContext {
    pub fn with_date_range(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn with_exclusion(mut self, flag: impl Into<String>) -> Self {
        self.exclusions.insert(flag.into());
        self
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions
            .entry(dimension.into())
            .or_default()
            .insert(value.into());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_mode(mut self, mode: AnalysisMode) -> Self {
        self.mode = mode;
        self
    }
}

/// An aggregate returned by [`AggregationService::fetch_siblings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub key: String,
    pub label: String,
    pub value: f64,
}

impl Aggregate {
    pub fn new(key: impl Into<String>, label: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            value,
        }
    }
}

/// An itemized record at the deepest hierarchy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafRecord {
    pub key: String,
    pub name: String,
    pub quantity: f64,
    pub unit_value: f64,
    /// The mean unit value of records with the same name, used as the variance baseline.
    pub average_unit_value: f64,
    pub total_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_condition: Option<String>,
}

impl LeafRecord {
    /// Returns how far the unit value deviates from the average, or `None` when the average
    /// is zero.
    pub fn variance(&self) -> Option<PriceVariance> {
        if self.average_unit_value == 0.0 || !self.average_unit_value.is_finite() {
            return None;
        }
        let percent =
            (self.unit_value - self.average_unit_value) / self.average_unit_value * 100.0;
        let class = if percent.abs() < PriceVariance::FLAT_PERCENT {
            VarianceClass::Flat
        } else if percent > 0.0 {
            VarianceClass::Above
        } else {
            VarianceClass::Below
        };
        Some(PriceVariance { percent, class })
    }
}

/// The deviation of a [`LeafRecord`]'s unit value from its average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceVariance {
    pub percent: f64,
    pub class: VarianceClass,
}

impl PriceVariance {
    /// Deviations smaller than this (in percent, either direction) are [`VarianceClass::Flat`].
    pub const FLAT_PERCENT: f64 = 1.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VarianceClass {
    Flat,
    Above,
    Below,
}

/// The fetched contents below a [`Node`].
///
/// Untouched children are shared by reference between tree snapshots, so
/// [`Arc::ptr_eq`] tells whether a subtree changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
pub enum Children {
    /// Not fetched in the current generation.
    #[default]
    Unfetched,
    /// Aggregate nodes of the next level.
    Branch(Vec<Arc<Node>>),
    /// Itemized records of the deepest level.
    Leaf(Vec<Arc<LeafRecord>>),
}

impl Children {
    /// Returns an empty, fetched sequence of the kind the level holds.
    pub fn empty(mode: Mode) -> Self {
        match mode {
            Mode::Branch => Self::Branch(Vec::new()),
            Mode::Leaf => Self::Leaf(Vec::new()),
        }
    }

    pub fn is_fetched(&self) -> bool {
        !matches!(self, Self::Unfetched)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Unfetched => 0,
            Self::Branch(nodes) => nodes.len(),
            Self::Leaf(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the aggregate children; empty unless this is [`Children::Branch`].
    pub fn nodes(&self) -> &[Arc<Node>] {
        match self {
            Self::Branch(nodes) => nodes,
            _ => &[],
        }
    }

    /// Returns the itemized children; empty unless this is [`Children::Leaf`].
    pub fn records(&self) -> &[Arc<LeafRecord>] {
        match self {
            Self::Leaf(records) => records,
            _ => &[],
        }
    }
}

/// An aggregate node. Nodes hold no parent links; ancestry is carried by the [`Path`] used to
/// reach them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    /// Unique among siblings and stable across refetches.
    pub key: String,
    pub label: String,
    pub value: f64,
    /// 0 for the first level. The virtual root also reports 0.
    pub depth: usize,
    pub children: Children,
    pub status: FetchStatus,
    /// UI visibility only; never triggers a fetch.
    pub expanded: bool,
}

impl Node {
    pub fn new(key: impl Into<String>, label: impl Into<String>, value: f64, depth: usize) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            value,
            depth,
            children: Children::Unfetched,
            status: FetchStatus::Idle,
            expanded: false,
        }
    }

    fn virtual_root() -> Self {
        Self::new("", "All", 0.0, 0)
    }

    fn from_aggregate(aggregate: Aggregate, depth: usize) -> Self {
        Self::new(aggregate.key, aggregate.label, aggregate.value, depth)
    }

    /// Returns the aggregate child with the given key.
    pub fn child(&self, key: &str) -> Option<&Arc<Node>> {
        self.children.nodes().iter().find(|c| c.key == key)
    }
}

/// Returns the node at `path` below `root`, or `None` if any key does not resolve.
pub fn resolve<'a>(root: &'a Arc<Node>, path: &[String]) -> Option<&'a Arc<Node>> {
    path.iter().try_fold(root, |node, key| node.child(key))
}

/// Applies `transform` to the node at `path` below `root` and returns the new root.
///
/// Only the nodes along `path` are copied; every other node is shared with the input. Returns
/// `None`, leaving the input untouched, if `path` does not resolve.
pub fn update<F>(root: &Arc<Node>, path: &[String], transform: F) -> Option<Arc<Node>>
where
    F: FnOnce(&Node) -> Node,
{
    let Some((key, rest)) = path.split_first() else {
        return Some(Arc::new(transform(root)));
    };
    let Children::Branch(children) = &root.children else {
        return None;
    };
    let index = children.iter().position(|c| &c.key == key)?;
    let replaced = update(&children[index], rest, transform)?;
    let mut siblings = children.clone();
    siblings[index] = replaced;
    Some(Arc::new(Node {
        children: Children::Branch(siblings),
        ..Node::clone(root)
    }))
}

/// An immutable snapshot of the explored tree, tagged with the [`FilterContext`] and the
/// generation it belongs to.
#[derive(Debug, Clone)]
pub struct Tree {
    generation: u64,
    filter: Arc<FilterContext>,
    root: Arc<Node>,
}

impl Tree {
    /// Creates an empty tree with nothing fetched.
    pub fn new(filter: FilterContext) -> Self {
        Self {
            generation: 0,
            filter: Arc::new(filter),
            root: Arc::new(Node::virtual_root()),
        }
    }

    /// Creates a tree whose first level is already loaded with `roots`.
    pub fn with_roots(filter: FilterContext, roots: Vec<Node>) -> Self {
        let mut root = Node::virtual_root();
        root.children = Children::Branch(roots.into_iter().map(Arc::new).collect());
        root.status = FetchStatus::Loaded;
        root.expanded = true;
        Self {
            generation: 0,
            filter: Arc::new(filter),
            root: Arc::new(root),
        }
    }

    /// Returns the generation, incremented on every invalidation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn filter(&self) -> &FilterContext {
        &self.filter
    }

    /// Returns the virtual root.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Returns the first-level aggregates.
    pub fn roots(&self) -> &[Arc<Node>] {
        self.root.children.nodes()
    }

    /// Returns the fetch state of the first level.
    pub fn status(&self) -> &FetchStatus {
        &self.root.status
    }

    /// Returns the node at `path`; the empty path yields the virtual root. `None` means the
    /// path is stale and any update aimed at it should be ignored.
    pub fn resolve(&self, path: &Path) -> Option<&Arc<Node>> {
        resolve(&self.root, path.keys())
    }

    /// Returns the node at `path` together with its siblings, in service order.
    pub fn siblings_of(&self, path: &Path) -> &[Arc<Node>] {
        path.parent()
            .and_then(|parent| self.resolve(&parent))
            .map(|parent| parent.children.nodes())
            .unwrap_or_default()
    }

    /// Returns a tree with `transform` applied at `path`, or `None` if `path` is stale.
    pub fn try_update<F>(&self, path: &Path, transform: F) -> Option<Tree>
    where
        F: FnOnce(&Node) -> Node,
    {
        update(&self.root, path.keys(), transform).map(|root| Tree {
            generation: self.generation,
            filter: Arc::clone(&self.filter),
            root,
        })
    }

    /// Returns a tree with `transform` applied at `path`. A stale `path` yields an unchanged
    /// copy of this tree.
    pub fn update<F>(&self, path: &Path, transform: F) -> Tree
    where
        F: FnOnce(&Node) -> Node,
    {
        self.try_update(path, transform)
            .unwrap_or_else(|| self.clone())
    }

    /// Flattens the visible part of the tree: every first-level node, plus the children of
    /// each expanded node.
    pub fn rows(&self) -> Vec<Row> {
        let mut rows = Vec::new();
        collect_rows(&self.root.children, &Path::root(), 0, &mut rows);
        rows
    }

    fn invalidated(&self, filter: FilterContext) -> Tree {
        Tree {
            generation: self.generation + 1,
            filter: Arc::new(filter),
            root: Arc::new(Node::virtual_root()),
        }
    }
}

/// A visible line of the tree, tagged by the level's [`Mode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "row", rename_all = "lowercase")]
pub enum Row {
    Node {
        path: Path,
        label: String,
        value: f64,
        depth: usize,
        #[serde(flatten)]
        status: FetchStatus,
        expanded: bool,
    },
    Item {
        parent: Path,
        depth: usize,
        record: LeafRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        variance: Option<PriceVariance>,
    },
}

fn collect_rows(children: &Children, parent: &Path, depth: usize, rows: &mut Vec<Row>) {
    match children {
        Children::Unfetched => {}
        Children::Branch(nodes) => {
            for node in nodes {
                let path = parent.child(node.key.clone());
                rows.push(Row::Node {
                    path: path.clone(),
                    label: node.label.clone(),
                    value: node.value,
                    depth: node.depth,
                    status: node.status.clone(),
                    expanded: node.expanded,
                });
                if node.expanded {
                    collect_rows(&node.children, &path, depth + 1, rows);
                }
            }
        }
        Children::Leaf(records) => {
            rows.extend(records.iter().map(|record| Row::Item {
                parent: parent.clone(),
                depth,
                record: LeafRecord::clone(record),
                variance: record.variance(),
            }));
        }
    }
}

/// Writes the visible [`Row`]s of `tree` as [JSON Lines](https://jsonlines.org/) then returns
/// the number of rows written.
pub fn write_jsonl<W: Write>(
    tree: &Tree,
    mut output: W,
) -> Result<usize, Box<dyn Error + Send + Sync>> {
    let rows = tree.rows();
    for row in &rows {
        writeln!(output, "{}", serde_json::to_string(row)?)?;
    }
    output.flush()?;
    Ok(rows.len())
}

/// The remote source of aggregates.
#[async_trait]
pub trait AggregationService: Send + Sync {
    /// Returns the aggregates at `depth` below the node addressed by `parent_keys`, in the
    /// order they should be displayed.
    async fn fetch_siblings(
        &self,
        filter: &FilterContext,
        depth: usize,
        parent_keys: &Path,
    ) -> Result<Vec<Aggregate>, Box<dyn Error + Send + Sync>>;

    /// Returns the itemized records below the node addressed by `parent_keys`, in
    /// chronological order.
    async fn fetch_leaf_records(
        &self,
        filter: &FilterContext,
        parent_keys: &Path,
    ) -> Result<Vec<LeafRecord>, Box<dyn Error + Send + Sync>>;
}

/// A response that does not have the shape the explorer requires.
///
/// Displays a generic message; the detail is kept for logs.
#[derive(Debug)]
pub struct MalformedResponse(pub String);

impl Display for MalformedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed response from aggregation service")
    }
}

impl Error for MalformedResponse {}

fn check_aggregates(aggregates: &[Aggregate]) -> Result<(), MalformedResponse> {
    let mut keys = HashSet::new();
    for aggregate in aggregates {
        if aggregate.key.is_empty() {
            return Err(MalformedResponse("empty aggregate key".into()));
        }
        if !keys.insert(aggregate.key.as_str()) {
            return Err(MalformedResponse(format!(
                "duplicate aggregate key '{}'",
                aggregate.key
            )));
        }
        if !aggregate.value.is_finite() {
            return Err(MalformedResponse(format!(
                "non-finite value for '{}'",
                aggregate.key
            )));
        }
    }
    Ok(())
}

fn check_records(records: &[LeafRecord]) -> Result<(), MalformedResponse> {
    let mut keys = HashSet::new();
    for record in records {
        if record.key.is_empty() {
            return Err(MalformedResponse("empty record key".into()));
        }
        if !keys.insert(record.key.as_str()) {
            return Err(MalformedResponse(format!(
                "duplicate record key '{}'",
                record.key
            )));
        }
        let numbers = [
            record.quantity,
            record.unit_value,
            record.average_unit_value,
            record.total_value,
        ];
        if numbers.iter().any(|n| !n.is_finite()) {
            return Err(MalformedResponse(format!(
                "non-finite measure for '{}'",
                record.key
            )));
        }
    }
    Ok(())
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, EnumString, IntoStaticStr, VariantNamesMacro,
)]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

/// A fire-and-forget channel for user-facing messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NotificationKind, title: &str, message: &str);
}

/// A [`Notifier`] that emits notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, kind: NotificationKind, title: &str, message: &str) {
        match kind {
            NotificationKind::Info => info!("{}: {}", title, message),
            NotificationKind::Warning => warn!("{}: {}", title, message),
            NotificationKind::Error => error!("{}: {}", title, message),
        }
    }
}

/// The result of [`Explorer::request_expand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// The path does not resolve in the current tree.
    Missing,
    /// The children were already fetched, or failed, in this generation.
    Cached,
    /// A request for the same path is outstanding.
    InFlight,
    /// The children were fetched; holds their count.
    Loaded(usize),
    /// The fetch failed with the given message.
    Failed(String),
    /// The response arrived after the tree was invalidated and was discarded.
    Stale,
}

struct FetchRequest {
    generation: u64,
    filter: Arc<FilterContext>,
    depth: usize,
    mode: Mode,
    label: String,
}

// Returns a node left Loading to Idle when its request is dropped before the response is
// merged, so a later expand fetches again.
struct PendingFetch<'a> {
    store: &'a watch::Sender<Tree>,
    path: &'a Path,
    generation: u64,
    armed: bool,
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reset = self.store.send_if_modified(|tree| {
            if tree.generation != self.generation {
                return false;
            }
            match tree.resolve(self.path) {
                Some(node) if node.status == FetchStatus::Loading => {}
                _ => return false,
            }
            match tree.try_update(self.path, |node| Node {
                status: FetchStatus::Idle,
                ..node.clone()
            }) {
                Some(updated) => {
                    *tree = updated;
                    true
                }
                None => false,
            }
        });
        if reset {
            debug!(
                drilldown.path = %self.path,
                drilldown.generation = self.generation,
                "Fetch dropped before completion"
            );
        }
    }
}

/// Owns the tree and mediates every change to it.
///
/// Mutations happen synchronously inside the [`watch`] channel holding the current [`Tree`];
/// only service calls suspend. A node is marked [`FetchStatus::Loading`] before its request
/// is dispatched, so repeated expansion issues at most one request per path and generation.
pub struct Explorer {
    service: Arc<dyn AggregationService>,
    notifier: Arc<dyn Notifier>,
    hierarchy: Hierarchy,
    store: watch::Sender<Tree>,
}

impl Explorer {
    /// Creates an [`Explorer`] with nothing fetched. Call [`Explorer::load`] to fetch the
    /// first level.
    pub fn new(
        service: Arc<dyn AggregationService>,
        hierarchy: Hierarchy,
        filter: FilterContext,
    ) -> Self {
        let (store, _) = watch::channel(Tree::new(filter));
        Self {
            service,
            notifier: Arc::new(TracingNotifier),
            hierarchy,
            store,
        }
    }

    /// Replaces the [`Notifier`] that receives fetch failures.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Returns the current snapshot.
    pub fn tree(&self) -> Tree {
        self.store.borrow().clone()
    }

    /// Returns a receiver that observes every tree change.
    pub fn subscribe(&self) -> watch::Receiver<Tree> {
        self.store.subscribe()
    }

    /// Fetches the first level.
    pub async fn load(&self) -> Expansion {
        self.request_expand(&Path::root()).await
    }

    /// Expands the node at `path`, fetching its children unless they were already requested
    /// in the current generation.
    pub async fn request_expand(&self, path: &Path) -> Expansion {
        let request = match self.begin_expand(path) {
            Ok(request) => request,
            Err(outcome) => {
                debug!(drilldown.path = %path, "Expand without fetch: {:?}", outcome);
                return outcome;
            }
        };
        info!(
            drilldown.path = %path,
            drilldown.generation = request.generation,
            "Fetching {} level {}",
            <&str>::from(request.mode),
            self.hierarchy.level(request.depth).unwrap_or_default()
        );
        let mut pending = PendingFetch {
            store: &self.store,
            path,
            generation: request.generation,
            armed: true,
        };
        let result = self.fetch_children(path, &request).await;
        pending.armed = false;
        self.finish_expand(path, request, result)
    }

    /// Hides the children of the node at `path`. Fetch state and children are kept, so
    /// expanding again is immediate. Returns `false` if the path does not resolve.
    pub fn collapse(&self, path: &Path) -> bool {
        self.store.send_if_modified(|tree| {
            match tree.resolve(path) {
                Some(node) if node.expanded => {}
                _ => return false,
            }
            match tree.try_update(path, |node| Node {
                expanded: false,
                ..node.clone()
            }) {
                Some(updated) => {
                    *tree = updated;
                    true
                }
                None => false,
            }
        })
    }

    /// Discards the whole tree and starts a new generation under `filter`. Returns the new
    /// generation. Responses to requests issued earlier are dropped when they arrive.
    pub fn invalidate(&self, filter: FilterContext) -> u64 {
        let mut generation = 0;
        self.store.send_modify(|tree| {
            *tree = tree.invalidated(filter);
            generation = tree.generation;
        });
        info!(drilldown.generation = generation, "Invalidated tree");
        generation
    }

    /// Applies a new [`FilterContext`]: if it differs from the current one, invalidates the
    /// tree and fetches the first level again. Returns `None` if the filter is unchanged.
    pub async fn set_filter(&self, filter: FilterContext) -> Option<Expansion> {
        let unchanged = *self.store.borrow().filter == filter;
        if unchanged {
            debug!("Filter context unchanged");
            return None;
        }
        self.invalidate(filter);
        Some(self.load().await)
    }

    /// Invalidates the tree under the current filter and fetches the first level again.
    pub async fn refresh(&self) -> Expansion {
        let filter = self.tree().filter().clone();
        self.invalidate(filter);
        self.load().await
    }

    /// Follows a [`FilterContext`] provider until it closes, invalidating and reloading the
    /// tree on every change.
    pub async fn watch_filters(self: Arc<Self>, mut filters: watch::Receiver<FilterContext>) {
        while filters.changed().await.is_ok() {
            let filter = filters.borrow_and_update().clone();
            let unchanged = *self.store.borrow().filter == filter;
            if unchanged {
                continue;
            }
            self.invalidate(filter);
            let explorer = Arc::clone(&self);
            tokio::spawn(async move {
                explorer.load().await;
            });
        }
        debug!("Filter context provider closed");
    }

    // marks the node expanded and, if it has never been requested, Loading
    fn begin_expand(&self, path: &Path) -> Result<FetchRequest, Expansion> {
        let mut outcome = Err(Expansion::Missing);
        self.store.send_if_modified(|tree| {
            let Some(node) = tree.resolve(path) else {
                return false;
            };
            let depth = path.len();
            let expanded = node.expanded;
            let fetch = node.status == FetchStatus::Idle;
            outcome = match &node.status {
                FetchStatus::Idle => Ok(FetchRequest {
                    generation: tree.generation,
                    filter: Arc::clone(&tree.filter),
                    depth,
                    mode: self.hierarchy.mode_of(depth),
                    label: node.label.clone(),
                }),
                FetchStatus::Loading => Err(Expansion::InFlight),
                FetchStatus::Loaded | FetchStatus::Failed(_) => Err(Expansion::Cached),
            };
            if expanded && !fetch {
                return false;
            }
            let updated = tree.try_update(path, |node| Node {
                expanded: true,
                status: if fetch {
                    FetchStatus::Loading
                } else {
                    node.status.clone()
                },
                ..node.clone()
            });
            match updated {
                Some(updated) => {
                    *tree = updated;
                    true
                }
                None => false,
            }
        });
        outcome
    }

    async fn fetch_children(
        &self,
        path: &Path,
        request: &FetchRequest,
    ) -> Result<Children, Box<dyn Error + Send + Sync>> {
        match request.mode {
            Mode::Branch => {
                let aggregates = self
                    .service
                    .fetch_siblings(&request.filter, request.depth, path)
                    .await?;
                check_aggregates(&aggregates)?;
                Ok(Children::Branch(
                    aggregates
                        .into_iter()
                        .map(|a| Arc::new(Node::from_aggregate(a, request.depth)))
                        .collect(),
                ))
            }
            Mode::Leaf => {
                let records = self
                    .service
                    .fetch_leaf_records(&request.filter, path)
                    .await?;
                check_records(&records)?;
                Ok(Children::Leaf(records.into_iter().map(Arc::new).collect()))
            }
        }
    }

    // merges the response unless the tree moved to a newer generation or the path went away
    fn finish_expand(
        &self,
        path: &Path,
        request: FetchRequest,
        result: Result<Children, Box<dyn Error + Send + Sync>>,
    ) -> Expansion {
        let (children, status) = match result {
            Ok(children) => (children, FetchStatus::Loaded),
            Err(e) => {
                if let Some(malformed) = e.downcast_ref::<MalformedResponse>() {
                    warn!(drilldown.path = %path, "Malformed response: {}", malformed.0);
                }
                (Children::empty(request.mode), FetchStatus::Failed(e.to_string()))
            }
        };
        let outcome = match &status {
            FetchStatus::Failed(message) => Expansion::Failed(message.clone()),
            _ => Expansion::Loaded(children.len()),
        };

        let mut merged = false;
        self.store.send_if_modified(|tree| {
            if tree.generation != request.generation {
                return false;
            }
            let Some(updated) = tree.try_update(path, |node| Node {
                children,
                status,
                ..node.clone()
            }) else {
                return false;
            };
            *tree = updated;
            merged = true;
            true
        });

        if !merged {
            debug!(
                drilldown.path = %path,
                drilldown.generation = request.generation,
                "Discarding stale response"
            );
            return Expansion::Stale;
        }
        match &outcome {
            Expansion::Failed(message) => {
                warn!(drilldown.path = %path, "Fetch failed: {}", message);
                self.notifier.notify(
                    NotificationKind::Error,
                    "Fetch failed",
                    &format!("Could not load {}: {}", request.label, message),
                );
            }
            Expansion::Loaded(count) => {
                debug!(drilldown.path = %path, "Loaded {} children", count);
            }
            _ => {}
        }
        outcome
    }
}

impl Debug for Explorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Explorer")
            .field("hierarchy", &self.hierarchy)
            .field("generation", &self.store.borrow().generation)
            .finish()
    }
}
