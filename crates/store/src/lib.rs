#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::dbg_macro,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Capability interface to the content store.
//!
//! The engine never links a storage backend directly; it talks to whatever the
//! host provides through the traits in this crate. Queries and updates are
//! SPARQL text with `~name` parameters, batches commit atomically, and the
//! change notifier streams per-resource events. The [`memory`] module ships an
//! in-process backend implementing the whole surface for tests and demos.

pub mod memory;
pub mod sparql;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug, Clone)]
pub enum StoreError {
	#[error("query failed: {0}")]
	Query(String),
	#[error("update failed: {message}{}", .sparql.as_deref().map(|s| format!(" <sparql='{s}'>")).unwrap_or_default())]
	Update {
		message: String,
		sparql: Option<String>,
	},
	#[error("batch execution failed: {0}")]
	Batch(String),
	#[error("store operation was cancelled")]
	Cancelled,
	#[error("connection is closed")]
	Closed,
}

/// A resource description pushed through [`Batch::add_resource`]: one subject
/// plus its predicate/value pairs, inserted into a single graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
	pub subject: String,
	pub properties: Vec<(String, Value)>,
}

impl Resource {
	#[must_use]
	pub fn new(subject: impl Into<String>) -> Self {
		Self {
			subject: subject.into(),
			properties: Vec::new(),
		}
	}

	#[must_use]
	pub fn with(mut self, predicate: impl Into<String>, value: impl Into<Value>) -> Self {
		self.properties.push((predicate.into(), value.into()));
		self
	}
}

/// One result row; columns are in the query's selection order.
#[derive(Debug, Clone, Default)]
pub struct Row {
	pub columns: Vec<Option<String>>,
}

impl Row {
	#[must_use]
	pub fn get_string(&self, idx: usize) -> Option<&str> {
		self.columns.get(idx).and_then(Option::as_deref)
	}

	#[must_use]
	pub fn get_int(&self, idx: usize) -> Option<i64> {
		self.get_string(idx).and_then(|s| s.parse().ok())
	}
}

#[async_trait]
pub trait Cursor: Send + Sync {
	async fn next(&mut self) -> Result<Option<Row>, StoreError>;
}

/// Prepared statement with late-bound `~name` parameters.
///
/// One statement must not be executed concurrently from multiple calls;
/// bindings are consumed by `execute`.
#[async_trait]
pub trait Statement: Send {
	fn bind_string(&mut self, name: &str, value: &str);

	fn bind_int(&mut self, name: &str, value: i64);

	async fn execute(&mut self, cancel: &CancellationToken)
		-> Result<Box<dyn Cursor>, StoreError>;
}

/// A pending batch of updates committed as one atomic unit.
#[async_trait]
pub trait Batch: Send {
	fn add_resource(&mut self, graph: &str, resource: Resource);

	fn add_sparql(&mut self, sparql: String);

	async fn execute(self: Box<Self>, cancel: &CancellationToken) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
	Create,
	Update,
	Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
	pub id: i64,
	pub event_type: ChangeEventType,
}

/// A group of change events, one emission per committed batch.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
	pub service: String,
	pub graph: String,
	pub events: Vec<ChangeEvent>,
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
	async fn prepare(&self, sparql: &str) -> Result<Box<dyn Statement>, StoreError>;

	async fn update(&self, sparql: &str, cancel: &CancellationToken) -> Result<(), StoreError>;

	fn create_batch(&self) -> Box<dyn Batch>;

	fn create_notifier(&self) -> async_channel::Receiver<ChangeBatch>;
}

pub type DynConnection = Arc<dyn Connection>;

/// Ontology predicates the engine reads and writes.
pub mod ontology {
	pub const FILE_LAST_MODIFIED: &str = "nfo:fileLastModified";
	pub const INTERPRETED_AS: &str = "nie:interpretedAs";
	pub const FOLDER: &str = "nfo:Folder";
	pub const EXTRACTOR_HASH: &str = "tracker:extractorHash";
	pub const MIME_TYPE: &str = "nie:mimeType";
	pub const URL: &str = "nie:url";
}
