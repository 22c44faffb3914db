//! In-process store backend.
//!
//! Implements the full [`Connection`] surface over hash maps, recognizing the
//! fixed query/update shapes produced by [`crate::sparql`]. Anything else is
//! accepted and ignored, mirroring a schemaless triple store. Used by tests
//! and demos; hosts bring their own backend in production.

use crate::{
	ontology, Batch, ChangeBatch, ChangeEvent, ChangeEventType, Connection, Cursor, Resource,
	Row, Statement, StoreError,
};

use std::{
	collections::{BTreeMap, VecDeque},
	sync::{
		atomic::{AtomicI64, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub const DEFAULT_GRAPH: &str = "lode:files";
const SERVICE: &str = "lode:memory";

#[derive(Debug, Clone, Default)]
pub struct FileRecord {
	pub id: i64,
	pub graph: String,
	pub url: String,
	pub mtime: Option<DateTime<Utc>>,
	pub is_folder: bool,
	pub extractor_hash: Option<String>,
	pub mime_type: Option<String>,
}

#[derive(Debug, Default)]
struct State {
	records: BTreeMap<String, FileRecord>,
	fail_markers: Vec<String>,
	fail_batches: usize,
}

#[derive(Debug, Default)]
struct Inner {
	state: Mutex<State>,
	notifiers: Mutex<Vec<async_channel::Sender<ChangeBatch>>>,
	next_id: AtomicI64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	inner: Arc<Inner>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds a file record directly, bypassing the update machinery.
	pub fn insert_file(
		&self,
		url: &str,
		graph: &str,
		mtime: Option<DateTime<Utc>>,
		is_folder: bool,
		mime_type: Option<&str>,
		extractor_hash: Option<&str>,
	) -> i64 {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		self.lock_state().records.insert(
			url.to_string(),
			FileRecord {
				id,
				graph: graph.to_string(),
				url: url.to_string(),
				mtime,
				is_folder,
				extractor_hash: extractor_hash.map(str::to_string),
				mime_type: mime_type.map(str::to_string),
			},
		);
		id
	}

	#[must_use]
	pub fn record(&self, url: &str) -> Option<FileRecord> {
		self.lock_state().records.get(url).cloned()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.lock_state().records.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.lock_state().records.is_empty()
	}

	/// Makes the next `n` batch executions fail wholesale (individual updates
	/// still succeed), for exercising the per-task fallback path.
	pub fn fail_next_batches(&self, n: usize) {
		self.lock_state().fail_batches = n;
	}

	/// Makes any update whose SPARQL contains `marker` fail, in batches and
	/// individually.
	pub fn fail_sparql_containing(&self, marker: &str) {
		self.lock_state().fail_markers.push(marker.to_string());
	}

	fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
		self.inner.state.lock().expect("memory store state poisoned")
	}

	fn emit(&self, graph: &str, events: Vec<ChangeEvent>) {
		if events.is_empty() {
			return;
		}

		let batch = ChangeBatch {
			service: SERVICE.to_string(),
			graph: graph.to_string(),
			events,
		};

		let mut notifiers = self
			.inner
			.notifiers
			.lock()
			.expect("memory store notifiers poisoned");
		notifiers.retain(|tx| tx.send_blocking(batch.clone()).is_ok());
	}

	fn next_id(&self) -> i64 {
		self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
	}

	fn apply_resource(&self, graph: &str, resource: &Resource) -> ChangeEvent {
		let mut state = self.lock_state();

		let url = resource
			.properties
			.iter()
			.find_map(|(predicate, value)| {
				(predicate == ontology::URL).then(|| value.as_str().map(str::to_string))
			})
			.flatten()
			.unwrap_or_else(|| resource.subject.clone());

		let (id, event_type) = if let Some(existing) = state.records.get(&url) {
			(existing.id, ChangeEventType::Update)
		} else {
			(self.next_id(), ChangeEventType::Create)
		};

		let record = state.records.entry(url.clone()).or_insert_with(|| FileRecord {
			id,
			graph: graph.to_string(),
			url,
			..FileRecord::default()
		});

		for (predicate, value) in &resource.properties {
			match predicate.as_str() {
				ontology::FILE_LAST_MODIFIED => record.mtime = parse_datetime(value),
				ontology::MIME_TYPE => record.mime_type = value.as_str().map(str::to_string),
				ontology::EXTRACTOR_HASH => {
					record.extractor_hash = value.as_str().map(str::to_string);
				}
				ontology::INTERPRETED_AS => record.is_folder = true,
				"rdf:type" => {
					if value.as_str() == Some(ontology::FOLDER) {
						record.is_folder = true;
					}
				}
				_ => {}
			}
		}

		ChangeEvent { id, event_type }
	}

	/// Applies one of the fixed update shapes from [`crate::sparql`]; anything
	/// unrecognized is accepted as a no-op.
	fn apply_sparql(&self, sparql: &str) -> Vec<ChangeEvent> {
		let literals = quoted_literals(sparql);
		let mut state = self.lock_state();

		if sparql.contains("INSERT DATA") && sparql.contains(ontology::EXTRACTOR_HASH) {
			let Some(urn) = angle_iris(sparql).into_iter().next() else {
				return Vec::new();
			};
			let Some(hash) = literals.into_iter().next_back() else {
				return Vec::new();
			};

			return state
				.records
				.values_mut()
				.find(|record| urn_of(record) == urn || record.url == urn)
				.map(|record| {
					record.extractor_hash = Some(hash);
					vec![ChangeEvent {
						id: record.id,
						event_type: ChangeEventType::Update,
					}]
				})
				.unwrap_or_default();
		}

		if sparql.starts_with("DELETE") && sparql.contains("INSERT") {
			// Move: literal order in the fixed shape is [from, from/, to, from].
			let (Some(from), Some(to)) = (literals.first(), literals.get(2)) else {
				return Vec::new();
			};

			let moved = state
				.records
				.extract_if_keys(|url| url == from || url.starts_with(&format!("{from}/")));

			return moved
				.into_iter()
				.map(|(url, mut record)| {
					let new_url = format!("{to}{}", &url[from.len()..]);
					record.url.clone_from(&new_url);
					let id = record.id;
					state.records.insert(new_url, record);
					ChangeEvent {
						id,
						event_type: ChangeEventType::Update,
					}
				})
				.collect();
		}

		if sparql.starts_with("DELETE") && sparql.contains(ontology::EXTRACTOR_HASH) {
			let Some(url) = literals.into_iter().next() else {
				return Vec::new();
			};

			return state
				.records
				.get_mut(&url)
				.map(|record| {
					record.extractor_hash = None;
					vec![ChangeEvent {
						id: record.id,
						event_type: ChangeEventType::Update,
					}]
				})
				.unwrap_or_default();
		}

		if sparql.starts_with("DELETE") {
			let Some(url) = literals.into_iter().next() else {
				return Vec::new();
			};

			let descendants = sparql.contains("STRSTARTS");
			let prefix = url.strip_suffix('/').unwrap_or(&url).to_string();

			let removed = state.records.extract_if_keys(|candidate| {
				if descendants {
					candidate.starts_with(&format!("{prefix}/"))
				} else {
					*candidate == prefix
				}
			});

			return removed
				.into_iter()
				.map(|(_, record)| ChangeEvent {
					id: record.id,
					event_type: ChangeEventType::Delete,
				})
				.collect();
		}

		trace!(sparql, "accepting opaque update");
		Vec::new()
	}

	fn check_failure(&self, sparql: &str) -> Result<(), StoreError> {
		let state = self.lock_state();
		if state
			.fail_markers
			.iter()
			.any(|marker| sparql.contains(marker.as_str()))
		{
			return Err(StoreError::Update {
				message: "injected failure".to_string(),
				sparql: Some(sparql.to_string()),
			});
		}
		Ok(())
	}
}

// BTreeMap has no extract_if on stable; small local helper.
trait ExtractIfKeys {
	fn extract_if_keys(&mut self, pred: impl Fn(&String) -> bool) -> Vec<(String, FileRecord)>;
}

impl ExtractIfKeys for BTreeMap<String, FileRecord> {
	fn extract_if_keys(&mut self, pred: impl Fn(&String) -> bool) -> Vec<(String, FileRecord)> {
		let keys = self
			.keys()
			.filter(|key| pred(key))
			.cloned()
			.collect::<Vec<_>>();

		keys.into_iter()
			.filter_map(|key| self.remove(&key).map(|record| (key, record)))
			.collect()
	}
}

fn urn_of(record: &FileRecord) -> String {
	format!("urn:resource:{}", record.id)
}

fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
	match value {
		Value::String(s) => s.parse().ok(),
		Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
		_ => None,
	}
}

fn quoted_literals(text: &str) -> Vec<String> {
	let mut out = Vec::new();
	let mut rest = text;
	while let Some(start) = rest.find('"') {
		let Some(len) = rest[start + 1..].find('"') else {
			break;
		};
		out.push(rest[start + 1..start + 1 + len].to_string());
		rest = &rest[start + 1 + len + 1..];
	}
	out
}

fn angle_iris(text: &str) -> Vec<String> {
	let mut out = Vec::new();
	let mut rest = text;
	while let Some(start) = rest.find('<') {
		let Some(len) = rest[start + 1..].find('>') else {
			break;
		};
		out.push(rest[start + 1..start + 1 + len].to_string());
		rest = &rest[start + 1 + len + 1..];
	}
	out
}

#[async_trait]
impl Connection for MemoryStore {
	async fn prepare(&self, sparql: &str) -> Result<Box<dyn Statement>, StoreError> {
		Ok(Box::new(MemoryStatement {
			store: self.clone(),
			sparql: sparql.to_string(),
			string_bindings: BTreeMap::new(),
			int_bindings: BTreeMap::new(),
		}))
	}

	async fn update(&self, sparql: &str, cancel: &CancellationToken) -> Result<(), StoreError> {
		if cancel.is_cancelled() {
			return Err(StoreError::Cancelled);
		}

		self.check_failure(sparql)?;

		let events = self.apply_sparql(sparql);
		self.emit(DEFAULT_GRAPH, events);
		Ok(())
	}

	fn create_batch(&self) -> Box<dyn Batch> {
		Box::new(MemoryBatch {
			store: self.clone(),
			ops: Vec::new(),
		})
	}

	fn create_notifier(&self) -> async_channel::Receiver<ChangeBatch> {
		let (tx, rx) = async_channel::unbounded();
		self.inner
			.notifiers
			.lock()
			.expect("memory store notifiers poisoned")
			.push(tx);
		rx
	}
}

struct MemoryStatement {
	store: MemoryStore,
	sparql: String,
	string_bindings: BTreeMap<String, String>,
	int_bindings: BTreeMap<String, i64>,
}

#[async_trait]
impl Statement for MemoryStatement {
	fn bind_string(&mut self, name: &str, value: &str) {
		self.string_bindings
			.insert(name.to_string(), value.to_string());
	}

	fn bind_int(&mut self, name: &str, value: i64) {
		self.int_bindings.insert(name.to_string(), value);
	}

	async fn execute(
		&mut self,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Cursor>, StoreError> {
		if cancel.is_cancelled() {
			return Err(StoreError::Cancelled);
		}

		let state = self.store.lock_state();

		let rows = if self.sparql.contains("SELECT COUNT(?urn)") {
			let count = state
				.records
				.values()
				.filter(|record| pending_extraction(record))
				.count();

			VecDeque::from([Row {
				columns: vec![Some(count.to_string())],
			}])
		} else if self.sparql.contains("?urn ?id ?url") {
			let priority_graphs = angle_iris(&self.sparql);
			let rank = |record: &FileRecord| {
				priority_graphs
					.iter()
					.position(|graph| *graph == record.graph)
					.unwrap_or(priority_graphs.len())
			};

			let mut eligible = state
				.records
				.values()
				.filter(|record| pending_extraction(record))
				.collect::<Vec<_>>();
			eligible.sort_by_key(|record| (rank(record), record.id));

			let offset = usize::try_from(
				self.int_bindings
					.get("offset")
					.copied()
					.unwrap_or_default()
					.max(0),
			)
			.unwrap_or(0);
			let limit =
				usize::try_from(self.int_bindings.get("limit").copied().unwrap_or(i64::MAX))
					.unwrap_or(usize::MAX);

			eligible
				.into_iter()
				.skip(offset)
				.take(limit)
				.map(|record| Row {
					columns: vec![
						Some(urn_of(record)),
						Some(record.id.to_string()),
						Some(record.url.clone()),
						record.mime_type.clone(),
					],
				})
				.collect()
		} else if self.sparql.contains(ontology::FILE_LAST_MODIFIED) {
			let Some(root) = self.string_bindings.get("root") else {
				return Err(StoreError::Query("missing ~root binding".to_string()));
			};

			state
				.records
				.values()
				.filter(|record| {
					record.url == *root || record.url.starts_with(&format!("{root}/"))
				})
				.map(|record| Row {
					columns: vec![
						Some(record.url.clone()),
						record.is_folder.then(|| urn_of(record)),
						record
							.mtime
							.map(|mtime| mtime.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
						record.extractor_hash.clone(),
						record.mime_type.clone(),
					],
				})
				.collect()
		} else {
			return Err(StoreError::Query(format!(
				"unrecognized query shape: {}",
				self.sparql
			)));
		};

		Ok(Box::new(MemoryCursor { rows }))
	}
}

fn pending_extraction(record: &FileRecord) -> bool {
	record.mime_type.is_some() && record.extractor_hash.is_none()
}

struct MemoryCursor {
	rows: VecDeque<Row>,
}

#[async_trait]
impl Cursor for MemoryCursor {
	async fn next(&mut self) -> Result<Option<Row>, StoreError> {
		Ok(self.rows.pop_front())
	}
}

enum BatchOp {
	Resource { graph: String, resource: Resource },
	Sparql(String),
}

struct MemoryBatch {
	store: MemoryStore,
	ops: Vec<BatchOp>,
}

#[async_trait]
impl Batch for MemoryBatch {
	fn add_resource(&mut self, graph: &str, resource: Resource) {
		self.ops.push(BatchOp::Resource {
			graph: graph.to_string(),
			resource,
		});
	}

	fn add_sparql(&mut self, sparql: String) {
		self.ops.push(BatchOp::Sparql(sparql));
	}

	async fn execute(self: Box<Self>, cancel: &CancellationToken) -> Result<(), StoreError> {
		if cancel.is_cancelled() {
			return Err(StoreError::Cancelled);
		}

		{
			let mut state = self.store.lock_state();
			if state.fail_batches > 0 {
				state.fail_batches -= 1;
				return Err(StoreError::Batch("injected batch failure".to_string()));
			}
		}

		// Atomicity check first so a poisoned batch applies nothing.
		for op in &self.ops {
			if let BatchOp::Sparql(sparql) = op {
				self.store
					.check_failure(sparql)
					.map_err(|e| StoreError::Batch(e.to_string()))?;
			}
		}

		let mut events = Vec::with_capacity(self.ops.len());
		let mut graph = DEFAULT_GRAPH.to_string();

		for op in self.ops {
			match op {
				BatchOp::Resource {
					graph: op_graph,
					resource,
				} => {
					graph = op_graph.clone();
					events.push(self.store.apply_resource(&op_graph, &resource));
				}
				BatchOp::Sparql(sparql) => events.extend(self.store.apply_sparql(&sparql)),
			}
		}

		self.store.emit(&graph, events);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::MemoryStore;
	use crate::{
		ontology, sparql, ChangeEventType, Connection, Resource,
	};

	use tokio_util::sync::CancellationToken;

	fn cancel() -> CancellationToken {
		CancellationToken::new()
	}

	#[tokio::test]
	async fn resource_roundtrip_through_batch() {
		let store = MemoryStore::new();
		let notifier = store.create_notifier();

		let mut batch = store.create_batch();
		batch.add_resource(
			"lode:files",
			Resource::new("file:///r/a.txt")
				.with(ontology::URL, "file:///r/a.txt")
				.with(ontology::FILE_LAST_MODIFIED, "2024-05-01T00:00:00Z")
				.with(ontology::MIME_TYPE, "text/plain"),
		);
		batch.execute(&cancel()).await.expect("batch commit");

		let record = store.record("file:///r/a.txt").expect("record exists");
		assert_eq!(record.mime_type.as_deref(), Some("text/plain"));
		assert!(record.mtime.is_some());

		let change = notifier.recv().await.expect("change batch");
		assert_eq!(change.events.len(), 1);
		assert_eq!(change.events[0].event_type, ChangeEventType::Create);
	}

	#[tokio::test]
	async fn delete_descendants_only_touches_the_subtree() {
		let store = MemoryStore::new();
		store.insert_file("file:///r", "g", None, true, None, None);
		store.insert_file("file:///r/a", "g", None, false, None, None);
		store.insert_file("file:///r/a/b", "g", None, false, None, None);
		store.insert_file("file:///rx", "g", None, false, None, None);

		store
			.update(&sparql::delete_descendants("file:///r/a"), &cancel())
			.await
			.expect("update");

		assert!(store.record("file:///r/a").is_some());
		assert!(store.record("file:///r/a/b").is_none());
		assert!(store.record("file:///rx").is_some());

		store
			.update(&sparql::delete_resource("file:///r/a"), &cancel())
			.await
			.expect("update");
		assert!(store.record("file:///r/a").is_none());
	}

	#[tokio::test]
	async fn move_rewrites_the_url_prefix() {
		let store = MemoryStore::new();
		store.insert_file("file:///r/a", "g", None, true, None, None);
		store.insert_file("file:///r/a/x", "g", None, false, None, None);

		store
			.update(&sparql::move_resource("file:///r/a", "file:///r/b"), &cancel())
			.await
			.expect("update");

		assert!(store.record("file:///r/a").is_none());
		assert!(store.record("file:///r/b").is_some());
		assert!(store.record("file:///r/b/x").is_some());
	}

	#[tokio::test]
	async fn reconciliation_query_is_scoped_to_the_root() {
		let store = MemoryStore::new();
		let now = chrono::Utc::now();
		store.insert_file("file:///r/a", "g", Some(now), false, Some("text/plain"), None);
		store.insert_file("file:///other/b", "g", Some(now), false, None, None);

		let mut stmt = store
			.prepare(&sparql::reconciliation_query())
			.await
			.expect("prepare");
		stmt.bind_string("root", "file:///r");

		let mut cursor = stmt.execute(&cancel()).await.expect("execute");
		let row = cursor.next().await.expect("cursor").expect("one row");
		assert_eq!(row.get_string(0), Some("file:///r/a"));
		assert!(cursor.next().await.expect("cursor").is_none());
	}

	#[tokio::test]
	async fn paging_respects_priority_graphs_and_offset() {
		let store = MemoryStore::new();
		for i in 0..3 {
			store.insert_file(
				&format!("file:///normal/{i}"),
				"g:normal",
				None,
				false,
				Some("text/plain"),
				None,
			);
		}
		store.insert_file("file:///hot/x", "g:hot", None, false, Some("text/plain"), None);

		let graphs = vec!["g:hot".to_string()];
		let mut stmt = store
			.prepare(&sparql::decorator_page_query(&graphs))
			.await
			.expect("prepare");
		stmt.bind_int("offset", 0);
		stmt.bind_int("limit", 2);

		let mut cursor = stmt.execute(&cancel()).await.expect("execute");
		let first = cursor.next().await.expect("cursor").expect("row");
		assert_eq!(first.get_string(2), Some("file:///hot/x"));
		assert!(cursor.next().await.expect("cursor").is_some());
		assert!(cursor.next().await.expect("cursor").is_none());

		let mut stmt = store
			.prepare(&sparql::decorator_count_query(&graphs))
			.await
			.expect("prepare");
		let mut cursor = stmt.execute(&cancel()).await.expect("execute");
		let row = cursor.next().await.expect("cursor").expect("row");
		assert_eq!(row.get_int(0), Some(4));
	}

	#[tokio::test]
	async fn batch_failure_applies_nothing() {
		let store = MemoryStore::new();
		store.insert_file("file:///r/a", "g", None, false, None, None);
		store.fail_next_batches(1);

		let mut batch = store.create_batch();
		batch.add_sparql(sparql::delete_resource("file:///r/a"));
		assert!(batch.execute(&cancel()).await.is_err());

		assert!(store.record("file:///r/a").is_some());
	}
}
