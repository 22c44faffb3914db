//! Batched store updates with individual fallback.
//!
//! Delegate callbacks push at most one logical update per dispatched event;
//! the buffer turns them into one atomic batch per flush. A failed batch is
//! re-executed task by task so one poisoned update cannot sink its
//! neighbours, and each still-failing task is reported through the error
//! channel. At most one flush is in flight at a time.

use crate::file_url;

use lode_store::{DynConnection, Resource, StoreError};

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{Arc, Mutex, MutexGuard},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
	/// In the current unflushed batch.
	Queued,
	/// Moved into a commit that is still in flight.
	Flushing,
	/// Not known to the buffer.
	Unknown,
}

/// Per-task failure surfaced after the individual fallback also failed.
#[derive(Debug, Clone)]
pub struct UpdateError {
	pub url: String,
	pub message: String,
	pub sparql: Option<String>,
}

#[derive(Debug, Clone)]
enum Payload {
	Resource { graph: String, resource: Resource },
	Sparql(String),
}

#[derive(Debug, Clone)]
struct UpdateTask {
	file: PathBuf,
	payload: Payload,
}

#[derive(Default)]
struct BufferState {
	queued: Vec<UpdateTask>,
	queued_files: HashMap<PathBuf, usize>,
	flushing_files: HashMap<PathBuf, usize>,
	flush_in_flight: bool,
}

struct Inner {
	conn: DynConnection,
	state: Mutex<BufferState>,
	errors_tx: async_channel::Sender<UpdateError>,
	ready_limit: usize,
}

#[derive(Clone)]
pub struct UpdateBuffer {
	inner: Arc<Inner>,
}

impl UpdateBuffer {
	#[must_use]
	pub fn new(
		conn: DynConnection,
		ready_limit: usize,
	) -> (Self, async_channel::Receiver<UpdateError>) {
		let (errors_tx, errors_rx) = async_channel::unbounded();

		(
			Self {
				inner: Arc::new(Inner {
					conn,
					state: Mutex::new(BufferState::default()),
					errors_tx,
					ready_limit,
				}),
			},
			errors_rx,
		)
	}

	/// Queues a resource description for `file`.
	pub fn push(&self, file: &Path, graph: &str, resource: Resource) -> TaskState {
		self.push_task(UpdateTask {
			file: file.to_path_buf(),
			payload: Payload::Resource {
				graph: graph.to_string(),
				resource,
			},
		})
	}

	/// Queues a raw SPARQL update attributed to `file`.
	pub fn push_sparql(&self, file: &Path, sparql: String) -> TaskState {
		self.push_task(UpdateTask {
			file: file.to_path_buf(),
			payload: Payload::Sparql(sparql),
		})
	}

	fn push_task(&self, task: UpdateTask) -> TaskState {
		let mut state = self.lock();
		*state.queued_files.entry(task.file.clone()).or_default() += 1;
		state.queued.push(task);
		TaskState::Queued
	}

	#[must_use]
	pub fn state(&self, file: &Path) -> TaskState {
		let state = self.lock();
		if state.flushing_files.contains_key(file) {
			TaskState::Flushing
		} else if state.queued_files.contains_key(file) {
			TaskState::Queued
		} else {
			TaskState::Unknown
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.lock().queued.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.lock().queued.is_empty()
	}

	/// Queued plus in-flight task count.
	#[must_use]
	pub fn outstanding(&self) -> usize {
		let state = self.lock();
		state.queued.len() + state.flushing_files.values().sum::<usize>()
	}

	/// Whether dispatch should stall until the next flush.
	#[must_use]
	pub fn at_ready_limit(&self) -> bool {
		self.len() >= self.inner.ready_limit
	}

	/// Whether any queued or in-flight task refers to `root` or a descendant.
	#[must_use]
	pub fn has_tasks_under(&self, root: &Path) -> bool {
		let state = self.lock();
		state
			.queued_files
			.keys()
			.chain(state.flushing_files.keys())
			.any(|file| lode_fs::is_self_or_descendant(file, root))
	}

	/// Commits the current buffer as one atomic batch.
	///
	/// A no-op returning `Ok(false)` when the buffer is empty or another flush
	/// is already in flight. On batch failure every task is retried
	/// individually; tasks failing the retry are reported through the error
	/// channel. Either way the tasks leave the pool when this returns.
	#[instrument(skip(self, cancel), fields(reason = reason))]
	pub async fn flush(
		&self,
		reason: &str,
		cancel: &CancellationToken,
	) -> Result<bool, StoreError> {
		let tasks = {
			let mut state = self.lock();
			if state.flush_in_flight || state.queued.is_empty() {
				trace!(
					in_flight = state.flush_in_flight,
					queued = state.queued.len(),
					"flush skipped"
				);
				return Ok(false);
			}

			state.flush_in_flight = true;
			let tasks = std::mem::take(&mut state.queued);
			state.flushing_files = std::mem::take(&mut state.queued_files);
			tasks
		};

		debug!(tasks = tasks.len(), "flushing update batch");

		let mut batch = self.inner.conn.create_batch();
		for task in &tasks {
			match &task.payload {
				Payload::Resource { graph, resource } => {
					batch.add_resource(graph, resource.clone());
				}
				Payload::Sparql(sparql) => batch.add_sparql(sparql.clone()),
			}
		}

		let result = batch.execute(cancel).await;

		if let Err(e) = result {
			warn!(?e, "batch execution failed, retrying tasks individually");
			self.retry_individually(tasks, cancel).await;
		}

		let mut state = self.lock();
		state.flushing_files.clear();
		state.flush_in_flight = false;
		Ok(true)
	}

	async fn retry_individually(&self, tasks: Vec<UpdateTask>, cancel: &CancellationToken) {
		for task in tasks {
			let result = match &task.payload {
				Payload::Resource { graph, resource } => {
					let mut batch = self.inner.conn.create_batch();
					batch.add_resource(graph, resource.clone());
					batch.execute(cancel).await
				}
				Payload::Sparql(sparql) => self.inner.conn.update(sparql, cancel).await,
			};

			if let Err(e) = result {
				let sparql = match task.payload {
					Payload::Sparql(sparql) => Some(sparql),
					Payload::Resource { .. } => None,
				};

				let _ = self.inner.errors_tx.send_blocking(UpdateError {
					url: file_url(&task.file),
					message: e.to_string(),
					sparql,
				});
			}
		}
	}

	fn lock(&self) -> MutexGuard<'_, BufferState> {
		self.inner.state.lock().expect("update buffer state poisoned")
	}
}
