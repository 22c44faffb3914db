//! Resumable metadata-backfill pipeline.
//!
//! Treats the set of store resources lacking an up-to-date extractor hash as
//! a work queue: pages items into a bounded cache, hands each to exactly one
//! consumer, buffers the SPARQL its consumers produce and commits it in
//! atomic batches with an individual-retry fallback. The query is re-run to
//! exhaustion, priority graphs first, and the store's change notifier keeps
//! the pipeline live after it drains.

use crate::Error;

use lode_store::{sparql, ChangeBatch, ChangeEventType, DynConnection, StoreError};

use std::{
	collections::VecDeque,
	sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoratorConfig {
	/// Items fetched per page query.
	pub page_size: usize,
	/// Buffered updates committed per batch.
	pub batch_size: usize,
	/// Graphs whose items are paged before all others.
	pub priority_graphs: Vec<String>,
}

impl Default for DecoratorConfig {
	fn default() -> Self {
		Self {
			page_size: 200,
			batch_size: 200,
			priority_graphs: Vec::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub enum DecoratorSignal {
	/// New work landed in the cache.
	ItemsAvailable,
	/// The work set drained completely.
	Finished,
	Error {
		url: String,
		message: String,
		sparql: Option<String>,
	},
}

/// One unit of extraction work; handed to at most one consumer.
#[derive(Debug)]
pub struct DecoratorItem {
	pub urn: String,
	pub id: i64,
	pub url: String,
	pub mimetype: Option<String>,
	pub task_id: Uuid,
	/// Cancelled when the pipeline is paused or stopped.
	pub cancel: CancellationToken,
}

enum Completion {
	Done {
		item_id: i64,
		url: String,
		sparql: String,
	},
	Failed {
		url: String,
		message: String,
	},
}

#[derive(Debug, Clone, Copy)]
enum Command {
	Pause,
	Resume,
	Stop,
	InvalidateCache,
}

/// Command/consumer handle; cheap to clone.
#[derive(Clone)]
pub struct DecoratorHandle {
	shared: Arc<Shared>,
	commands: async_channel::Sender<Command>,
	completions: async_channel::Sender<Completion>,
	signals: broadcast::Sender<DecoratorSignal>,
}

impl DecoratorHandle {
	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<DecoratorSignal> {
		self.signals.subscribe()
	}

	/// Waits for the next work item. Returns `None` once the pipeline stops.
	pub async fn next(&self) -> Option<DecoratorItem> {
		let waiter = {
			let mut state = self.shared.lock();
			if state.stopped {
				return None;
			}

			if let Some(item) = state.cache.pop_front() {
				state.handed_out += 1;
				return Some(state.to_item(item));
			}

			let (tx, rx) = oneshot::channel();
			state.waiters.push_back(tx);
			rx
		};

		waiter.await.ok()
	}

	/// Reports a successfully produced update for `item`.
	pub fn complete(&self, item: &DecoratorItem, sparql: String) {
		let _ = self.completions.send_blocking(Completion::Done {
			item_id: item.id,
			url: item.url.clone(),
			sparql,
		});
	}

	/// Reports a failed extraction; the pipeline logs and moves on.
	pub fn fail(&self, item: &DecoratorItem, message: String) {
		let _ = self.completions.send_blocking(Completion::Failed {
			url: item.url.clone(),
			message,
		});
	}

	pub async fn pause(&self) {
		let _ = self.commands.send(Command::Pause).await;
	}

	pub async fn resume(&self) {
		let _ = self.commands.send(Command::Resume).await;
	}

	pub async fn stop(&self) {
		let _ = self.commands.send(Command::Stop).await;
	}

	/// Cached and handed-out item counts, for introspection.
	#[must_use]
	pub fn queue_depth(&self) -> (usize, usize) {
		let state = self.shared.lock();
		(state.cache.len(), state.handed_out)
	}

	/// Replaces the priority graph set; invalidates the cache.
	pub async fn set_priority_graphs(&self, graphs: Vec<String>) {
		{
			let mut state = self.shared.lock();
			state.priority_graphs = graphs;
		}
		let _ = self.commands.send(Command::InvalidateCache).await;
	}
}

#[derive(Debug)]
struct CachedItem {
	urn: String,
	id: i64,
	url: String,
	mimetype: Option<String>,
}

struct State {
	cache: VecDeque<CachedItem>,
	waiters: VecDeque<oneshot::Sender<DecoratorItem>>,
	handed_out: usize,
	priority_graphs: Vec<String>,
	consumer_cancel: CancellationToken,
	stopped: bool,
}

impl State {
	fn to_item(&self, cached: CachedItem) -> DecoratorItem {
		DecoratorItem {
			urn: cached.urn,
			id: cached.id,
			url: cached.url,
			mimetype: cached.mimetype,
			task_id: Uuid::new_v4(),
			cancel: self.consumer_cancel.child_token(),
		}
	}
}

struct Shared {
	state: Mutex<State>,
}

impl Shared {
	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().expect("decorator state poisoned")
	}
}

pub struct Decorator {
	conn: DynConnection,
	config: DecoratorConfig,
	shared: Arc<Shared>,

	commands: async_channel::Receiver<Command>,
	completions: async_channel::Receiver<Completion>,
	changes: async_channel::Receiver<ChangeBatch>,
	signals: broadcast::Sender<DecoratorSignal>,

	/// Updates waiting for the next batch commit: `(url, sparql)`.
	buffer: Vec<(String, String)>,
	/// Update count sitting in an in-flight commit.
	committing: usize,
	paused: bool,
	/// Guards against repeating the finished signal while idle.
	finished_emitted: bool,
	restock_armed: bool,
}

impl Decorator {
	#[must_use]
	pub fn new(conn: DynConnection, config: DecoratorConfig) -> (Self, DecoratorHandle) {
		let (command_tx, command_rx) = async_channel::unbounded();
		let (completion_tx, completion_rx) = async_channel::unbounded();
		let (signals, _) = broadcast::channel(256);
		let changes = conn.create_notifier();

		let shared = Arc::new(Shared {
			state: Mutex::new(State {
				cache: VecDeque::new(),
				waiters: VecDeque::new(),
				handed_out: 0,
				priority_graphs: config.priority_graphs.clone(),
				consumer_cancel: CancellationToken::new(),
				stopped: false,
			}),
		});

		let handle = DecoratorHandle {
			shared: Arc::clone(&shared),
			commands: command_tx,
			completions: completion_tx,
			signals: signals.clone(),
		};

		(
			Self {
				conn,
				config,
				shared,
				commands: command_rx,
				completions: completion_rx,
				changes,
				signals,
				buffer: Vec::new(),
				committing: 0,
				paused: false,
				finished_emitted: false,
				restock_armed: true,
			},
			handle,
		)
	}

	/// Runs the pipeline until cancelled or stopped.
	#[instrument(skip_all)]
	pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
		loop {
			if cancel.is_cancelled() {
				self.shut_down();
				return Ok(());
			}

			if !self.paused && self.restock_armed && self.cache_is_empty() {
				self.restock_armed = false;
				self.restock(&cancel).await?;
			}

			tokio::select! {
				() = cancel.cancelled() => {
					self.shut_down();
					return Ok(());
				}

				command = self.commands.recv() => {
					let Ok(command) = command else {
						self.shut_down();
						return Ok(());
					};
					if !self.apply_command(command) {
						self.shut_down();
						return Ok(());
					}
				}

				completion = self.completions.recv() => {
					if let Ok(completion) = completion {
						self.handle_completion(completion, &cancel).await?;
					}
				}

				change = self.changes.recv() => {
					if let Ok(change) = change {
						self.handle_change(&change);
					}
				}
			}
		}
	}

	fn cache_is_empty(&self) -> bool {
		self.shared.lock().cache.is_empty()
	}

	fn apply_command(&mut self, command: Command) -> bool {
		match command {
			Command::Pause => {
				debug!("decorator paused");
				self.paused = true;
				// Cancel every consumer task currently holding an item.
				let mut state = self.shared.lock();
				state.consumer_cancel.cancel();
				state.consumer_cancel = CancellationToken::new();
			}
			Command::Resume => {
				debug!("decorator resumed");
				self.paused = false;
				self.restock_armed = true;
			}
			Command::Stop => return false,
			Command::InvalidateCache => {
				let mut state = self.shared.lock();
				state.cache.clear();
				drop(state);
				self.restock_armed = true;
			}
		}
		true
	}

	fn handle_change(&mut self, change: &ChangeBatch) {
		let mut saw_new = false;

		for event in &change.events {
			match event.event_type {
				ChangeEventType::Create | ChangeEventType::Update => saw_new = true,
				ChangeEventType::Delete => {
					let mut state = self.shared.lock();
					state.cache.retain(|item| item.id != event.id);
				}
			}
		}

		if saw_new && !self.paused {
			self.restock_armed = true;
		}
	}

	async fn handle_completion(
		&mut self,
		completion: Completion,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		{
			let mut state = self.shared.lock();
			state.handed_out = state.handed_out.saturating_sub(1);
		}

		match completion {
			Completion::Done { item_id, url, sparql } => {
				trace!(item_id, url, "extraction result buffered");
				self.buffer.push((url, sparql));

				if self.buffer.len() >= self.config.batch_size {
					self.commit(cancel).await?;
				}
			}
			Completion::Failed { url, message } => {
				warn!(url, message, "extraction task failed");
				let _ = self.signals.send(DecoratorSignal::Error {
					url,
					message,
					sparql: None,
				});
			}
		}

		if self.cache_is_empty() {
			self.restock_armed = true;
		}

		Ok(())
	}

	/// Commits the buffered updates as one atomic batch, retrying
	/// individually on batch failure.
	async fn commit(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
		if self.buffer.is_empty() {
			return Ok(());
		}

		let updates = std::mem::take(&mut self.buffer);
		self.committing = updates.len();
		debug!(updates = self.committing, "committing extraction batch");

		let mut batch = self.conn.create_batch();
		for (_, sparql) in &updates {
			batch.add_sparql(sparql.clone());
		}

		if let Err(e) = batch.execute(cancel).await {
			warn!(?e, "batch commit failed, retrying updates individually");

			for (url, sparql) in updates {
				if let Err(e) = self.conn.update(&sparql, cancel).await {
					let _ = self.signals.send(DecoratorSignal::Error {
						url,
						message: e.to_string(),
						sparql: Some(sparql),
					});
				}
			}
		}

		self.committing = 0;
		self.restock_armed = true;
		Ok(())
	}

	/// Ensures the cache is stocked; may commit a partial batch to unblock
	/// items that are only "remaining" because they sit in the buffer.
	async fn restock(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
		loop {
			let remaining = self.count_remaining(cancel).await?;

			if remaining == 0 {
				if !self.buffer.is_empty() {
					self.commit(cancel).await?;
					continue;
				}

				let handed_out = self.shared.lock().handed_out;
				if handed_out == 0 && self.committing == 0 && !self.finished_emitted {
					self.finished_emitted = true;
					debug!("decorator drained");
					let _ = self.signals.send(DecoratorSignal::Finished);
				}
				return Ok(());
			}

			let rows = self.page(cancel).await?;

			if rows.is_empty() {
				// Everything still matching the filter is in limbo in our own
				// buffer or with consumers; flush what we can and wait.
				if !self.buffer.is_empty() {
					self.commit(cancel).await?;
					continue;
				}
				return Ok(());
			}

			let stocked = rows.len();
			{
				let mut state = self.shared.lock();
				for cached in rows {
					// Consumers may have abandoned their waiters; hand the
					// item to the first live one or cache it.
					let mut cached = Some(cached);
					while let Some(waiter) = state.waiters.pop_front() {
						let item = state.to_item(cached.take().expect("item present"));
						match waiter.send(item) {
							Ok(()) => {
								state.handed_out += 1;
								break;
							}
							Err(item) => {
								cached = Some(CachedItem {
									urn: item.urn,
									id: item.id,
									url: item.url,
									mimetype: item.mimetype,
								});
							}
						}
					}
					if let Some(cached) = cached {
						state.cache.push_back(cached);
					}
				}
			}

			trace!(stocked, remaining, "decorator cache stocked");
			self.finished_emitted = false;
			let _ = self.signals.send(DecoratorSignal::ItemsAvailable);
			return Ok(());
		}
	}

	async fn count_remaining(&self, cancel: &CancellationToken) -> Result<i64, Error> {
		let graphs = self.shared.lock().priority_graphs.clone();
		let mut stmt = self
			.conn
			.prepare(&sparql::decorator_count_query(&graphs))
			.await?;
		let mut cursor = stmt.execute(cancel).await?;

		let count = cursor
			.next()
			.await?
			.and_then(|row| row.get_int(0))
			.ok_or_else(|| StoreError::Query("count query returned no rows".to_string()))?;

		Ok(count)
	}

	async fn page(&self, cancel: &CancellationToken) -> Result<Vec<CachedItem>, Error> {
		let (graphs, in_limbo) = {
			let state = self.shared.lock();
			(
				state.priority_graphs.clone(),
				state.cache.len() + state.handed_out,
			)
		};

		// Skip rows that still match the filter only because their updates
		// have not committed yet.
		let offset = in_limbo + self.buffer.len() + self.committing;

		let mut stmt = self
			.conn
			.prepare(&sparql::decorator_page_query(&graphs))
			.await?;
		#[allow(clippy::cast_possible_wrap)]
		{
			stmt.bind_int("offset", offset as i64);
			stmt.bind_int("limit", self.config.page_size as i64);
		}
		let mut cursor = stmt.execute(cancel).await?;

		let mut rows = Vec::new();
		while let Some(row) = cursor.next().await? {
			let (Some(urn), Some(id), Some(url)) = (
				row.get_string(0).map(str::to_string),
				row.get_int(1),
				row.get_string(2).map(str::to_string),
			) else {
				continue;
			};

			rows.push(CachedItem {
				urn,
				id,
				url,
				mimetype: row.get_string(3).map(str::to_string),
			});
		}

		Ok(rows)
	}

	fn shut_down(&mut self) {
		let mut state = self.shared.lock();
		state.stopped = true;
		state.consumer_cancel.cancel();
		state.cache.clear();
		state.waiters.clear();
	}
}
