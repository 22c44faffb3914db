//! Dispatch loop tying the reconciler, event queue and update buffer together.

use crate::{
	event_queue::{EventKind, EventQueue, QueueEvent},
	reconciler::{CompletedPass, Reconciler},
	update_buffer::{TaskState, UpdateBuffer, UpdateError},
	Error, MinerConfig, MinerDelegate,
};

use lode_crawler::CrawlStats;
use lode_fs::{DataProvider, FileInfo, OsDataProvider};
use lode_indexing_tree::{IndexingTree, TreeEvent};
use lode_monitor::{Monitor, MonitorEvent};
use lode_store::DynConnection;

use std::{
	collections::HashSet,
	path::PathBuf,
	sync::{Arc, RwLock},
	time::Duration,
};

use tokio::{
	sync::broadcast,
	time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Upper bound of the throttled idle interval between dispatch slices.
const MAX_INTERVAL: Duration = Duration::from_secs(1);
/// How long the run loop parks when there is nothing to do.
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum MinerSignal {
	Progress {
		progress: f64,
		processed: u64,
		remaining: u64,
		remaining_time_s: Option<u64>,
	},
	FinishedRoot {
		root: PathBuf,
	},
	Finished {
		elapsed_s: f64,
		dirs_found: u32,
		dirs_ignored: u32,
		files_found: u32,
		files_ignored: u32,
	},
	Error {
		url: String,
		message: String,
		sparql: Option<String>,
	},
}

#[derive(Debug, Clone, Copy)]
enum Command {
	Pause,
	Resume,
	Stop,
}

/// Cheap handle for commanding a running miner and subscribing to signals.
#[derive(Clone)]
pub struct MinerHandle {
	commands: async_channel::Sender<Command>,
	signals: broadcast::Sender<MinerSignal>,
}

impl MinerHandle {
	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<MinerSignal> {
		self.signals.subscribe()
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
}

/// Point-in-time view of the pipeline for introspection.
#[derive(Debug, Clone, Default)]
pub struct MinerStatus {
	pub pending_events: usize,
	pub pending_by_root: Vec<(PathBuf, usize)>,
	pub buffered_updates: usize,
	pub processed: u64,
	pub paused: bool,
}

pub struct Miner<D: MinerDelegate, P: DataProvider = OsDataProvider> {
	tree: Arc<RwLock<IndexingTree>>,
	delegate: Arc<D>,
	config: MinerConfig,

	reconciler: Reconciler<P>,
	queue: EventQueue,
	buffer: UpdateBuffer,

	monitor_rx: async_channel::Receiver<MonitorEvent>,
	buffer_errors: async_channel::Receiver<UpdateError>,
	tree_events: broadcast::Receiver<TreeEvent>,
	commands: async_channel::Receiver<Command>,
	signals: broadcast::Sender<MinerSignal>,

	paused: bool,
	blocker: Option<(PathBuf, PathBuf)>,
	processed: u64,
	session: Option<Session>,
	roots_awaiting_finish: Vec<PathBuf>,
	removed_roots: HashSet<PathBuf>,
	last_progress: Instant,
}

struct Session {
	started: Instant,
	stats: CrawlStats,
}

impl<D: MinerDelegate> Miner<D, OsDataProvider> {
	/// Builds a miner over the local filesystem. Must be called from within a
	/// tokio runtime (the monitor spawns its translation task).
	pub fn new(
		tree: Arc<RwLock<IndexingTree>>,
		conn: DynConnection,
		delegate: Arc<D>,
		config: MinerConfig,
	) -> Result<(Self, MinerHandle), Error> {
		Self::with_provider(tree, conn, Arc::new(OsDataProvider), delegate, config)
	}
}

impl<D: MinerDelegate, P: DataProvider> Miner<D, P> {
	pub fn with_provider(
		tree: Arc<RwLock<IndexingTree>>,
		conn: DynConnection,
		provider: Arc<P>,
		delegate: Arc<D>,
		config: MinerConfig,
	) -> Result<(Self, MinerHandle), Error> {
		let (monitor, monitor_rx) = Monitor::new(config.monitor_limit)?;
		let (buffer, buffer_errors) = UpdateBuffer::new(Arc::clone(&conn), config.ready_limit);

		let hash_delegate = Arc::clone(&delegate);
		let reconciler = Reconciler::new(
			Arc::clone(&tree),
			conn,
			provider,
			monitor,
			Arc::new(move |mimetype: &str| hash_delegate.extractor_hash_for(mimetype)),
		);

		let tree_events = tree.read().expect("indexing tree poisoned").subscribe();

		let (command_tx, command_rx) = async_channel::unbounded();
		let (signals, _) = broadcast::channel(256);

		let handle = MinerHandle {
			commands: command_tx,
			signals: signals.clone(),
		};

		Ok((
			Self {
				tree,
				delegate,
				config,
				reconciler,
				queue: EventQueue::new(),
				buffer,
				monitor_rx,
				buffer_errors,
				tree_events,
				commands: command_rx,
				signals,
				paused: false,
				blocker: None,
				processed: 0,
				session: None,
				roots_awaiting_finish: Vec::new(),
				removed_roots: HashSet::new(),
				last_progress: Instant::now(),
			},
			handle,
		))
	}

	#[must_use]
	pub fn status(&self) -> MinerStatus {
		MinerStatus {
			pending_events: self.queue.len(),
			pending_by_root: self.queue.pending_by_root(),
			buffered_updates: self.buffer.len(),
			processed: self.processed,
			paused: self.paused,
		}
	}

	/// Runs the mining loop until cancelled or stopped.
	#[instrument(skip_all)]
	pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
		// Roots registered before the run started.
		let roots = {
			let tree = self.tree.read().expect("indexing tree poisoned");
			tree.roots().to_vec()
		};
		for root in &roots {
			self.begin_session();
			self.reconciler.schedule_root(root);
		}

		info!(roots = roots.len(), "miner started");

		loop {
			if cancel.is_cancelled() {
				return Ok(());
			}

			if !self.drain_control_channels(&cancel).await? {
				return Ok(());
			}

			let mut worked = false;

			if !self.paused {
				worked |= self.reconciler.step(&mut self.queue).await?;
				self.absorb_completed_passes();

				let dispatched = self.dispatch_slice(&cancel).await?;
				worked |= dispatched > 0;

				// Nothing left to dispatch: push out whatever the delegates
				// buffered so roots can be signed off.
				if self.queue.is_empty() && !self.buffer.is_empty() && !self.reconciler.has_work()
				{
					self.buffer.flush("idle", &cancel).await?;
				}

				self.check_finished();
			}

			self.maybe_emit_progress();

			if worked {
				let throttle = self.config.throttle.clamp(0.0, 1.0);
				if throttle > 0.0 {
					sleep(MAX_INTERVAL.mul_f64(throttle)).await;
				} else {
					tokio::task::yield_now().await;
				}
			} else {
				self.idle_wait(&cancel).await;
			}
		}
	}

	/// Applies commands, tree changes, monitor events and buffer errors.
	/// Returns `false` when the miner should stop.
	async fn drain_control_channels(&mut self, _cancel: &CancellationToken) -> Result<bool, Error> {
		while let Ok(command) = self.commands.try_recv() {
			match command {
				Command::Pause => {
					debug!("miner paused");
					self.paused = true;
				}
				Command::Resume => {
					debug!("miner resumed");
					self.paused = false;
				}
				Command::Stop => return Ok(false),
			}
		}

		loop {
			match self.tree_events.try_recv() {
				Ok(event) => self.handle_tree_event(event),
				Err(broadcast::error::TryRecvError::Lagged(missed)) => {
					warn!(missed, "tree event stream lagged");
				}
				Err(_) => break,
			}
		}

		while let Ok(event) = self.monitor_rx.try_recv() {
			// Translation failures are contained to the one event.
			if let Err(e) = self
				.reconciler
				.handle_monitor_event(event, &mut self.queue)
				.await
			{
				warn!(?e, "failed to translate monitor event");
			}
		}

		while let Ok(error) = self.buffer_errors.try_recv() {
			let _ = self.signals.send(MinerSignal::Error {
				url: error.url,
				message: error.message,
				sparql: error.sparql,
			});
		}

		Ok(true)
	}

	fn handle_tree_event(&mut self, event: TreeEvent) {
		match event {
			TreeEvent::DirectoryAdded(path) => {
				let root = {
					let tree = self.tree.read().expect("indexing tree poisoned");
					tree.get_root(&path).cloned()
				};
				if let Some(root) = root {
					self.begin_session();
					self.removed_roots.remove(&root.path);
					self.reconciler.schedule_root(&root);
				}
			}

			TreeEvent::DirectoryUpdated { path, recursive } => {
				let root = {
					let tree = self.tree.read().expect("indexing tree poisoned");
					tree.get_root(&path).cloned()
				};
				if let Some(root) = root {
					if recursive && root.path == path {
						self.begin_session();
						self.reconciler.schedule_root(&root);
					}
				}
			}

			TreeEvent::DirectoryRemoved(path) => {
				// Flags were dropped from the tree along with the root; the
				// default set (no preserve) applies unless the host kept it.
				let flags = lode_indexing_tree::RootFlags::default();
				self.reconciler.remove_root(&path, flags, &mut self.queue);
				self.removed_roots.insert(path.clone());
				self.roots_awaiting_finish.retain(|root| root != &path);
			}
		}
	}

	fn begin_session(&mut self) {
		if self.session.is_none() {
			self.session = Some(Session {
				started: Instant::now(),
				stats: CrawlStats::default(),
			});
			self.processed = 0;
		}
	}

	fn absorb_completed_passes(&mut self) {
		for CompletedPass {
			root,
			stats,
			error,
			non_critical,
			is_root_pass,
		} in self.reconciler.take_completed()
		{
			if let Some(session) = self.session.as_mut() {
				session.stats.merge(&stats);
			}

			for failure in non_critical {
				warn!(root = %root.display(), %failure, "non-critical reconciliation failure");
			}

			if let Some(message) = error {
				let _ = self.signals.send(MinerSignal::Error {
					url: crate::file_url(&root),
					message,
					sparql: None,
				});
			}

			if is_root_pass && !self.roots_awaiting_finish.contains(&root) {
				self.roots_awaiting_finish.push(root);
			}
		}
	}

	async fn dispatch_slice(&mut self, cancel: &CancellationToken) -> Result<usize, Error> {
		let mut dispatched = 0;

		for _ in 0..self.config.max_simultaneous_items {
			if cancel.is_cancelled() {
				break;
			}

			// Back-pressure: drain the buffer before queueing more work.
			if self.buffer.at_ready_limit() {
				self.buffer.flush("ready-limit", cancel).await?;
			}

			// A move in flight blocks dispatch until both sides committed.
			if let Some((src, dst)) = self.blocker.take() {
				if self.buffer.state(&src) == TaskState::Flushing
					|| self.buffer.state(&dst) == TaskState::Flushing
				{
					self.buffer.flush("blocker", cancel).await?;
				}
			}

			let Some(event) = self.queue.pop() else {
				break;
			};

			// Never start on a child while its parent's update is mid-commit.
			if let Some(parent) = event.file.parent() {
				if self.buffer.state(parent) == TaskState::Flushing {
					self.buffer.flush("parent-flushing", cancel).await?;
				}
			}

			self.dispatch_event(event, cancel).await?;
			dispatched += 1;
		}

		Ok(dispatched)
	}

	async fn dispatch_event(
		&mut self,
		event: QueueEvent,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		trace!(kind = ?event.kind, file = %event.file.display(), "dispatching event");

		match event.kind {
			EventKind::Created | EventKind::Updated => {
				let info = match event.info {
					Some(info) => info,
					None => match FileInfo::from_path(&event.file).await {
						Ok(info) => info,
						Err(e) => {
							// Vanished between the event and now; a delete
							// will follow from the monitor.
							debug!(file = %event.file.display(), ?e, "skipping unstatable file");
							return Ok(());
						}
					},
				};

				if event.attributes_only {
					self.delegate
						.process_file_attributes(&event.file, &info, &self.buffer);
				} else {
					self.delegate.process_file(
						&event.file,
						&info,
						&self.buffer,
						event.kind == EventKind::Created,
					);
				}
			}

			EventKind::Deleted => {
				self.delegate
					.remove_file(&event.file, &self.buffer, event.is_dir);
			}

			EventKind::Moved => {
				let Some(dest) = event.dest_file.clone() else {
					return Ok(());
				};

				let (src_recurse, dst_recurse) = {
					let tree = self.tree.read().expect("indexing tree poisoned");
					(
						tree.get_root(&event.file)
							.map_or(false, |root| root.flags.recurse),
						tree.get_root(&dest).map_or(false, |root| root.flags.recurse),
					)
				};

				let recursive = src_recurse && dst_recurse && event.is_dir;

				if event.is_dir && src_recurse && !dst_recurse {
					// The move itself will not carry the subtree.
					self.delegate.remove_children(&event.file, &self.buffer);
				}

				self.delegate
					.move_file(&dest, &event.file, &self.buffer, recursive);

				self.blocker = Some((event.file.clone(), dest));

				// The processed file is the blocker: commit it right away.
				self.buffer.flush("blocker", cancel).await?;
			}
		}

		self.processed += 1;
		Ok(())
	}

	fn check_finished(&mut self) {
		if self.reconciler.has_work() {
			return;
		}

		let mut signed_off = Vec::new();
		self.roots_awaiting_finish.retain(|root| {
			let done = self.queue.root_pending(root) == 0 && !self.buffer.has_tasks_under(root);
			if done {
				signed_off.push(root.clone());
			}
			!done
		});

		for root in signed_off {
			debug!(root = %root.display(), "root finished");
			let _ = self.signals.send(MinerSignal::FinishedRoot { root });
		}

		if self.roots_awaiting_finish.is_empty()
			&& self.queue.is_empty()
			&& self.buffer.outstanding() == 0
		{
			if let Some(session) = self.session.take() {
				let stats = session.stats;
				info!(?stats, "mining session finished");
				let _ = self.signals.send(MinerSignal::Finished {
					elapsed_s: session.started.elapsed().as_secs_f64(),
					dirs_found: stats.dirs_found,
					dirs_ignored: stats.dirs_ignored,
					files_found: stats.files_found,
					files_ignored: stats.files_ignored,
				});
			}
		}
	}

	fn maybe_emit_progress(&mut self) {
		let interval = Duration::from_millis(self.config.progress_interval_ms.max(1));
		if self.last_progress.elapsed() < interval || self.session.is_none() {
			return;
		}
		self.last_progress = Instant::now();

		let remaining = self.queue.len() as u64;
		let total = self.processed + remaining;
		if total == 0 {
			return;
		}

		#[allow(clippy::cast_precision_loss)]
		let progress = (self.processed as f64 / total as f64).clamp(0.02, 1.0);

		let remaining_time_s = (self.processed > 0).then(|| {
			let elapsed = self
				.session
				.as_ref()
				.map_or(0.0, |session| session.started.elapsed().as_secs_f64());
			#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
			let estimate = (elapsed * remaining as f64 / self.processed as f64) as u64;
			estimate
		});

		let _ = self.signals.send(MinerSignal::Progress {
			progress,
			processed: self.processed,
			remaining,
			remaining_time_s,
		});
	}

	/// Parks for one idle slice; inputs are drained at the top of the loop.
	async fn idle_wait(&self, cancel: &CancellationToken) {
		tokio::select! {
			() = cancel.cancelled() => {}
			() = sleep(IDLE_WAIT) => {}
		}
	}
}
