//! Per-root reconciliation.
//!
//! For each scheduled root the reconciler runs a disk pass (breadth-first
//! crawl of pending directories) and a store pass (one parameterized query
//! over the root's recorded descendants), merges both into a per-file map and
//! emits the create/update/delete diff into the event queue. Live monitor
//! events are translated into queue events here as well.

use crate::{
	event_queue::{EventKind, EventQueue, QueueEvent},
	file_url, Error, NonCriticalMinerError,
};

use lode_collections::{LruCache, Priority};
use lode_crawler::{CrawlOptions, CrawlPolicy, CrawlStats, Crawler, Crawled};
use lode_fs::{DataProvider, EnumerateFlags, FileInfo};
use lode_indexing_tree::{IndexingTree, Root, RootFlags};
use lode_monitor::{Monitor, MonitorEvent};
use lode_store::{sparql, Cursor, DynConnection};

use std::{
	collections::{HashMap, VecDeque},
	path::{Path, PathBuf},
	sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Store rows pulled per scheduling step.
const STORE_ROWS_PER_STEP: usize = 128;

/// Crawl policy backed by the indexing tree.
#[derive(Clone)]
pub(crate) struct TreePolicy {
	tree: Arc<RwLock<IndexingTree>>,
}

impl CrawlPolicy for TreePolicy {
	fn check_file(&self, path: &Path, info: &FileInfo) -> bool {
		self.tree
			.read()
			.expect("indexing tree poisoned")
			.is_indexable(path, info)
	}

	fn check_directory(&self, path: &Path, info: &FileInfo) -> bool {
		self.tree
			.read()
			.expect("indexing tree poisoned")
			.is_indexable(path, info)
	}

	fn check_directory_contents(&self, path: &Path, children: &[FileInfo]) -> bool {
		self.tree
			.read()
			.expect("indexing tree poisoned")
			.parent_is_indexable(path, children)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
	None,
	Create,
	Update,
	Delete,
}

#[derive(Debug, Default)]
struct FileData {
	in_disk: bool,
	in_store: bool,
	is_dir_disk: bool,
	is_dir_store: bool,
	disk_mtime: Option<DateTime<Utc>>,
	store_mtime: Option<DateTime<Utc>>,
	extractor_hash: Option<String>,
	mimetype: Option<String>,
	info: Option<FileInfo>,
}

impl FileData {
	fn state(&self, hash_for: &(dyn Fn(&str) -> Option<String> + Send + Sync)) -> FileState {
		match (self.in_disk, self.in_store) {
			(true, false) => FileState::Create,
			(false, true) => FileState::Delete,
			(false, false) => FileState::None,
			(true, true) => {
				let mtime_changed = self.disk_mtime != self.store_mtime;

				let hash_changed = self
					.mimetype
					.as_deref()
					.and_then(hash_for)
					.is_some_and(|current| self.extractor_hash.as_deref() != Some(&*current));

				if mtime_changed || hash_changed {
					FileState::Update
				} else {
					FileState::None
				}
			}
		}
	}
}

/// A scheduled reconciliation pass; either a whole root or a directory that
/// appeared under a recursive root at runtime.
#[derive(Debug)]
struct PendingPass {
	dir: PathBuf,
	root: PathBuf,
	flags: RootFlags,
	ignore_root: bool,
}

struct ActivePass {
	pending: PendingPass,
	pending_dirs: VecDeque<PathBuf>,
	map: HashMap<PathBuf, FileData>,
	stats: CrawlStats,
	cursor: Option<Box<dyn Cursor>>,
	store_done: bool,
	first_crawl: bool,
	cancel: CancellationToken,
	non_critical: Vec<NonCriticalMinerError>,
}

/// A pass that ran to completion (or aborted on a store failure).
#[derive(Debug)]
pub(crate) struct CompletedPass {
	pub root: PathBuf,
	pub stats: CrawlStats,
	pub error: Option<String>,
	/// Per-item failures that did not stop the pass.
	pub non_critical: Vec<NonCriticalMinerError>,
	/// Directory passes scheduled from monitor events do not count as roots
	/// for finished-root signaling.
	pub is_root_pass: bool,
}

pub(crate) struct Reconciler<P: DataProvider> {
	tree: Arc<RwLock<IndexingTree>>,
	conn: DynConnection,
	provider: Arc<P>,
	crawler: Crawler<P, TreePolicy>,
	monitor: Monitor,
	hash_for: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
	pending: VecDeque<PendingPass>,
	current: Option<ActivePass>,
	completed: Vec<CompletedPass>,
	/// Memoizes folder URNs seen in store rows so monitor deletes rarely need
	/// a store round trip to learn whether an entity was a directory.
	folder_cache: LruCache<PathBuf, String>,
	monitor_suspended: bool,
}

/// Bound on memoized folder URNs.
const FOLDER_CACHE_SIZE: usize = 1000;

impl<P: DataProvider> Reconciler<P> {
	pub(crate) fn new(
		tree: Arc<RwLock<IndexingTree>>,
		conn: DynConnection,
		provider: Arc<P>,
		monitor: Monitor,
		hash_for: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
	) -> Self {
		let crawler = Crawler::new(
			Arc::clone(&provider),
			Arc::new(TreePolicy {
				tree: Arc::clone(&tree),
			}),
		);

		Self {
			tree,
			conn,
			provider,
			crawler,
			monitor,
			hash_for,
			pending: VecDeque::new(),
			current: None,
			completed: Vec::new(),
			folder_cache: LruCache::new(FOLDER_CACHE_SIZE),
			monitor_suspended: false,
		}
	}

	/// Schedules a full pass over a root.
	pub(crate) fn schedule_root(&mut self, root: &Root) {
		if root.flags.ignore {
			return;
		}

		debug!(root = %root.path.display(), "scheduling root pass");
		self.pending.push_back(PendingPass {
			dir: root.path.clone(),
			root: root.path.clone(),
			flags: root.flags,
			ignore_root: false,
		});
	}

	/// Schedules reconciliation of a directory that appeared at runtime.
	fn schedule_directory(&mut self, dir: PathBuf, root: PathBuf, flags: RootFlags) {
		self.pending.push_back(PendingPass {
			dir,
			root,
			flags,
			ignore_root: true,
		});
	}

	/// Drops all state belonging to `root`, cancelling an in-flight pass.
	///
	/// Unless the root was flagged `preserve`, a directory delete event is
	/// emitted so the store forgets the subtree.
	pub(crate) fn remove_root(
		&mut self,
		root: &Path,
		flags: RootFlags,
		queue: &mut EventQueue,
	) {
		self.pending
			.retain(|pass| !lode_fs::is_self_or_descendant(&pass.dir, root));

		let cancel_current = self
			.current
			.as_ref()
			.map_or(false, |current| {
				lode_fs::is_self_or_descendant(&current.pending.dir, root)
			});
		if cancel_current {
			if let Some(current) = self.current.take() {
				current.cancel.cancel();
			}
		}

		self.monitor.unwatch_recursively(root);
		queue.purge_below(root);

		if !flags.preserve {
			queue.push(
				QueueEvent::new(EventKind::Deleted, root.to_path_buf())
					.dir(true)
					.for_root(root.to_path_buf()),
				priority_of(flags),
			);
		}
	}

	#[must_use]
	pub(crate) fn has_work(&self) -> bool {
		self.current.is_some() || !self.pending.is_empty()
	}

	pub(crate) fn take_completed(&mut self) -> Vec<CompletedPass> {
		std::mem::take(&mut self.completed)
	}

	/// Runs one bounded reconciliation step; returns whether work was done.
	pub(crate) async fn step(&mut self, queue: &mut EventQueue) -> Result<bool, Error> {
		if self.current.is_none() {
			let Some(pending) = self.pending.pop_front() else {
				if self.monitor_suspended {
					// Initial crawling is over; resume live monitoring.
					self.monitor.set_enabled(true);
					self.monitor_suspended = false;
				}
				return Ok(false);
			};

			let root = pending.root.clone();
			let is_root_pass = !pending.ignore_root;
			if let Err(e) = self.begin_pass(pending).await {
				// A failed query start aborts this root only.
				warn!(root = %root.display(), ?e, "failed to start reconciliation pass");
				self.completed.push(CompletedPass {
					root,
					stats: CrawlStats::default(),
					error: Some(e.to_string()),
					non_critical: Vec::new(),
					is_root_pass,
				});
			}
			return Ok(true);
		}

		let Some(mut pass) = self.current.take() else {
			return Ok(false);
		};

		if !pass.store_done {
			match self.step_store(&mut pass).await {
				Ok(()) => self.current = Some(pass),
				Err(e) => {
					// A store failure aborts this root only.
					warn!(root = %pass.pending.root.display(), ?e, "store pass failed, aborting root");
					self.completed.push(CompletedPass {
						root: pass.pending.root,
						stats: pass.stats,
						error: Some(e.to_string()),
						non_critical: pass.non_critical,
						is_root_pass: !pass.pending.ignore_root,
					});
				}
			}
			return Ok(true);
		}

		if let Some(dir) = pass.pending_dirs.pop_front() {
			self.step_crawl(&mut pass, dir, queue).await;
			self.current = Some(pass);
			return Ok(true);
		}

		self.finish_pass(pass, queue);
		Ok(true)
	}

	#[instrument(skip(self), fields(dir = %pending.dir.display()))]
	async fn begin_pass(&mut self, pending: PendingPass) -> Result<(), Error> {
		if self.monitor.over_limit() && !self.monitor_suspended {
			debug!("monitor over limit, suspending live events during crawl");
			self.monitor.set_enabled(false);
			self.monitor_suspended = true;
		}

		let cancel = CancellationToken::new();

		let mut stmt = self.conn.prepare(&sparql::reconciliation_query()).await?;
		stmt.bind_string("root", &file_url(&pending.dir));
		let cursor = stmt.execute(&cancel).await?;

		let mut pass = ActivePass {
			pending_dirs: VecDeque::from([pending.dir.clone()]),
			map: HashMap::new(),
			stats: CrawlStats::default(),
			cursor: Some(cursor),
			store_done: false,
			first_crawl: true,
			cancel,
			non_critical: Vec::new(),
			pending,
		};

		// The pass directory itself takes part in the diff.
		match FileInfo::from_path(&pass.pending.dir).await {
			Ok(info) => {
				let data = pass.map.entry(pass.pending.dir.clone()).or_default();
				data.in_disk = true;
				data.is_dir_disk = info.is_dir();
				data.disk_mtime = info.modified_at;
				data.info = Some(info);
			}
			Err(e) => {
				trace!(?e, "pass directory not statable; store side will win");
			}
		}

		self.current = Some(pass);
		Ok(())
	}

	/// Pulls a bounded chunk of store rows into the reconciliation map.
	async fn step_store(&mut self, pass: &mut ActivePass) -> Result<(), Error> {
		let Some(cursor) = pass.cursor.as_mut() else {
			pass.store_done = true;
			return Ok(());
		};

		for _ in 0..STORE_ROWS_PER_STEP {
			let Some(row) = cursor.next().await? else {
				pass.cursor = None;
				pass.store_done = true;
				return Ok(());
			};

			let Some(path) = row.get_string(0).and_then(crate::url_to_path) else {
				pass.non_critical.push(NonCriticalMinerError::StoreRow(
					"row without a local file URL".to_string(),
				));
				continue;
			};

			if let Some(folder_urn) = row.get_string(1) {
				self.folder_cache.add(path.clone(), folder_urn.to_string());
			}

			let data = pass.map.entry(path).or_default();
			data.in_store = true;
			data.is_dir_store = row.get_string(1).is_some();
			data.store_mtime = row.get_string(2).and_then(|s| s.parse().ok());
			data.extractor_hash = row.get_string(3).map(str::to_string);
			data.mimetype = row.get_string(4).map(str::to_string);
		}

		Ok(())
	}

	/// Crawls one pending directory into the map; errors are contained to the
	/// directory.
	async fn step_crawl(&mut self, pass: &mut ActivePass, dir: PathBuf, queue: &mut EventQueue) {
		let first = std::mem::take(&mut pass.first_crawl);

		let crawled = match self
			.crawler
			.get(
				&dir,
				CrawlOptions {
					no_stat: pass.pending.flags.no_stat,
				},
				&pass.cancel,
			)
			.await
		{
			Ok(crawled) => crawled,
			Err(e) => {
				// Permission or disappearance problems skip the directory and
				// its descent; the root carries on.
				debug!(dir = %dir.display(), ?e, "failed to crawl directory");
				pass.non_critical
					.push(NonCriticalMinerError::Crawl(format!(
						"{}: {e}",
						dir.display()
					)));
				return;
			}
		};

		let Crawled {
			children,
			stats,
			content_filtered,
			..
		} = crawled;

		if content_filtered {
			pass.stats.dirs_ignored += 1;
			if !first {
				// Was counted as found when its parent admitted it.
				pass.stats.dirs_found = pass.stats.dirs_found.saturating_sub(1);
			}

			// The directory and its subtree no longer count as on-disk; store
			// rows below it reconcile to deletes. The store pass ran to
			// completion before crawling started, so the map is complete here.
			for (path, data) in &mut pass.map {
				if lode_fs::is_self_or_descendant(path, &dir) {
					data.in_disk = false;
					data.info = None;
				}
			}

			self.monitor.unwatch_recursively(&dir);
			queue.purge_below(&dir);
			return;
		}

		let mut merged = stats;
		if !first {
			// The crawled directory itself was already counted by its parent.
			merged.dirs_found = merged.dirs_found.saturating_sub(1);
		}
		pass.stats.merge(&merged);

		if pass.pending.flags.monitor {
			if let Err(e) = self.monitor.watch(&dir) {
				debug!(dir = %dir.display(), ?e, "failed to install watch");
			}
		}

		for child in children {
			if child.info.is_dir() && pass.pending.flags.recurse {
				pass.pending_dirs.push_back(child.path.clone());
			}

			let data = pass.map.entry(child.path).or_default();
			data.in_disk = true;
			data.is_dir_disk = child.info.is_dir();
			data.disk_mtime = child.info.modified_at;
			data.info = Some(child.info);
		}
	}

	/// Both passes are done: compute per-file states and emit the diff.
	fn finish_pass(&mut self, mut pass: ActivePass, queue: &mut EventQueue) {
		let priority = priority_of(pass.pending.flags);
		let root = pass.pending.root.clone();
		let hash_for = Arc::clone(&self.hash_for);

		let mut creates = 0_u32;
		let mut updates = 0_u32;
		let mut deletes = 0_u32;

		for (path, data) in pass.map.drain() {
			if pass.pending.ignore_root && path == pass.pending.dir {
				// The creation event for this directory was already queued by
				// the monitor translation.
				continue;
			}

			let event = match data.state(&*hash_for) {
				FileState::None => continue,
				FileState::Create => {
					creates += 1;
					let mut event = QueueEvent::new(EventKind::Created, path);
					if let Some(info) = data.info {
						event = event.with_info(info);
					}
					event
				}
				FileState::Update => {
					updates += 1;
					let mut event = QueueEvent::new(EventKind::Updated, path);
					if let Some(info) = data.info {
						event = event.with_info(info);
					}
					event
				}
				FileState::Delete => {
					deletes += 1;
					QueueEvent::new(EventKind::Deleted, path).dir(data.is_dir_store)
				}
			};

			queue.push(event.for_root(root.clone()), priority);
		}

		debug!(
			root = %root.display(),
			creates, updates, deletes,
			?pass.stats,
			"reconciliation pass finished"
		);

		self.completed.push(CompletedPass {
			root,
			stats: pass.stats,
			error: None,
			non_critical: pass.non_critical,
			is_root_pass: !pass.pending.ignore_root,
		});
	}

	/// Translates one live monitor event into queue events and, where needed,
	/// new reconciliation passes.
	pub(crate) async fn handle_monitor_event(
		&mut self,
		event: MonitorEvent,
		queue: &mut EventQueue,
	) -> Result<(), Error> {
		match event {
			MonitorEvent::Created { path, is_dir } => {
				self.handle_created(path, is_dir, queue).await?;
			}

			MonitorEvent::Updated { path, is_dir } => {
				if let Some((root, flags)) = self.root_of(&path) {
					queue.push(
						QueueEvent::new(EventKind::Updated, path)
							.dir(is_dir)
							.for_root(root),
						priority_of(flags),
					);
				}
			}

			MonitorEvent::AttributeUpdated { path, is_dir } => {
				if let Some((root, flags)) = self.root_of(&path) {
					queue.push(
						QueueEvent::new(EventKind::Updated, path)
							.dir(is_dir)
							.for_root(root)
							.attributes(),
						priority_of(flags),
					);
				}
			}

			MonitorEvent::Deleted { path, .. } => {
				self.handle_deleted(path, queue).await?;
			}

			MonitorEvent::Moved { from, to, is_dir, .. } => {
				self.handle_moved(from, to, is_dir, queue).await?;
			}
		}

		Ok(())
	}

	async fn handle_created(
		&mut self,
		path: PathBuf,
		is_dir: bool,
		queue: &mut EventQueue,
	) -> Result<(), Error> {
		let Some((root, flags)) = self.root_of(&path) else {
			return Ok(());
		};
		let priority = priority_of(flags);

		if is_dir {
			queue.push(
				QueueEvent::new(EventKind::Created, path.clone())
					.dir(true)
					.for_root(root.clone()),
				priority,
			);

			if flags.recurse {
				// Reconcile the new subtree; the creation event above is
				// observed before any monitor events on its children.
				self.schedule_directory(path, root, flags);
			}

			return Ok(());
		}

		// A new child can flip its parent's content filter.
		if let Some(parent) = path.parent().map(Path::to_path_buf) {
			if !self.parent_content_passes(&parent).await? {
				queue.push(
					QueueEvent::new(EventKind::Deleted, parent.clone())
						.dir(true)
						.for_root(root),
					priority,
				);
				self.monitor.unwatch_recursively(&parent);
				return Ok(());
			}
		}

		let indexable = {
			let info = FileInfo::from_path(&path).await;
			match info {
				Ok(info) => self
					.tree
					.read()
					.expect("indexing tree poisoned")
					.is_indexable(&path, &info),
				Err(_) => false,
			}
		};

		if indexable {
			queue.push(
				QueueEvent::new(EventKind::Created, path).for_root(root),
				priority,
			);
		}

		Ok(())
	}

	async fn handle_deleted(
		&mut self,
		path: PathBuf,
		queue: &mut EventQueue,
	) -> Result<(), Error> {
		let Some((root, flags)) = self.root_of(&path) else {
			return Ok(());
		};

		let is_dir = self.stored_is_dir(&path).await.unwrap_or(false);
		self.folder_cache.remove(&path);

		self.monitor.unwatch_recursively(&path);
		queue.push(
			QueueEvent::new(EventKind::Deleted, path.clone())
				.dir(is_dir)
				.for_root(root.clone()),
			priority_of(flags),
		);

		// Removing a content marker can re-admit its parent.
		let is_marker = self
			.tree
			.read()
			.expect("indexing tree poisoned")
			.matches_filter(lode_indexing_tree::FilterKind::ParentDir, &path);
		if is_marker {
			if let Some(parent) = path.parent() {
				debug!(parent = %parent.display(), "content marker removed, re-crawling parent");
				self.schedule_directory(parent.to_path_buf(), root, flags);
			}
		}

		Ok(())
	}

	async fn handle_moved(
		&mut self,
		from: PathBuf,
		to: PathBuf,
		is_dir: bool,
		queue: &mut EventQueue,
	) -> Result<(), Error> {
		let source = self.root_of(&from);
		let info = FileInfo::from_path(&to).await.ok();
		let dest = info.as_ref().and_then(|info| {
			let tree = self.tree.read().expect("indexing tree poisoned");
			tree.is_indexable(&to, info)
				.then(|| tree.get_root(&to).map(|root| (root.path.clone(), root.flags)))
				.flatten()
		});

		match (source, dest) {
			(None, Some((root, flags))) => {
				// Entered indexed territory: a creation from our point of view.
				queue.push(
					QueueEvent::new(EventKind::Created, to.clone())
						.dir(is_dir)
						.for_root(root.clone()),
					priority_of(flags),
				);
				if is_dir && flags.recurse {
					self.schedule_directory(to, root, flags);
				}
			}

			(Some((root, flags)), None) => {
				// Left indexed territory: a deletion.
				self.monitor.unwatch_recursively(&from);
				queue.push(
					QueueEvent::new(EventKind::Deleted, from)
						.dir(is_dir)
						.for_root(root),
					priority_of(flags),
				);
			}

			(Some((src_root, src_flags)), Some((dst_root, _))) => {
				// Move watches along with the files.
				if is_dir {
					for watched in self.monitor.watched_under(&from) {
						self.monitor.unwatch(&watched);
						if let Ok(rel) = watched.strip_prefix(&from) {
							let _ = self.monitor.watch(to.join(rel));
						}
					}
				}

				let extension_changed = from.extension() != to.extension();

				queue.push(
					QueueEvent::new(EventKind::Moved, from)
						.with_dest(to.clone())
						.dir(is_dir)
						.for_root(src_root),
					priority_of(src_flags),
				);

				if extension_changed {
					// A different extension means a different extractor.
					queue.push(
						QueueEvent::new(EventKind::Updated, to)
							.dir(is_dir)
							.for_root(dst_root),
						priority_of(src_flags),
					);
				}
			}

			(None, None) => {}
		}

		Ok(())
	}

	fn root_of(&self, path: &Path) -> Option<(PathBuf, RootFlags)> {
		let tree = self.tree.read().expect("indexing tree poisoned");
		tree.get_root(path)
			.map(|root| (root.path.clone(), root.flags))
	}

	/// Enumerates a directory's children (names only) and applies the content
	/// filter.
	async fn parent_content_passes(&self, parent: &Path) -> Result<bool, Error> {
		let cancel = CancellationToken::new();
		let mut enumerator = self
			.provider
			.begin(
				parent,
				EnumerateFlags { no_stat: true },
				lode_fs::Priority::Default,
				&cancel,
			)
			.await?;

		let mut children = Vec::new();
		loop {
			let batch = enumerator.next_batch(STORE_ROWS_PER_STEP).await?;
			let done = batch.len() < STORE_ROWS_PER_STEP;
			children.extend(batch);
			if done {
				break;
			}
		}

		Ok(self
			.tree
			.read()
			.expect("indexing tree poisoned")
			.parent_is_indexable(parent, &children))
	}

	/// Whether the store records `path` as a folder; the folder cache answers
	/// for recently seen directories without a query.
	async fn stored_is_dir(&mut self, path: &Path) -> Result<bool, Error> {
		if self.folder_cache.find(path).is_some() {
			return Ok(true);
		}

		let cancel = CancellationToken::new();
		let mut stmt = self.conn.prepare(&sparql::reconciliation_query()).await?;
		stmt.bind_string("root", &file_url(path));
		let mut cursor = stmt.execute(&cancel).await?;

		let url = file_url(path);
		while let Some(row) = cursor.next().await? {
			if row.get_string(0) == Some(url.as_str()) {
				return Ok(row.get_string(1).is_some());
			}
		}

		Ok(false)
	}
}

fn priority_of(flags: RootFlags) -> Priority {
	if flags.priority {
		Priority::High
	} else {
		Priority::Normal
	}
}
