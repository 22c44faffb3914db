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

//! Live filesystem change source.
//!
//! Wraps a non-recursive `notify` watcher per directory, pairs rename halves
//! into move events, debounces per-file update bursts and exposes a global
//! enabled flag. Deleted paths are reported with `is_dir = false`; consumers
//! that care resolve the real kind from their own records.

use std::{
	collections::{HashMap, HashSet},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, RwLock,
	},
	time::{Duration, Instant},
};

use notify::{
	event::{ModifyKind, RenameMode},
	EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tracing::{trace, warn};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
const RENAME_PAIR_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to install watch: {0}")]
	Backend(#[from] notify::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
	Created {
		path: PathBuf,
		is_dir: bool,
	},
	Updated {
		path: PathBuf,
		is_dir: bool,
	},
	AttributeUpdated {
		path: PathBuf,
		is_dir: bool,
	},
	Deleted {
		path: PathBuf,
		is_dir: bool,
	},
	Moved {
		from: PathBuf,
		to: PathBuf,
		is_dir: bool,
		source_was_monitored: bool,
	},
}

struct Inner {
	watcher: Mutex<RecommendedWatcher>,
	watched: RwLock<HashSet<PathBuf>>,
	enabled: AtomicBool,
	limit: usize,
}

/// Handle to the monitor; cheap to clone.
#[derive(Clone)]
pub struct Monitor {
	inner: Arc<Inner>,
}

impl Monitor {
	/// Creates the monitor and spawns its translation task; must be called
	/// from within a tokio runtime. `limit` is advisory (see
	/// [`Monitor::over_limit`]).
	pub fn new(limit: usize) -> Result<(Self, async_channel::Receiver<MonitorEvent>), Error> {
		let (raw_tx, raw_rx) = async_channel::unbounded::<notify::Event>();

		let watcher = notify::recommended_watcher(move |res| match res {
			Ok(event) => {
				let _ = raw_tx.send_blocking(event);
			}
			Err(e) => warn!(?e, "watch backend error"),
		})?;

		let inner = Arc::new(Inner {
			watcher: Mutex::new(watcher),
			watched: RwLock::new(HashSet::new()),
			enabled: AtomicBool::new(true),
			limit,
		});

		let (tx, rx) = async_channel::unbounded();
		tokio::spawn(translate_events(Arc::clone(&inner), raw_rx, tx));

		Ok((Self { inner }, rx))
	}

	pub fn watch(&self, dir: impl AsRef<Path>) -> Result<(), Error> {
		let dir = dir.as_ref();

		{
			let watched = self.inner.watched.read().expect("watched set poisoned");
			if watched.contains(dir) {
				return Ok(());
			}
		}

		self.inner
			.watcher
			.lock()
			.expect("watcher poisoned")
			.watch(dir, RecursiveMode::NonRecursive)?;

		self.inner
			.watched
			.write()
			.expect("watched set poisoned")
			.insert(dir.to_path_buf());

		trace!(dir = %dir.display(), "watch installed");
		Ok(())
	}

	pub fn unwatch(&self, dir: impl AsRef<Path>) {
		let dir = dir.as_ref();

		let removed = self
			.inner
			.watched
			.write()
			.expect("watched set poisoned")
			.remove(dir);

		if removed {
			if let Err(e) = self
				.inner
				.watcher
				.lock()
				.expect("watcher poisoned")
				.unwatch(dir)
			{
				trace!(dir = %dir.display(), ?e, "unwatch failed");
			}
		}
	}

	/// Drops every watch on `prefix` itself and anything below it.
	pub fn unwatch_recursively(&self, prefix: impl AsRef<Path>) {
		let prefix = prefix.as_ref();

		let to_drop = {
			let watched = self.inner.watched.read().expect("watched set poisoned");
			watched
				.iter()
				.filter(|dir| dir.as_path() == prefix || dir.starts_with(prefix))
				.cloned()
				.collect::<Vec<_>>()
		};

		for dir in to_drop {
			self.unwatch(&dir);
		}
	}

	/// Watched directories equal to or below `prefix`.
	#[must_use]
	pub fn watched_under(&self, prefix: impl AsRef<Path>) -> Vec<PathBuf> {
		let prefix = prefix.as_ref();
		self.inner
			.watched
			.read()
			.expect("watched set poisoned")
			.iter()
			.filter(|dir| dir.as_path() == prefix || dir.starts_with(prefix))
			.cloned()
			.collect()
	}

	#[must_use]
	pub fn is_watched(&self, dir: impl AsRef<Path>) -> bool {
		self.inner
			.watched
			.read()
			.expect("watched set poisoned")
			.contains(dir.as_ref())
	}

	#[must_use]
	pub fn folder_count(&self) -> usize {
		self.inner.watched.read().expect("watched set poisoned").len()
	}

	#[must_use]
	pub fn monitor_limit(&self) -> usize {
		self.inner.limit
	}

	/// Whether the watched set outgrew the configured limit; hosts typically
	/// disable the monitor during initial crawling when this turns true.
	#[must_use]
	pub fn over_limit(&self) -> bool {
		self.folder_count() > self.inner.limit
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.inner.enabled.store(enabled, Ordering::Relaxed);
	}

	#[must_use]
	pub fn enabled(&self) -> bool {
		self.inner.enabled.load(Ordering::Relaxed)
	}
}

struct PendingRename {
	from: PathBuf,
	at: Instant,
}

async fn translate_events(
	inner: Arc<Inner>,
	raw_rx: async_channel::Receiver<notify::Event>,
	tx: async_channel::Sender<MonitorEvent>,
) {
	let mut recent: HashMap<PathBuf, Instant> = HashMap::new();
	let mut pending_rename: Option<PendingRename> = None;
	let mut tick = tokio::time::interval(RENAME_PAIR_TIMEOUT);

	loop {
		tokio::select! {
			raw = raw_rx.recv() => {
				let Ok(event) = raw else { break };

				// Flush an unpaired rename-from as a delete before anything else.
				if let Some(pending) = pending_rename.take() {
					let keep = matches!(
						event.kind,
						EventKind::Modify(ModifyKind::Name(RenameMode::To))
					);
					if keep {
						pending_rename = Some(pending);
					} else if tx
						.send(MonitorEvent::Deleted { path: pending.from, is_dir: false })
						.await
						.is_err()
					{
						break;
					}
				}

				if !inner.enabled.load(Ordering::Relaxed) {
					continue;
				}

				for out in translate(&inner, event, &mut recent, &mut pending_rename).await {
					if tx.send(out).await.is_err() {
						return;
					}
				}
			}
			_ = tick.tick() => {
				recent.retain(|_, seen| seen.elapsed() < DEBOUNCE_WINDOW);

				if let Some(pending) = pending_rename.take() {
					if pending.at.elapsed() >= RENAME_PAIR_TIMEOUT {
						// The matching rename-to never arrived; the file left
						// the watched set.
						if tx
							.send(MonitorEvent::Deleted { path: pending.from, is_dir: false })
							.await
							.is_err()
						{
							break;
						}
					} else {
						pending_rename = Some(pending);
					}
				}
			}
		}
	}
}

async fn translate(
	inner: &Inner,
	event: notify::Event,
	recent: &mut HashMap<PathBuf, Instant>,
	pending_rename: &mut Option<PendingRename>,
) -> Vec<MonitorEvent> {
	match event.kind {
		EventKind::Create(_) => {
			let Some(path) = event.paths.into_iter().next() else {
				return Vec::new();
			};
			recent.remove(&path);
			vec![MonitorEvent::Created {
				is_dir: is_dir(&path).await,
				path,
			}]
		}

		EventKind::Modify(ModifyKind::Name(mode)) => {
			translate_rename(inner, mode, event.paths, pending_rename).await
		}

		EventKind::Modify(ModifyKind::Metadata(_)) => {
			let Some(path) = event.paths.into_iter().next() else {
				return Vec::new();
			};
			if debounced(recent, &path) {
				return Vec::new();
			}
			vec![MonitorEvent::AttributeUpdated {
				is_dir: is_dir(&path).await,
				path,
			}]
		}

		EventKind::Modify(_) => {
			let Some(path) = event.paths.into_iter().next() else {
				return Vec::new();
			};
			if debounced(recent, &path) {
				return Vec::new();
			}
			vec![MonitorEvent::Updated {
				is_dir: is_dir(&path).await,
				path,
			}]
		}

		EventKind::Remove(_) => {
			let Some(path) = event.paths.into_iter().next() else {
				return Vec::new();
			};
			recent.remove(&path);
			// Gone from disk; the consumer resolves the recorded kind.
			vec![MonitorEvent::Deleted {
				path,
				is_dir: false,
			}]
		}

		EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
	}
}

async fn translate_rename(
	inner: &Inner,
	mode: RenameMode,
	mut paths: Vec<PathBuf>,
	pending_rename: &mut Option<PendingRename>,
) -> Vec<MonitorEvent> {
	match mode {
		RenameMode::Both if paths.len() >= 2 => {
			let to = paths.pop().expect("checked length");
			let from = paths.pop().expect("checked length");
			vec![moved(inner, from, to).await]
		}

		RenameMode::From => {
			if paths.is_empty() {
				return Vec::new();
			}
			*pending_rename = Some(PendingRename {
				from: paths.remove(0),
				at: Instant::now(),
			});
			Vec::new()
		}

		RenameMode::To => {
			let Some(to) = paths.into_iter().next() else {
				return Vec::new();
			};

			match pending_rename.take() {
				// A rename-to right after a rename-from is the same rename;
				// the raw stream delivers the halves adjacently.
				Some(pending) => vec![moved(inner, pending.from, to).await],
				None => vec![MonitorEvent::Created {
					is_dir: is_dir(&to).await,
					path: to,
				}],
			}
		}

		_ => Vec::new(),
	}
}

async fn moved(inner: &Inner, from: PathBuf, to: PathBuf) -> MonitorEvent {
	let source_was_monitored = {
		let watched = inner.watched.read().expect("watched set poisoned");
		from.parent().is_some_and(|parent| watched.contains(parent))
			|| watched.contains(from.as_path())
	};

	MonitorEvent::Moved {
		is_dir: is_dir(&to).await,
		from,
		to,
		source_was_monitored,
	}
}

fn debounced(recent: &mut HashMap<PathBuf, Instant>, path: &Path) -> bool {
	let now = Instant::now();
	if let Some(seen) = recent.get(path) {
		if now.duration_since(*seen) < DEBOUNCE_WINDOW {
			return true;
		}
	}
	recent.insert(path.to_path_buf(), now);
	false
}

async fn is_dir(path: &Path) -> bool {
	tokio::fs::symlink_metadata(path)
		.await
		.map(|metadata| metadata.is_dir())
		.unwrap_or(false)
}
