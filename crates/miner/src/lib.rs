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
	clippy::cast_precision_loss,
	clippy::dbg_macro,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Filesystem mining core.
//!
//! Reconciles on-disk state with the content store per configured root, fuses
//! live monitor events into an ordered, coalesced event stream, and dispatches
//! each event to the host's [`MinerDelegate`], whose updates are batched
//! through the [`UpdateBuffer`]. The [`decorator`] module runs the resumable
//! metadata-backfill pipeline on top of the same store.

pub mod decorator;
pub mod event_queue;
mod miner;
mod reconciler;
mod update_buffer;

pub use decorator::{Decorator, DecoratorConfig, DecoratorHandle, DecoratorItem, DecoratorSignal};
pub use event_queue::{EventKind, EventQueue, QueueEvent};
pub use miner::{Miner, MinerHandle, MinerSignal, MinerStatus};
pub use update_buffer::{TaskState, UpdateBuffer, UpdateError};

use lode_fs::FileInfo;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("store error: {0}")]
	Store(#[from] lode_store::StoreError),
	#[error(transparent)]
	Crawler(#[from] lode_crawler::Error),
	#[error(transparent)]
	Provider(#[from] lode_fs::ProviderError),
	#[error(transparent)]
	FileIo(#[from] lode_fs::FileIoError),
	#[error(transparent)]
	Monitor(#[from] lode_monitor::Error),
	#[error(transparent)]
	Tree(#[from] lode_indexing_tree::Error),
	#[error("operation was cancelled")]
	Cancelled,
}

/// Per-item failures that are reported and logged without stopping the
/// pipeline.
#[derive(thiserror::Error, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonCriticalMinerError {
	#[error("failed to crawl directory: {0}")]
	Crawl(String),
	#[error("failed to read a reconciliation row: {0}")]
	StoreRow(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
	/// Idle pacing between dispatch slices, scaled into `[0, max_interval]`.
	pub throttle: f64,
	/// Events dispatched per scheduling slice.
	pub max_simultaneous_items: usize,
	/// Queued updates beyond which dispatch stalls until the next flush.
	pub ready_limit: usize,
	/// Minimum milliseconds between progress emissions.
	pub progress_interval_ms: u64,
	/// Watched-directory count beyond which monitoring is suspended during
	/// the initial crawl.
	pub monitor_limit: usize,
	/// Graph receiving file resources pushed by the delegate.
	pub graph: String,
}

impl Default for MinerConfig {
	fn default() -> Self {
		Self {
			throttle: 0.0,
			max_simultaneous_items: 64,
			ready_limit: 100,
			progress_interval_ms: 1000,
			monitor_limit: 1 << 14,
			graph: "lode:files".to_string(),
		}
	}
}

/// Host callbacks invoked per dispatched event.
///
/// Implementations append at most one logical update per invocation to the
/// buffer and must not block.
pub trait MinerDelegate: Send + Sync + 'static {
	fn process_file(&self, file: &Path, info: &FileInfo, buffer: &UpdateBuffer, created: bool);

	fn process_file_attributes(&self, file: &Path, info: &FileInfo, buffer: &UpdateBuffer);

	fn remove_file(&self, file: &Path, buffer: &UpdateBuffer, is_dir: bool);

	fn remove_children(&self, file: &Path, buffer: &UpdateBuffer);

	fn move_file(&self, dest: &Path, source: &Path, buffer: &UpdateBuffer, recursive: bool);

	/// Version tag of the extractor responsible for `mimetype`; a mismatch
	/// against the stored tag forces re-extraction during reconciliation.
	fn extractor_hash_for(&self, mimetype: &str) -> Option<String> {
		let _ = mimetype;
		None
	}
}

/// Store URL for a filesystem path.
#[must_use]
pub fn file_url(path: impl AsRef<Path>) -> String {
	format!("file://{}", path.as_ref().display())
}

/// Inverse of [`file_url`]; `None` for non-file URLs.
#[must_use]
pub fn url_to_path(url: &str) -> Option<PathBuf> {
	url.strip_prefix("file://").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
	use super::{file_url, url_to_path};

	use std::path::Path;

	#[test]
	fn url_roundtrip() {
		let path = Path::new("/data/music/track.mp3");
		assert_eq!(file_url(path), "file:///data/music/track.mp3");
		assert_eq!(url_to_path(&file_url(path)).as_deref(), Some(path));
		assert_eq!(url_to_path("urn:resource:1"), None);
	}
}
