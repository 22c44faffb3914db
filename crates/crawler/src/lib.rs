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

//! Single-directory walker.
//!
//! Each `get` call enumerates exactly one directory through the data provider
//! and runs the caller's policy checks; descent is the caller's business, by
//! enqueuing the child directories found in the result. Work is sliced into
//! bounded batches so a huge directory never hogs the scheduler.

use lode_fs::{DataProvider, EnumerateFlags, FileInfo, Priority, ProviderError};

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

/// Items processed per scheduling slice.
const BATCH_SIZE: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Provider(#[from] ProviderError),
	#[error("crawl was cancelled")]
	Cancelled,
}

/// Per-item policy, set once per crawler.
pub trait CrawlPolicy: Send + Sync + 'static {
	fn check_file(&self, path: &Path, info: &FileInfo) -> bool;

	fn check_directory(&self, path: &Path, info: &FileInfo) -> bool;

	/// Receives the assembled child list before any child is admitted; a
	/// `false` return prunes the whole directory.
	fn check_directory_contents(&self, path: &Path, children: &[FileInfo]) -> bool;
}

/// Accepts everything; useful as a base case and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl CrawlPolicy for AcceptAll {
	fn check_file(&self, _: &Path, _: &FileInfo) -> bool {
		true
	}

	fn check_directory(&self, _: &Path, _: &FileInfo) -> bool {
		true
	}

	fn check_directory_contents(&self, _: &Path, _: &[FileInfo]) -> bool {
		true
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
	pub dirs_found: u32,
	pub dirs_ignored: u32,
	pub files_found: u32,
	pub files_ignored: u32,
}

impl CrawlStats {
	pub fn merge(&mut self, other: &Self) {
		self.dirs_found += other.dirs_found;
		self.dirs_ignored += other.dirs_ignored;
		self.files_found += other.files_found;
		self.files_ignored += other.files_ignored;
	}
}

/// One admitted child of the crawled directory.
#[derive(Debug, Clone)]
pub struct TreeNode {
	pub path: PathBuf,
	pub info: FileInfo,
}

/// Result of crawling one directory.
#[derive(Debug)]
pub struct Crawled {
	pub dir: PathBuf,
	pub children: Vec<TreeNode>,
	pub stats: CrawlStats,
	/// The directory itself was rejected by the content check; `children` is
	/// empty and the caller must abandon the subtree.
	pub content_filtered: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlOptions {
	pub no_stat: bool,
}

pub struct Crawler<P, C> {
	provider: Arc<P>,
	policy: Arc<C>,
}

impl<P: DataProvider, C: CrawlPolicy> Crawler<P, C> {
	pub fn new(provider: Arc<P>, policy: Arc<C>) -> Self {
		Self { provider, policy }
	}

	/// Crawls a single directory, non-recursively.
	///
	/// On cancellation the call fails with [`Error::Cancelled`] and no partial
	/// result is returned.
	#[instrument(skip(self, cancel), fields(dir = %dir.as_ref().display()), err)]
	pub async fn get(
		&self,
		dir: impl AsRef<Path>,
		options: CrawlOptions,
		cancel: &CancellationToken,
	) -> Result<Crawled, Error> {
		let dir = dir.as_ref();

		let mut enumerator = self
			.provider
			.begin(
				dir,
				EnumerateFlags {
					no_stat: options.no_stat,
				},
				Priority::Background,
				cancel,
			)
			.await?;

		let mut assembled = Vec::new();

		loop {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			let batch = enumerator.next_batch(BATCH_SIZE).await?;
			let done = batch.len() < BATCH_SIZE;
			assembled.extend(batch);

			if done {
				break;
			}

			// Yield between slices so other work gets scheduled.
			tokio::task::yield_now().await;
		}

		enumerator.close().await?;

		if !self
			.policy
			.check_directory_contents(dir, &assembled)
		{
			trace!(dir = %dir.display(), "directory rejected by content check");
			return Ok(Crawled {
				dir: dir.to_path_buf(),
				children: Vec::new(),
				stats: CrawlStats {
					dirs_ignored: 1,
					..CrawlStats::default()
				},
				content_filtered: true,
			});
		}

		let mut stats = CrawlStats {
			dirs_found: 1,
			..CrawlStats::default()
		};
		let mut children = Vec::with_capacity(assembled.len());

		for info in assembled {
			let Some(name) = info.name.as_deref() else {
				continue;
			};
			let path = dir.join(name);

			if info.is_dir() {
				if self.policy.check_directory(&path, &info) {
					stats.dirs_found += 1;
					children.push(TreeNode { path, info });
				} else {
					stats.dirs_ignored += 1;
				}
			} else if self.policy.check_file(&path, &info) {
				stats.files_found += 1;
				children.push(TreeNode { path, info });
			} else {
				stats.files_ignored += 1;
			}
		}

		Ok(Crawled {
			dir: dir.to_path_buf(),
			children,
			stats,
			content_filtered: false,
		})
	}
}
