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

//! Registry of indexing roots and the pure predicates deciding what gets
//! indexed. Mutated only by the host; read from everywhere.

use lode_fs::FileInfo;

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("root path must be absolute: <path='{}'>", .0.display())]
	RelativeRootPath(PathBuf),
	#[error("glob builder error: {0}")]
	Glob(#[from] globset::Error),
}

/// Per-root behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootFlags {
	/// Descend into subdirectories.
	pub recurse: bool,
	/// Keep live monitors on directories under this root.
	pub monitor: bool,
	/// Host-facing hint recorded with the root; the reconciliation diff
	/// always compares stored against on-disk mtimes.
	pub check_mtime: bool,
	/// Enumerate without statting children.
	pub no_stat: bool,
	/// Dispatch this root's events ahead of normal-priority roots.
	pub priority: bool,
	/// Keep the root registered but index nothing under it.
	pub ignore: bool,
	/// Keep stored data when the root is removed.
	pub preserve: bool,
	/// Host-facing hint recorded with the root; stored entries gone from
	/// disk always reconcile to deletes.
	pub check_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
	pub path: PathBuf,
	pub flags: RootFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
	/// Glob matched against file names.
	File,
	/// Glob matched against directory names.
	Directory,
	/// Child name whose presence prunes the containing directory.
	ParentDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
	DirectoryAdded(PathBuf),
	DirectoryUpdated { path: PathBuf, recursive: bool },
	DirectoryRemoved(PathBuf),
}

#[derive(Debug, Default)]
struct Filters {
	file_patterns: Vec<String>,
	file_set: Option<GlobSet>,
	directory_patterns: Vec<String>,
	directory_set: Option<GlobSet>,
	content_markers: Vec<String>,
}

/// Ordered forest of indexing roots plus tree-wide filter configuration.
///
/// The forest invariant holds at all times: no registered root is an ancestor
/// of another. Adding a root under an existing one updates flags in place;
/// adding a root above existing ones absorbs them.
#[derive(Debug)]
pub struct IndexingTree {
	roots: Vec<Root>,
	filters: Filters,
	index_hidden: bool,
	events: broadcast::Sender<TreeEvent>,
}

impl Default for IndexingTree {
	fn default() -> Self {
		Self::new()
	}
}

impl IndexingTree {
	#[must_use]
	pub fn new() -> Self {
		let (events, _) = broadcast::channel(64);
		Self {
			roots: Vec::new(),
			filters: Filters::default(),
			index_hidden: false,
			events,
		}
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
		self.events.subscribe()
	}

	pub fn set_index_hidden(&mut self, index_hidden: bool) {
		self.index_hidden = index_hidden;
	}

	#[must_use]
	pub const fn index_hidden(&self) -> bool {
		self.index_hidden
	}

	/// Adds an ignore glob for the given filter kind.
	pub fn add_filter(&mut self, kind: FilterKind, pattern: &str) -> Result<(), Error> {
		match kind {
			FilterKind::File => {
				Glob::new(pattern)?;
				self.filters.file_patterns.push(pattern.to_string());
				self.filters.file_set = Some(build_set(&self.filters.file_patterns)?);
			}
			FilterKind::Directory => {
				Glob::new(pattern)?;
				self.filters.directory_patterns.push(pattern.to_string());
				self.filters.directory_set = Some(build_set(&self.filters.directory_patterns)?);
			}
			FilterKind::ParentDir => {
				self.filters.content_markers.push(pattern.to_string());
			}
		}
		Ok(())
	}

	/// Registers a root, keeping the forest invariant.
	///
	/// A path equal to or under an existing root becomes a flag update of that
	/// root; a path above existing roots absorbs them.
	pub fn add_root(&mut self, path: impl AsRef<Path>, flags: RootFlags) -> Result<(), Error> {
		let path = path.as_ref();
		if !path.is_absolute() {
			return Err(Error::RelativeRootPath(path.to_path_buf()));
		}

		if let Some(root) = self
			.roots
			.iter_mut()
			.find(|root| lode_fs::is_self_or_descendant(path, &root.path))
		{
			if root.flags != flags {
				root.flags = flags;
				let updated = root.path.clone();
				debug!(root = %updated.display(), "root flags updated through add");
				let _ = self.events.send(TreeEvent::DirectoryUpdated {
					path: updated,
					recursive: true,
				});
			}
			return Ok(());
		}

		let absorbed = self
			.roots
			.iter()
			.filter(|root| lode_fs::is_self_or_descendant(&root.path, path))
			.map(|root| root.path.clone())
			.collect::<Vec<_>>();
		if !absorbed.is_empty() {
			trace!(root = %path.display(), ?absorbed, "new root absorbs nested roots");
			self.roots
				.retain(|root| !lode_fs::is_self_or_descendant(&root.path, path));
		}

		self.roots.push(Root {
			path: path.to_path_buf(),
			flags,
		});

		let _ = self.events.send(TreeEvent::DirectoryAdded(path.to_path_buf()));
		Ok(())
	}

	/// Removes a root; a no-op for unknown paths.
	pub fn remove_root(&mut self, path: impl AsRef<Path>) {
		let path = path.as_ref();
		let before = self.roots.len();
		self.roots.retain(|root| root.path != path);

		if self.roots.len() != before {
			let _ = self
				.events
				.send(TreeEvent::DirectoryRemoved(path.to_path_buf()));
		}
	}

	/// Replaces the flags of a registered root.
	pub fn update_root(&mut self, path: impl AsRef<Path>, flags: RootFlags) {
		let path = path.as_ref();
		if let Some(root) = self.roots.iter_mut().find(|root| root.path == path) {
			if root.flags == flags {
				return;
			}
			root.flags = flags;
			let _ = self.events.send(TreeEvent::DirectoryUpdated {
				path: path.to_path_buf(),
				recursive: true,
			});
		}
	}

	/// Observer-only update notification; the tree itself is not mutated.
	pub fn notify_update(&self, path: impl AsRef<Path>, recursive: bool) {
		let _ = self.events.send(TreeEvent::DirectoryUpdated {
			path: path.as_ref().to_path_buf(),
			recursive,
		});
	}

	/// Nearest ancestor root of `path`, if any.
	#[must_use]
	pub fn get_root(&self, path: impl AsRef<Path>) -> Option<&Root> {
		let path = path.as_ref();
		self.roots
			.iter()
			.filter(|root| lode_fs::is_self_or_descendant(path, &root.path))
			.max_by_key(|root| root.path.components().count())
	}

	#[must_use]
	pub fn is_root(&self, path: impl AsRef<Path>) -> bool {
		let path = path.as_ref();
		self.roots.iter().any(|root| root.path == path)
	}

	#[must_use]
	pub fn roots(&self) -> &[Root] {
		&self.roots
	}

	/// Whether `path` matches an ignore filter of the given kind.
	#[must_use]
	pub fn matches_filter(&self, kind: FilterKind, path: impl AsRef<Path>) -> bool {
		let path = path.as_ref();
		let Some(name) = path.file_name() else {
			return false;
		};

		match kind {
			FilterKind::File => self
				.filters
				.file_set
				.as_ref()
				.is_some_and(|set| set.is_match(name)),
			FilterKind::Directory => self
				.filters
				.directory_set
				.as_ref()
				.is_some_and(|set| set.is_match(name)),
			FilterKind::ParentDir => self
				.filters
				.content_markers
				.iter()
				.any(|marker| name.to_string_lossy() == marker.as_str()),
		}
	}

	/// Whether a file passes every filter of its enclosing root.
	#[must_use]
	pub fn is_indexable(&self, path: impl AsRef<Path>, info: &FileInfo) -> bool {
		let path = path.as_ref();

		let Some(root) = self.get_root(path) else {
			return false;
		};

		if root.flags.ignore {
			return false;
		}

		if !self.index_hidden && info.is_hidden() && path != root.path {
			return false;
		}

		let kind = if info.is_dir() {
			FilterKind::Directory
		} else {
			FilterKind::File
		};

		if path != root.path && self.matches_filter(kind, path) {
			return false;
		}

		// Non-recursive roots only index the root itself and direct children.
		if !root.flags.recurse && path != root.path {
			if path.parent() != Some(root.path.as_path()) {
				return false;
			}
			if info.is_dir() {
				return false;
			}
		}

		true
	}

	/// Content filter: whether a directory stays indexable given its assembled
	/// child list.
	#[must_use]
	pub fn parent_is_indexable(&self, parent: impl AsRef<Path>, children: &[FileInfo]) -> bool {
		let parent = parent.as_ref();
		let rejected = children.iter().any(|child| {
			child.name.as_deref().is_some_and(|name| {
				self.filters
					.content_markers
					.iter()
					.any(|marker| marker == name)
			})
		});

		if rejected {
			trace!(parent = %parent.display(), "directory pruned by content filter");
		}

		!rejected
	}
}

fn build_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		builder.add(Glob::new(pattern)?);
	}
	builder.build()
}

#[cfg(test)]
mod tests {
	use super::{FilterKind, IndexingTree, RootFlags, TreeEvent};

	use lode_fs::{FileInfo, FileKind};

	fn file_info(name: &str, kind: FileKind) -> FileInfo {
		FileInfo {
			name: Some(name.to_string()),
			kind,
			hidden: Some(name.starts_with('.')),
			..FileInfo::default()
		}
	}

	fn recursive() -> RootFlags {
		RootFlags {
			recurse: true,
			monitor: true,
			..RootFlags::default()
		}
	}

	#[test]
	fn roots_form_a_forest() {
		let mut tree = IndexingTree::new();

		tree.add_root("/data", recursive()).expect("add root");
		// Nested add becomes a flag update, not a second root.
		tree.add_root("/data/photos", RootFlags::default())
			.expect("add nested");
		assert_eq!(tree.roots().len(), 1);
		assert_eq!(tree.roots()[0].flags, RootFlags::default());

		// An ancestor absorbs previously registered descendants.
		tree.add_root("/", recursive()).expect("add ancestor");
		assert_eq!(tree.roots().len(), 1);
		assert_eq!(tree.roots()[0].path.as_os_str(), "/");
	}

	#[test]
	fn nearest_root_wins() {
		let mut tree = IndexingTree::new();
		tree.add_root("/data", recursive()).expect("add");
		tree.remove_root("/data");
		tree.add_root("/data", recursive()).expect("add");
		tree.add_root("/media", RootFlags::default()).expect("add");

		assert_eq!(
			tree.get_root("/data/x/y").map(|root| root.path.as_path()),
			Some(std::path::Path::new("/data"))
		);
		assert!(tree.get_root("/elsewhere").is_none());
		assert!(tree.is_root("/media"));
		assert!(!tree.is_root("/media/sub"));
	}

	#[test]
	fn hidden_files_respect_tree_policy() {
		let mut tree = IndexingTree::new();
		tree.add_root("/data", recursive()).expect("add");

		let hidden = file_info(".secret", FileKind::Regular);
		assert!(!tree.is_indexable("/data/.secret", &hidden));

		tree.set_index_hidden(true);
		assert!(tree.is_indexable("/data/.secret", &hidden));
	}

	#[test]
	fn filters_and_content_markers() {
		let mut tree = IndexingTree::new();
		tree.add_root("/data", recursive()).expect("add");
		tree.add_filter(FilterKind::File, "*.tmp").expect("filter");
		tree.add_filter(FilterKind::Directory, "node_modules")
			.expect("filter");
		tree.add_filter(FilterKind::ParentDir, ".nomedia")
			.expect("filter");

		assert!(!tree.is_indexable("/data/a.tmp", &file_info("a.tmp", FileKind::Regular)));
		assert!(tree.is_indexable("/data/a.txt", &file_info("a.txt", FileKind::Regular)));
		assert!(!tree.is_indexable(
			"/data/node_modules",
			&file_info("node_modules", FileKind::Directory)
		));

		let children = vec![
			file_info("track.mp3", FileKind::Regular),
			file_info(".nomedia", FileKind::Regular),
		];
		assert!(!tree.parent_is_indexable("/data/music", &children));
		assert!(tree.parent_is_indexable("/data/music", &children[..1].to_vec()));
	}

	#[test]
	fn non_recursive_roots_stop_at_direct_children() {
		let mut tree = IndexingTree::new();
		tree.add_root("/flat", RootFlags::default()).expect("add");

		assert!(tree.is_indexable("/flat/a.txt", &file_info("a.txt", FileKind::Regular)));
		assert!(!tree.is_indexable("/flat/sub", &file_info("sub", FileKind::Directory)));
		assert!(!tree.is_indexable("/flat/sub/b.txt", &file_info("b.txt", FileKind::Regular)));
	}

	#[tokio::test]
	async fn observer_notifications() {
		let mut tree = IndexingTree::new();
		let mut events = tree.subscribe();

		tree.add_root("/data", recursive()).expect("add");
		tree.update_root("/data", RootFlags::default());
		tree.remove_root("/data");

		assert!(matches!(
			events.recv().await,
			Ok(TreeEvent::DirectoryAdded(path)) if path.as_os_str() == "/data"
		));
		assert!(matches!(
			events.recv().await,
			Ok(TreeEvent::DirectoryUpdated { recursive: true, .. })
		));
		assert!(matches!(
			events.recv().await,
			Ok(TreeEvent::DirectoryRemoved(_))
		));
	}
}
