//! Entry-path sanitization and common-prefix computation.
//!
//! Every archive entry path is rewritten so the resulting filesystem path is
//! guaranteed to lie at or below the extraction destination, whatever the
//! archive claims.

use crate::encoding::decode_pathname;

use std::path::{Component, Path, PathBuf};

/// Rewrites a raw entry pathname into a path under `dest`.
///
/// Absolute paths lose their root, `..` components resolve lexically, and any
/// path that still escapes the destination collapses to
/// `dest/basename(entry)`.
#[must_use]
pub fn sanitize_entry_path(raw: &[u8], dest: &Path) -> PathBuf {
	let name = decode_pathname(raw);

	let mut resolved = dest.to_path_buf();
	for component in Path::new(&name).components() {
		match component {
			Component::Normal(part) => resolved.push(part),
			Component::ParentDir => {
				// May step above dest; the containment check below catches it.
				resolved.pop();
			}
			Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
		}
	}

	if resolved == dest || resolved.starts_with(dest) {
		return resolved;
	}

	let basename = Path::new(&name)
		.components()
		.rev()
		.find_map(|component| match component {
			Component::Normal(part) => Some(part.to_os_string()),
			_ => None,
		})
		.unwrap_or_else(|| "data".into());

	dest.join(basename)
}

/// Deepest path that every file equals or lies below, or `None` when the
/// files only share `dest` itself.
#[must_use]
pub fn common_prefix(dest: &Path, files: &[PathBuf]) -> Option<PathBuf> {
	let mut prefix = files.first()?.clone();

	loop {
		if files
			.iter()
			.all(|file| file == &prefix || file.starts_with(&prefix))
		{
			if prefix == dest {
				return None;
			}
			return Some(prefix);
		}

		if !prefix.pop() {
			return None;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{common_prefix, sanitize_entry_path};

	use std::path::{Path, PathBuf};

	#[test]
	fn relative_paths_resolve_under_dest() {
		assert_eq!(
			sanitize_entry_path(b"a/b.txt", Path::new("/tmp/out")),
			Path::new("/tmp/out/a/b.txt")
		);
	}

	#[test]
	fn absolute_paths_lose_their_root() {
		assert_eq!(
			sanitize_entry_path(b"/etc/passwd", Path::new("/tmp/out")),
			Path::new("/tmp/out/etc/passwd")
		);
	}

	#[test]
	fn traversal_collapses_to_the_basename() {
		assert_eq!(
			sanitize_entry_path(b"../etc/passwd", Path::new("/tmp/out")),
			Path::new("/tmp/out/passwd")
		);
		assert_eq!(
			sanitize_entry_path(b"../../../../../../etc/passwd", Path::new("/tmp/out")),
			Path::new("/tmp/out/passwd")
		);
	}

	#[test]
	fn interior_dotdot_is_resolved_lexically() {
		assert_eq!(
			sanitize_entry_path(b"a/../b.txt", Path::new("/tmp/out")),
			Path::new("/tmp/out/b.txt")
		);
	}

	#[test]
	fn pure_dotdot_degrades_to_a_placeholder() {
		assert_eq!(
			sanitize_entry_path(b"..", Path::new("/tmp/out")),
			Path::new("/tmp/out/data")
		);
	}

	#[test]
	fn common_prefix_is_maximal() {
		let dest = Path::new("/out");
		let files = vec![
			PathBuf::from("/out/proj/src/a.rs"),
			PathBuf::from("/out/proj/src/b.rs"),
			PathBuf::from("/out/proj/README"),
		];

		let prefix = common_prefix(dest, &files).expect("prefix");
		assert_eq!(prefix, Path::new("/out/proj"));

		for file in &files {
			assert!(file == &prefix || file.starts_with(&prefix));
		}
	}

	#[test]
	fn prefix_equal_to_dest_counts_as_none() {
		let dest = Path::new("/out");
		let files = vec![PathBuf::from("/out/a"), PathBuf::from("/out/b")];
		assert_eq!(common_prefix(dest, &files), None);
	}

	#[test]
	fn single_file_is_its_own_prefix() {
		let dest = Path::new("/out");
		let files = vec![PathBuf::from("/out/proj/only.txt")];
		assert_eq!(
			common_prefix(dest, &files),
			Some(PathBuf::from("/out/proj/only.txt"))
		);
	}
}
