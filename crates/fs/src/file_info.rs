use std::{fs::Metadata, path::Path, time::SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
	Regular,
	Directory,
	Symlink,
	Special,
	#[default]
	Unknown,
	Shortcut,
	Mountable,
}

/// Semantic file record with optional fields.
///
/// Every field other than `kind` may be absent; consumers must check presence
/// instead of assuming a provider filled it in. `no_stat` enumerations produce
/// records carrying little more than `name` and `kind`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
	pub name: Option<String>,
	pub kind: FileKind,
	pub size: Option<u64>,
	pub modified_at: Option<DateTime<Utc>>,
	pub accessed_at: Option<DateTime<Utc>>,
	pub changed_at: Option<DateTime<Utc>>,
	pub created_at: Option<DateTime<Utc>>,
	pub uid: Option<u32>,
	pub gid: Option<u32>,
	pub username: Option<String>,
	pub groupname: Option<String>,
	pub mode: Option<u32>,
	pub dev: Option<u64>,
	pub inode: Option<u64>,
	pub nlink: Option<u64>,
	pub rdev: Option<u64>,
	pub symlink_target: Option<std::path::PathBuf>,
	pub mime_type: Option<String>,
	pub hidden: Option<bool>,
}

impl FileInfo {
	/// Builds a record from already fetched metadata, without following
	/// symlinks for the `kind` decision.
	#[must_use]
	pub fn from_metadata(path: impl AsRef<Path>, metadata: &Metadata) -> Self {
		let path = path.as_ref();

		let name = path
			.file_name()
			.map(|name| name.to_string_lossy().into_owned());

		let hidden = name.as_deref().map(|name| name.starts_with('.'));

		let file_type = metadata.file_type();
		let kind = if file_type.is_dir() {
			FileKind::Directory
		} else if file_type.is_symlink() {
			FileKind::Symlink
		} else if file_type.is_file() {
			FileKind::Regular
		} else {
			FileKind::Special
		};

		let mut info = Self {
			name,
			kind,
			size: Some(metadata.len()),
			modified_at: metadata.modified().ok().map(to_utc),
			accessed_at: metadata.accessed().ok().map(to_utc),
			created_at: metadata.created().ok().map(to_utc),
			hidden,
			..Self::default()
		};

		#[cfg(unix)]
		{
			use std::os::unix::fs::MetadataExt;

			info.uid = Some(metadata.uid());
			info.gid = Some(metadata.gid());
			info.mode = Some(metadata.mode());
			info.dev = Some(metadata.dev());
			info.inode = Some(metadata.ino());
			info.nlink = Some(metadata.nlink());
			info.rdev = Some(metadata.rdev());
			#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
			let ctime_nsec = metadata.ctime_nsec() as u32;
			info.changed_at = DateTime::from_timestamp(metadata.ctime(), ctime_nsec);
		}

		if kind == FileKind::Symlink {
			info.symlink_target = std::fs::read_link(path).ok();
		}

		info
	}

	/// Stats `path` (without following symlinks) and builds a record from the
	/// result.
	pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, crate::FileIoError> {
		let path = path.as_ref();

		tokio::fs::symlink_metadata(path)
			.await
			.map(|metadata| Self::from_metadata(path, &metadata))
			.map_err(|e| (path, e, "failed to stat file").into())
	}

	#[must_use]
	pub const fn is_dir(&self) -> bool {
		matches!(self.kind, FileKind::Directory)
	}

	#[must_use]
	pub const fn is_symlink(&self) -> bool {
		matches!(self.kind, FileKind::Symlink)
	}

	#[must_use]
	pub fn is_hidden(&self) -> bool {
		self.hidden.unwrap_or(false)
	}
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
	time.into()
}

#[cfg(test)]
mod tests {
	use super::{FileInfo, FileKind};

	use std::fs;

	use tempfile::tempdir;

	#[tokio::test]
	async fn regular_file_metadata() {
		let dir = tempdir().expect("tempdir");
		let file = dir.path().join("a.txt");
		fs::write(&file, b"0123456789").expect("write");

		let info = FileInfo::from_path(&file).await.expect("stat");

		assert_eq!(info.kind, FileKind::Regular);
		assert_eq!(info.size, Some(10));
		assert_eq!(info.name.as_deref(), Some("a.txt"));
		assert!(info.modified_at.is_some());
		assert_eq!(info.hidden, Some(false));
	}

	#[tokio::test]
	async fn hidden_and_directory() {
		let dir = tempdir().expect("tempdir");
		let sub = dir.path().join(".cache");
		fs::create_dir(&sub).expect("mkdir");

		let info = FileInfo::from_path(&sub).await.expect("stat");

		assert!(info.is_dir());
		assert!(info.is_hidden());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn symlink_target_is_recorded() {
		let dir = tempdir().expect("tempdir");
		let target = dir.path().join("target");
		let link = dir.path().join("link");
		fs::write(&target, b"x").expect("write");
		std::os::unix::fs::symlink(&target, &link).expect("symlink");

		let info = FileInfo::from_path(&link).await.expect("stat");

		assert!(info.is_symlink());
		assert_eq!(info.symlink_target.as_deref(), Some(target.as_path()));
	}
}
