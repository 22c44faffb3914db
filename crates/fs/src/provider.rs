use crate::{FileInfo, FileIoError};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio_stream::{wrappers::ReadDirStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
	#[error(transparent)]
	FileIo(#[from] FileIoError),
	#[error("enumeration was cancelled")]
	Cancelled,
}

/// Scheduling hint forwarded by callers; the OS provider ignores it, remote
/// providers may map it onto request priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
	High,
	#[default]
	Default,
	Background,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerateFlags {
	/// Skip the per-child stat; yielded records carry only `name` and `kind`.
	pub no_stat: bool,
}

/// Abstract directory enumeration.
///
/// Children are yielded with a stable ordering within one `begin` call, but no
/// ordering is guaranteed across calls. Cancellation is observed within one
/// batch.
#[async_trait]
pub trait DataProvider: Send + Sync + 'static {
	async fn begin(
		&self,
		dir: &Path,
		flags: EnumerateFlags,
		priority: Priority,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Enumerator>, ProviderError>;
}

#[async_trait]
pub trait Enumerator: Send {
	/// Yields up to `count` children. A short batch means end-of-stream.
	async fn next_batch(&mut self, count: usize) -> Result<Vec<FileInfo>, ProviderError>;

	async fn close(&mut self) -> Result<(), ProviderError>;
}

/// Default provider wrapping the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct OsDataProvider;

#[async_trait]
impl DataProvider for OsDataProvider {
	async fn begin(
		&self,
		dir: &Path,
		flags: EnumerateFlags,
		_priority: Priority,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Enumerator>, ProviderError> {
		if cancel.is_cancelled() {
			return Err(ProviderError::Cancelled);
		}

		let stream = ReadDirStream::new(fs::read_dir(dir).await.map_err(|e| {
			FileIoError::from((dir, e, "failed to open directory to read its entries"))
		})?);

		trace!(dir = %dir.display(), "began enumeration");

		Ok(Box::new(OsEnumerator {
			dir: dir.to_path_buf(),
			stream: Some(stream),
			flags,
			cancel: cancel.clone(),
		}))
	}
}

struct OsEnumerator {
	dir: PathBuf,
	stream: Option<ReadDirStream>,
	flags: EnumerateFlags,
	cancel: CancellationToken,
}

#[async_trait]
impl Enumerator for OsEnumerator {
	async fn next_batch(&mut self, count: usize) -> Result<Vec<FileInfo>, ProviderError> {
		if self.cancel.is_cancelled() {
			return Err(ProviderError::Cancelled);
		}

		let Some(stream) = self.stream.as_mut() else {
			return Ok(Vec::new());
		};

		let mut batch = Vec::with_capacity(count);

		while batch.len() < count {
			let Some(res) = stream.next().await else {
				self.stream = None;
				break;
			};

			let entry =
				res.map_err(|e| FileIoError::from((&self.dir, e, "failed to read dir entry")))?;

			let path = entry.path();

			if self.flags.no_stat {
				let file_type = entry
					.file_type()
					.await
					.map_err(|e| FileIoError::from((&path, e)))?;

				batch.push(FileInfo {
					name: Some(entry.file_name().to_string_lossy().into_owned()),
					kind: if file_type.is_dir() {
						crate::FileKind::Directory
					} else if file_type.is_symlink() {
						crate::FileKind::Symlink
					} else if file_type.is_file() {
						crate::FileKind::Regular
					} else {
						crate::FileKind::Special
					},
					hidden: Some(entry.file_name().to_string_lossy().starts_with('.')),
					..FileInfo::default()
				});
			} else {
				let metadata = fs::symlink_metadata(&path)
					.await
					.map_err(|e| FileIoError::from((&path, e, "failed to stat dir entry")))?;

				batch.push(FileInfo::from_metadata(&path, &metadata));
			}
		}

		Ok(batch)
	}

	async fn close(&mut self) -> Result<(), ProviderError> {
		self.stream = None;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{DataProvider, EnumerateFlags, OsDataProvider, Priority};

	use std::{collections::HashSet, fs};

	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn enumerates_in_batches_until_exhausted() {
		let dir = tempfile::tempdir().expect("tempdir");
		for i in 0..10 {
			fs::write(dir.path().join(format!("f{i}")), b"x").expect("write");
		}

		let mut enumerator = OsDataProvider
			.begin(
				dir.path(),
				EnumerateFlags::default(),
				Priority::default(),
				&CancellationToken::new(),
			)
			.await
			.expect("begin");

		let mut seen = HashSet::new();
		loop {
			let batch = enumerator.next_batch(4).await.expect("batch");
			let done = batch.len() < 4;
			seen.extend(batch.into_iter().filter_map(|info| info.name));
			if done {
				break;
			}
		}

		assert_eq!(seen.len(), 10);
	}

	#[tokio::test]
	async fn cancellation_is_observed() {
		let dir = tempfile::tempdir().expect("tempdir");
		fs::write(dir.path().join("f"), b"x").expect("write");

		let cancel = CancellationToken::new();
		let mut enumerator = OsDataProvider
			.begin(
				dir.path(),
				EnumerateFlags::default(),
				Priority::default(),
				&cancel,
			)
			.await
			.expect("begin");

		cancel.cancel();

		assert!(enumerator.next_batch(4).await.is_err());
	}
}
