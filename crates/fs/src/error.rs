use std::{io, path::Path};

/// A file I/O error bundled with the path that triggered it and an optional
/// static context message.
#[derive(thiserror::Error, Debug)]
#[error("I/O error at path '{}': {source}{}", .path.display(), .context.map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct FileIoError {
	pub path: Box<Path>,
	pub source: io::Error,
	pub context: Option<&'static str>,
}

impl<P: AsRef<Path>> From<(P, io::Error)> for FileIoError {
	fn from((path, source): (P, io::Error)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			context: None,
		}
	}
}

impl<P: AsRef<Path>> From<(P, io::Error, &'static str)> for FileIoError {
	fn from((path, source, context): (P, io::Error, &'static str)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			context: Some(context),
		}
	}
}

#[derive(thiserror::Error, Debug)]
#[error("received a non UTF-8 path: <lossy_path='{}'>", .0.to_string_lossy())]
pub struct NonUtf8PathError(pub Box<Path>);
