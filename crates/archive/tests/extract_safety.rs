//! Extraction safety: path sanitization, conflicts and passphrases.

use lode_archive::{
	codec::{mem::MemCodec, ByteSink, Codec, CodecError, Entry, EntryType, Format},
	ConflictAction, Error, Extractor, ExtractorHost, ExtractorOptions,
};

use std::{
	fs,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use tokio_util::sync::CancellationToken;

/// Sink that buffers everything and lands it in a file on close.
struct FileDumpSink {
	path: PathBuf,
	buf: Vec<u8>,
}

impl ByteSink for FileDumpSink {
	fn open(&mut self) -> Result<(), CodecError> {
		Ok(())
	}

	fn write(&mut self, data: &[u8]) -> Result<usize, CodecError> {
		self.buf.extend_from_slice(data);
		Ok(data.len())
	}

	fn close(&mut self) -> Result<(), CodecError> {
		fs::write(&self.path, &self.buf).map_err(|e| CodecError::new(-1, e.to_string()))
	}
}

/// Writes a hand-crafted archive so entry paths can be arbitrarily hostile.
fn craft_archive(path: &Path, passphrase: Option<&str>, entries: &[(&str, &[u8])]) {
	let mut writer = MemCodec.write_new();
	writer.set_format(Format::Tar).expect("format");
	if let Some(passphrase) = passphrase {
		writer.set_passphrase(passphrase).expect("passphrase");
	}
	writer
		.open(Box::new(FileDumpSink {
			path: path.to_path_buf(),
			buf: Vec::new(),
		}))
		.expect("open");

	for (name, data) in entries {
		let mut entry = Entry::new(name, EntryType::Regular);
		entry.size = Some(data.len() as u64);
		writer.write_header(&entry).expect("header");
		writer.write_data(data).expect("data");
	}

	writer.close().expect("close");
}

fn extract(
	archive: &Path,
	out: &Path,
	options: ExtractorOptions,
) -> impl std::future::Future<Output = Result<PathBuf, Error>> {
	Extractor::new(Arc::new(MemCodec), options).run(
		archive.to_path_buf(),
		out.to_path_buf(),
		CancellationToken::new(),
	)
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_entries_collapse_into_the_destination() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("evil.tar");
	craft_archive(
		&archive,
		None,
		&[("../../../../../../etc/passwd", b"not your passwd")],
	);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	extract(&archive, &out, ExtractorOptions::default())
		.await
		.expect("extract");

	// Landed at destination/basename, nowhere else.
	assert_eq!(
		fs::read(out.join("passwd")).expect("read"),
		b"not your passwd"
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn absolute_entries_lose_their_root() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("abs.tar");
	craft_archive(&archive, None, &[("/etc/passwd", b"shadow copy")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	extract(&archive, &out, ExtractorOptions::default())
		.await
		.expect("extract");

	assert_eq!(
		fs::read(out.join("etc/passwd")).expect("read"),
		b"shadow copy"
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_archives_are_rejected() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("empty.tar");
	craft_archive(&archive, None, &[]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	let result = extract(&archive, &out, ExtractorOptions::default()).await;
	assert!(matches!(result, Err(Error::EmptyArchive)));
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_input_is_not_an_archive() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("noise.bin");
	fs::write(&archive, b"this is just some plain bytes").expect("write");

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	let result = extract(&archive, &out, ExtractorOptions::default()).await;
	assert!(matches!(result, Err(Error::NotAnArchive)));
}

#[tokio::test(flavor = "multi_thread")]
async fn symlinked_parent_aborts_extraction() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("entryset.tar");
	craft_archive(&archive, None, &[("sub/inner.txt", b"x")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	// A symlink sits where the entry expects its parent directory; following
	// it would escape the destination.
	let elsewhere = work.path().join("elsewhere");
	fs::create_dir(&elsewhere).expect("mkdir");
	std::os::unix::fs::symlink(&elsewhere, out.join("sub")).expect("symlink");

	let result = extract(&archive, &out, ExtractorOptions::default()).await;
	assert!(matches!(result, Err(Error::NotADirectory(_))));
	assert!(!elsewhere.join("inner.txt").exists());
}

struct ScriptedConflicts {
	action: Mutex<ConflictAction>,
	fired: AtomicUsize,
}

impl ExtractorHost for ScriptedConflicts {
	fn conflict(&self, _file: &Path) -> ConflictAction {
		self.fired.fetch_add(1, Ordering::Relaxed);
		self.action.lock().expect("action").clone()
	}
}

async fn run_conflict_case(
	action: ConflictAction,
) -> (tempfile::TempDir, PathBuf, Arc<ScriptedConflicts>) {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("data.tar");
	craft_archive(&archive, None, &[("x.txt", b"new contents")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");
	fs::write(out.join("x.txt"), b"old contents").expect("write");

	let host = Arc::new(ScriptedConflicts {
		action: Mutex::new(action),
		fired: AtomicUsize::new(0),
	});

	Extractor::new(Arc::new(MemCodec), ExtractorOptions::default())
		.with_host(Arc::clone(&host) as Arc<dyn ExtractorHost>)
		.run(archive, out.clone(), CancellationToken::new())
		.await
		.expect("extract");

	(work, out, host)
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_can_overwrite() {
	let (_work, out, host) = run_conflict_case(ConflictAction::Overwrite).await;
	assert_eq!(host.fired.load(Ordering::Relaxed), 1);
	assert_eq!(fs::read(out.join("x.txt")).expect("read"), b"new contents");
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_can_skip() {
	let (_work, out, host) = run_conflict_case(ConflictAction::Skip).await;
	assert_eq!(host.fired.load(Ordering::Relaxed), 1);
	assert_eq!(fs::read(out.join("x.txt")).expect("read"), b"old contents");
}

#[tokio::test(flavor = "multi_thread")]
async fn unhandled_conflicts_behave_like_skip() {
	let (_work, out, _) = run_conflict_case(ConflictAction::Unhandled).await;
	assert_eq!(fs::read(out.join("x.txt")).expect("read"), b"old contents");
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_can_change_destination() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("data.tar");
	craft_archive(&archive, None, &[("x.txt", b"new contents")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");
	fs::write(out.join("x.txt"), b"old contents").expect("write");

	struct Redirect {
		to: PathBuf,
	}
	impl ExtractorHost for Redirect {
		fn conflict(&self, _file: &Path) -> ConflictAction {
			ConflictAction::ChangeDestination(self.to.clone())
		}
	}

	Extractor::new(Arc::new(MemCodec), ExtractorOptions::default())
		.with_host(Arc::new(Redirect {
			to: out.join("y.txt"),
		}))
		.run(archive, out.clone(), CancellationToken::new())
		.await
		.expect("extract");

	assert_eq!(fs::read(out.join("x.txt")).expect("read"), b"old contents");
	assert_eq!(fs::read(out.join("y.txt")).expect("read"), b"new contents");
}

struct PassphraseSource {
	answer: Option<String>,
	asked: AtomicUsize,
}

impl ExtractorHost for PassphraseSource {
	fn request_passphrase(&self) -> Option<String> {
		self.asked.fetch_add(1, Ordering::Relaxed);
		self.answer.clone()
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_passphrase_is_detected() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("locked.tar");
	craft_archive(
		&archive,
		Some("right horse battery"),
		&[("secret.txt", b"classified"), ("more.txt", b"also secret")],
	);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	let host = Arc::new(PassphraseSource {
		answer: Some("wrong guess".to_string()),
		asked: AtomicUsize::new(0),
	});

	let result = Extractor::new(Arc::new(MemCodec), ExtractorOptions::default())
		.with_host(Arc::clone(&host) as Arc<dyn ExtractorHost>)
		.run(archive, out, CancellationToken::new())
		.await;

	assert!(matches!(result, Err(Error::IncorrectPassphrase)));
	// One prompt per archive, not per entry.
	assert_eq!(host.asked.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn correct_passphrase_unlocks_the_archive() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("locked.tar");
	craft_archive(&archive, Some("right horse battery"), &[("secret.txt", b"classified")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	extract(
		&archive,
		&out,
		ExtractorOptions {
			passphrase: Some("right horse battery".to_string()),
			..ExtractorOptions::default()
		},
	)
	.await
	.expect("extract");

	assert_eq!(fs::read(out.join("secret.txt")).expect("read"), b"classified");
}

#[tokio::test(flavor = "multi_thread")]
async fn archives_without_a_common_prefix_get_their_own_directory() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("bundle.tar");
	craft_archive(&archive, None, &[("a.txt", b"a"), ("b.txt", b"b")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	let destination = extract(&archive, &out, ExtractorOptions::default())
		.await
		.expect("extract");

	assert_eq!(destination, out.join("bundle"));
	assert_eq!(fs::read(out.join("bundle/a.txt")).expect("read"), b"a");
	assert_eq!(fs::read(out.join("bundle/b.txt")).expect("read"), b"b");
}

#[tokio::test(flavor = "multi_thread")]
async fn hosts_can_replace_the_suggested_destination() {
	let work = tempfile::tempdir().expect("tempdir");
	let archive = work.path().join("bundle.tar");
	craft_archive(&archive, None, &[("a.txt", b"a"), ("b.txt", b"b")]);

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	struct PickCustom {
		custom: PathBuf,
	}
	impl ExtractorHost for PickCustom {
		fn decide_destination(&self, _dest: &Path, _files: &[PathBuf]) -> Option<PathBuf> {
			Some(self.custom.clone())
		}
	}

	let destination = Extractor::new(Arc::new(MemCodec), ExtractorOptions::default())
		.with_host(Arc::new(PickCustom {
			custom: out.join("custom"),
		}))
		.run(archive, out.clone(), CancellationToken::new())
		.await
		.expect("extract");

	assert_eq!(destination, out.join("custom"));
	assert_eq!(fs::read(out.join("custom/a.txt")).expect("read"), b"a");
}
