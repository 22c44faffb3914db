//! Compress-then-extract round trips through the in-process codec.

use lode_archive::{
	codec::{mem::MemCodec, Filter, Format},
	Compressor, CompressorHost, CompressorOptions, Extractor, ExtractorOptions,
};

use std::{
	collections::BTreeMap,
	fs,
	os::unix::fs::{MetadataExt, PermissionsExt},
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shape {
	kind: &'static str,
	size: Option<u64>,
	mode: u32,
	symlink_target: Option<PathBuf>,
}

/// Collects `relative path → shape` for a tree, ignoring inode-level detail.
fn shape_of(root: &Path) -> BTreeMap<PathBuf, Shape> {
	fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Shape>) {
		for child in fs::read_dir(dir).expect("read_dir") {
			let child = child.expect("entry");
			let path = child.path();
			let metadata = fs::symlink_metadata(&path).expect("stat");
			let rel = path.strip_prefix(root).expect("rel").to_path_buf();

			let kind = if metadata.is_dir() {
				"dir"
			} else if metadata.file_type().is_symlink() {
				"symlink"
			} else {
				"file"
			};

			out.insert(
				rel,
				Shape {
					kind,
					size: (kind == "file").then(|| metadata.len()),
					mode: metadata.permissions().mode() & 0o7777,
					symlink_target: (kind == "symlink").then(|| fs::read_link(&path).expect("link")),
				},
			);

			if metadata.is_dir() {
				walk(root, &path, out);
			}
		}
	}

	let mut out = BTreeMap::new();
	walk(root, root, &mut out);
	out
}

fn build_source_tree(base: &Path) -> PathBuf {
	let src = base.join("src");
	fs::create_dir(&src).expect("mkdir");
	fs::write(src.join("a.txt"), b"alpha contents").expect("write");
	fs::create_dir(src.join("nested")).expect("mkdir");
	fs::write(src.join("nested/deep.bin"), vec![7_u8; 100_000]).expect("write");
	fs::set_permissions(src.join("a.txt"), fs::Permissions::from_mode(0o640)).expect("chmod");

	#[cfg(unix)]
	std::os::unix::fs::symlink("a.txt", src.join("link-to-a")).expect("symlink");

	// Hardlink pair.
	fs::hard_link(src.join("a.txt"), src.join("a-again.txt")).expect("hardlink");

	src
}

#[tokio::test(flavor = "multi_thread")]
async fn tar_roundtrip_preserves_the_tree() {
	let work = tempfile::tempdir().expect("tempdir");
	let src = build_source_tree(work.path());
	let archives = work.path().join("archives");
	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");

	let codec = Arc::new(MemCodec);

	let archive = Compressor::new(
		Arc::clone(&codec),
		CompressorOptions {
			create_top_level_directory: false,
			..CompressorOptions::default()
		},
	)
	.run(vec![src.clone()], archives, CancellationToken::new())
	.await
	.expect("compress");

	assert_eq!(archive.file_name().and_then(|n| n.to_str()), Some("src.tar"));

	let destination = Extractor::new(codec, ExtractorOptions::default())
		.run(archive, out.clone(), CancellationToken::new())
		.await
		.expect("extract");

	// The archive wraps everything in "src", which matches its own name, so
	// no extra wrapper directory is created.
	assert_eq!(destination, out);

	let original = shape_of(&src);
	let extracted_root = out.join("src");
	let extracted = shape_of(&extracted_root);
	assert_eq!(original, extracted);

	// The hardlink equivalence class survived.
	let a = fs::metadata(extracted_root.join("a.txt")).expect("stat");
	let again = fs::metadata(extracted_root.join("a-again.txt")).expect("stat");
	assert_eq!(a.ino(), again.ino());
	assert_eq!(a.len(), 14);

	// Symlink target is verbatim, not resolved.
	assert_eq!(
		fs::read_link(extracted_root.join("link-to-a")).expect("link"),
		Path::new("a.txt")
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn mtimes_survive_the_roundtrip() {
	let work = tempfile::tempdir().expect("tempdir");
	let src = work.path().join("src");
	fs::create_dir(&src).expect("mkdir");
	fs::write(src.join("old.txt"), b"x").expect("write");

	let stamp = filetime::FileTime::from_unix_time(1_000_000_000, 500);
	filetime::set_file_times(src.join("old.txt"), stamp, stamp).expect("set times");

	let codec = Arc::new(MemCodec);
	let archive = Compressor::new(
		Arc::clone(&codec),
		CompressorOptions {
			create_top_level_directory: false,
			..CompressorOptions::default()
		},
	)
	.run(
		vec![src],
		work.path().join("archives"),
		CancellationToken::new(),
	)
	.await
	.expect("compress");

	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");
	Extractor::new(codec, ExtractorOptions::default())
		.run(archive, out.clone(), CancellationToken::new())
		.await
		.expect("extract");

	let metadata = fs::metadata(out.join("src/old.txt")).expect("stat");
	assert_eq!(metadata.mtime(), 1_000_000_000);
}

struct DestRecorder {
	decided: Mutex<Vec<PathBuf>>,
}

impl CompressorHost for DestRecorder {
	fn decide_destination(&self, dest: &Path) {
		self.decided.lock().expect("decided").push(dest.to_path_buf());
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_archives_get_numbered_names() {
	let work = tempfile::tempdir().expect("tempdir");
	let src = work.path().join("notes");
	fs::create_dir(&src).expect("mkdir");
	fs::write(src.join("n.txt"), b"x").expect("write");
	let archives = work.path().join("archives");

	let host = Arc::new(DestRecorder {
		decided: Mutex::new(Vec::new()),
	});
	let codec = Arc::new(MemCodec);

	for _ in 0..2 {
		Compressor::new(Arc::clone(&codec), CompressorOptions::default())
			.with_host(Arc::clone(&host) as Arc<dyn CompressorHost>)
			.run(
				vec![src.clone()],
				archives.clone(),
				CancellationToken::new(),
			)
			.await
			.expect("compress");
	}

	let decided = host.decided.lock().expect("decided").clone();
	assert_eq!(
		decided
			.iter()
			.map(|path| path.file_name().and_then(|n| n.to_str()).expect("name"))
			.collect::<Vec<_>>(),
		vec!["notes.tar", "notes(1).tar"]
	);
	assert!(archives.join("notes.tar").exists());
	assert!(archives.join("notes(1).tar").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_extend_the_archive_extension() {
	let work = tempfile::tempdir().expect("tempdir");
	let src = work.path().join("logs");
	fs::create_dir(&src).expect("mkdir");
	fs::write(src.join("l.txt"), b"x").expect("write");

	let archive = Compressor::new(
		Arc::new(MemCodec),
		CompressorOptions {
			filter: Filter::Gzip,
			..CompressorOptions::default()
		},
	)
	.run(
		vec![src],
		work.path().join("archives"),
		CancellationToken::new(),
	)
	.await
	.expect("compress");

	assert_eq!(
		archive.file_name().and_then(|n| n.to_str()),
		Some("logs.tar.gz")
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn ar_refuses_directory_sources_silently() {
	let work = tempfile::tempdir().expect("tempdir");
	let dir_source = work.path().join("dir");
	fs::create_dir(&dir_source).expect("mkdir");
	fs::write(dir_source.join("inner.txt"), b"x").expect("write");
	let file_source = work.path().join("flat.txt");
	fs::write(&file_source, b"flat").expect("write");

	let codec = Arc::new(MemCodec);
	let archive = Compressor::new(
		Arc::clone(&codec),
		CompressorOptions {
			format: Format::ArGnu,
			create_top_level_directory: false,
			..CompressorOptions::default()
		},
	)
	.run(
		vec![dir_source, file_source],
		work.path().join("archives"),
		CancellationToken::new(),
	)
	.await
	.expect("compress");

	// Only the flat file made it in, under its base name.
	let out = work.path().join("out");
	fs::create_dir(&out).expect("mkdir");
	Extractor::new(codec, ExtractorOptions::default())
		.run(archive, out.clone(), CancellationToken::new())
		.await
		.expect("extract");

	assert!(out.join("flat.txt").exists());
	assert!(!out.join("inner.txt").exists());
	assert!(!out.join("dir").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_filter_combinations_are_rejected() {
	let work = tempfile::tempdir().expect("tempdir");
	let src = work.path().join("s");
	fs::create_dir(&src).expect("mkdir");

	let result = Compressor::new(
		Arc::new(MemCodec),
		CompressorOptions {
			format: Format::Zip,
			filter: Filter::Gzip,
			..CompressorOptions::default()
		},
	)
	.run(
		vec![src],
		work.path().join("archives"),
		CancellationToken::new(),
	)
	.await;

	assert!(matches!(result, Err(lode_archive::Error::InvalidFilter(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_reports_cancelled() {
	let work = tempfile::tempdir().expect("tempdir");
	let src = work.path().join("s");
	fs::create_dir(&src).expect("mkdir");
	fs::write(src.join("f.txt"), b"x").expect("write");

	let cancel = CancellationToken::new();
	cancel.cancel();

	let result = Compressor::new(Arc::new(MemCodec), CompressorOptions::default())
		.run(vec![src], work.path().join("archives"), cancel)
		.await;

	assert!(matches!(result, Err(lode_archive::Error::Cancelled)));
}
