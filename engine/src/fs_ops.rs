//! Filesystem operations module.
//!
//! This module provides the copy engine:
//! - Enumerating a directory tree without following symlinks
//! - Copying files with progress reporting and cancellation
//! - Preserving modification times of files and directories (and Unix permissions)
//!
//! A failed copy leaves its partial output in place. Cleaning up is the
//! caller's job.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::CopyError;
use crate::model::{TransferPhase, TransferProgress};
use crate::progress::CancelToken;

/// What a tree entry is on disk (symlinks are not followed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// A single file, directory or link within a tree being copied.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full source path
    pub source_path: PathBuf,

    /// Full destination path
    pub destination_path: PathBuf,

    /// Path relative to the tree root
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// File size in bytes (0 for directories and links)
    pub file_size: u64,
}

/// Totals of a finished copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub bytes_copied: u64,
    pub files_copied: usize,
}

/// Enumerate the source directory tree and return all files, links and subdirectories.
///
/// Directories come before their contents. Any unreadable directory fails
/// the whole enumeration. Entries that are neither files, directories nor
/// links are left out.
///
/// # Arguments
/// * `source` - Source directory to enumerate
/// * `destination_root` - Root destination directory (for building destination paths)
pub fn enumerate_tree(source: &Path, destination_root: &Path) -> Result<Vec<TreeEntry>, CopyError> {
    let mut items = Vec::new();

    fn recurse(
        path: &Path,
        rel_path: &Path,
        destination_root: &Path,
        items: &mut Vec<TreeEntry>,
    ) -> Result<(), CopyError> {
        let entries = fs::read_dir(path).map_err(|e| CopyError::io(path, e))?;

        let mut entries = entries
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(|e| CopyError::io(path, e))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let entry_path = entry.path();
            let file_type = entry.file_type().map_err(|e| CopyError::io(&entry_path, e))?;
            let rel_full_path = rel_path.join(entry.file_name());
            let dest_path = destination_root.join(&rel_full_path);

            if file_type.is_symlink() {
                items.push(TreeEntry {
                    source_path: entry_path,
                    destination_path: dest_path,
                    relative_path: rel_full_path,
                    kind: EntryKind::Symlink,
                    file_size: 0,
                });
            } else if file_type.is_dir() {
                items.push(TreeEntry {
                    source_path: entry_path.clone(),
                    destination_path: dest_path,
                    relative_path: rel_full_path.clone(),
                    kind: EntryKind::Directory,
                    file_size: 0,
                });
                recurse(&entry_path, &rel_full_path, destination_root, items)?;
            } else if file_type.is_file() {
                let metadata = entry.metadata().map_err(|e| CopyError::io(&entry_path, e))?;
                items.push(TreeEntry {
                    source_path: entry_path,
                    destination_path: dest_path,
                    relative_path: rel_full_path,
                    kind: EntryKind::File,
                    file_size: metadata.len(),
                });
            } else {
                // sockets, FIFOs and device nodes: opening one can block forever
                warn!(path = %entry_path.display(), "skipping special file");
            }
        }
        Ok(())
    }

    recurse(source, Path::new(""), destination_root, &mut items)?;
    Ok(items)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), CopyError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| CopyError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Give every copied directory the mtime of its source.
///
/// Runs after all writes, deepest directories first, since creating
/// entries inside a directory bumps its mtime.
pub(crate) fn restore_dir_mtimes(stamps: &[(PathBuf, FileTime)]) {
    for (dir, mtime) in stamps.iter().rev() {
        if let Err(e) = filetime::set_file_mtime(dir, *mtime) {
            warn!(path = %dir.display(), error = %e, "could not preserve directory mtime");
        }
    }
}

/// Copies directory trees, reporting progress and honoring cancellation.
#[derive(Debug, Clone)]
pub struct CopyEngine {
    pub(crate) buffer_size: usize,
    pub(crate) progress_interval_bytes: u64,
}

impl CopyEngine {
    pub fn new(config: &EngineConfig) -> Self {
        CopyEngine {
            buffer_size: config.buffer_size,
            progress_interval_bytes: config.progress_interval_bytes,
        }
    }

    /// Copy everything under `source` into `destination`, creating it as needed.
    ///
    /// `on_progress` is called once before the first file, after every file,
    /// and every `progress_interval_bytes` inside large files. `cancel` is
    /// checked between files and at the same byte interval.
    pub fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        on_progress: &mut dyn FnMut(&TransferProgress),
        cancel: &CancelToken,
    ) -> Result<CopyStats, CopyError> {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }

        let entries = enumerate_tree(source, destination)?;

        let mut progress = TransferProgress::new(TransferPhase::Copying);
        progress.total_bytes = entries.iter().map(|e| e.file_size).sum();
        progress.total_files = entries
            .iter()
            .filter(|e| e.kind != EntryKind::Directory)
            .count();

        fs::create_dir_all(destination).map_err(|e| CopyError::io(destination, e))?;
        on_progress(&progress);

        let mut dir_stamps = Vec::new();
        if let Ok(metadata) = fs::metadata(source) {
            dir_stamps.push((
                destination.to_path_buf(),
                FileTime::from_last_modification_time(&metadata),
            ));
        }

        for entry in &entries {
            if cancel.is_cancelled() {
                debug!(path = %entry.relative_path.display(), "copy cancelled");
                return Err(CopyError::Cancelled);
            }

            match entry.kind {
                EntryKind::Directory => {
                    fs::create_dir_all(&entry.destination_path)
                        .map_err(|e| CopyError::io(&entry.destination_path, e))?;
                    if let Ok(metadata) = fs::symlink_metadata(&entry.source_path) {
                        dir_stamps.push((
                            entry.destination_path.clone(),
                            FileTime::from_last_modification_time(&metadata),
                        ));
                    }
                    continue;
                }
                EntryKind::File => {
                    progress.current_file_name = entry.relative_path.display().to_string();
                    self.copy_file(entry, &mut progress, on_progress, cancel)?;
                }
                EntryKind::Symlink => {
                    progress.current_file_name = entry.relative_path.display().to_string();
                    copy_symlink(&entry.source_path, &entry.destination_path)?;
                }
            }

            progress.files_copied += 1;
            on_progress(&progress);
        }

        restore_dir_mtimes(&dir_stamps);

        Ok(CopyStats {
            bytes_copied: progress.bytes_copied,
            files_copied: progress.files_copied,
        })
    }

    /// Copy one regular file, preserving its timestamps.
    fn copy_file(
        &self,
        entry: &TreeEntry,
        progress: &mut TransferProgress,
        on_progress: &mut dyn FnMut(&TransferProgress),
        cancel: &CancelToken,
    ) -> Result<u64, CopyError> {
        let src = &entry.source_path;
        let dst = &entry.destination_path;
        ensure_parent_dir_exists(dst)?;

        let mut src_file = fs::File::open(src).map_err(|e| CopyError::io(src, e))?;
        let src_metadata = src_file.metadata().map_err(|e| CopyError::io(src, e))?;
        let mut dst_file = fs::File::create(dst).map_err(|e| CopyError::io(dst, e))?;

        let bytes_copied =
            self.pump(&mut src_file, &mut dst_file, src, dst, progress, on_progress, cancel)?;
        drop(dst_file);

        let atime = FileTime::from_last_access_time(&src_metadata);
        let mtime = FileTime::from_last_modification_time(&src_metadata);
        if let Err(e) = filetime::set_file_times(dst, atime, mtime) {
            warn!(path = %dst.display(), error = %e, "could not preserve timestamps");
        }

        #[cfg(unix)]
        {
            if let Err(e) = fs::set_permissions(dst, src_metadata.permissions()) {
                warn!(path = %dst.display(), error = %e, "could not preserve permissions");
            }
        }

        debug!(path = %entry.relative_path.display(), bytes = bytes_copied, "file copied");
        Ok(bytes_copied)
    }

    /// Buffered copy from `reader` to `writer`, counting into `progress`.
    ///
    /// `src` and `dst` only name the two ends in errors.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn pump(
        &self,
        reader: &mut dyn Read,
        writer: &mut dyn Write,
        src: &Path,
        dst: &Path,
        progress: &mut TransferProgress,
        on_progress: &mut dyn FnMut(&TransferProgress),
        cancel: &CancelToken,
    ) -> Result<u64, CopyError> {
        let mut buffer = vec![0u8; self.buffer_size];
        let mut bytes_copied = 0u64;
        let mut since_report = 0u64;

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::io(src, e)),
            };
            writer
                .write_all(&buffer[..n])
                .map_err(|e| CopyError::io(dst, e))?;

            bytes_copied += n as u64;
            progress.bytes_copied += n as u64;
            since_report += n as u64;

            if since_report >= self.progress_interval_bytes {
                since_report = 0;
                if cancel.is_cancelled() {
                    return Err(CopyError::Cancelled);
                }
                on_progress(progress);
            }
        }
        writer.flush().map_err(|e| CopyError::io(dst, e))?;
        Ok(bytes_copied)
    }
}

/// Recreate a symlink as a link. Dangling links (Firefox's `lock`) are kept.
#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), CopyError> {
    let target = fs::read_link(src).map_err(|e| CopyError::io(src, e))?;
    ensure_parent_dir_exists(dst)?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).map_err(|e| CopyError::io(dst, e))?;
    }
    std::os::unix::fs::symlink(&target, dst).map_err(|e| CopyError::io(dst, e))
}

/// Without portable symlinks, copy the link target if it is a readable file.
#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), CopyError> {
    match fs::metadata(src) {
        Ok(metadata) if metadata.is_file() => {
            ensure_parent_dir_exists(dst)?;
            fs::copy(src, dst).map_err(|e| CopyError::io(dst, e))?;
            Ok(())
        }
        _ => {
            warn!(path = %src.display(), "skipping link without a readable file target");
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};

    /// Relative path -> file content for every regular file under `root`.
    pub(crate) fn tree_contents(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut out = BTreeMap::new();
        for entry in enumerate_tree(root, Path::new("")).expect("Failed to enumerate") {
            if entry.kind == EntryKind::File {
                let data = fs::read(&entry.source_path).expect("Failed to read file");
                out.insert(entry.relative_path, data);
            }
        }
        out
    }

    pub(crate) fn write_file(path: &Path, data: &[u8]) {
        ensure_parent_dir_exists(path).expect("Failed to create parent");
        fs::write(path, data).expect("Failed to write file");
    }

    fn engine() -> CopyEngine {
        CopyEngine::new(&EngineConfig::default())
    }

    fn sample_profile(root: &Path) {
        write_file(&root.join("prefs.js"), &vec![b'p'; 2048]);
        write_file(&root.join(".parentlock"), b"");
        write_file(&root.join("storage").join("default").join("data.sqlite"), b"rows");
        fs::create_dir_all(root.join("minidumps")).expect("Failed to create dir");
    }

    #[test]
    fn test_enumerate_flat_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("file1.txt"), b"test data 1");
        write_file(&src.join("file2.txt"), b"test data 2");

        let items = enumerate_tree(&src, &temp_dir.path().join("dst")).expect("Failed to enumerate");

        let files: Vec<_> = items.iter().filter(|f| f.kind == EntryKind::File).collect();
        assert_eq!(files.len(), 2, "Expected 2 files, got {}", files.len());
        let total_size: u64 = files.iter().map(|f| f.file_size).sum();
        assert_eq!(total_size, 22, "Expected 22 total bytes, got {}", total_size);
        assert_eq!(files[0].destination_path, temp_dir.path().join("dst").join("file1.txt"));
    }

    #[test]
    fn test_enumerate_nested_directory_lists_parent_first() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("file1.txt"), b"data1");
        write_file(&src.join("subdir").join("file2.txt"), b"data2");

        let items = enumerate_tree(&src, &temp_dir.path().join("dst")).expect("Failed to enumerate");

        let dirs: Vec<_> = items.iter().filter(|f| f.kind == EntryKind::Directory).collect();
        assert_eq!(dirs.len(), 1);
        let dir_pos = items.iter().position(|f| f.kind == EntryKind::Directory).unwrap();
        let nested_pos = items
            .iter()
            .position(|f| f.relative_path == Path::new("subdir").join("file2.txt"))
            .unwrap();
        assert!(dir_pos < nested_pos);
    }

    #[test]
    fn test_enumerate_nonexistent_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = enumerate_tree(&temp_dir.path().join("nonexistent"), temp_dir.path());
        assert!(matches!(result, Err(CopyError::IoFailure { .. })));
    }

    #[test]
    fn test_copy_tree_reproduces_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("profile");
        let dst = temp_dir.path().join("backup");
        sample_profile(&src);

        let stats = engine()
            .copy_tree(&src, &dst, &mut |_| {}, &CancelToken::new())
            .expect("Failed to copy tree");

        assert_eq!(stats.files_copied, 3);
        assert_eq!(stats.bytes_copied, 2048 + 4);
        assert_eq!(tree_contents(&src), tree_contents(&dst));
        assert!(dst.join("minidumps").is_dir(), "Empty directories are copied");
        assert!(dst.join(".parentlock").exists(), "Hidden lock files are copied");
    }

    #[test]
    fn test_copy_tree_preserves_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("places.sqlite"), b"bookmarks");
        let old = SystemTime::now() - Duration::from_secs(86_400 * 30);
        filetime::set_file_mtime(src.join("places.sqlite"), FileTime::from_system_time(old))
            .expect("Failed to set mtime");

        let dst = temp_dir.path().join("dst");
        engine()
            .copy_tree(&src, &dst, &mut |_| {}, &CancelToken::new())
            .expect("Failed to copy tree");

        let src_mtime = fs::metadata(src.join("places.sqlite")).unwrap().modified().unwrap();
        let dst_mtime = fs::metadata(dst.join("places.sqlite")).unwrap().modified().unwrap();
        let drift = src_mtime
            .duration_since(dst_mtime)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1), "mtime drifted by {:?}", drift);
    }

    #[test]
    fn test_copy_tree_preserves_directory_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("storage").join("default").join("data.sqlite"), b"rows");
        write_file(&src.join("prefs.js"), b"x");
        let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(86_400 * 90));
        for dir in [src.join("storage").join("default"), src.join("storage"), src.clone()] {
            filetime::set_file_mtime(&dir, old).expect("Failed to set mtime");
        }

        let dst = temp_dir.path().join("dst");
        engine()
            .copy_tree(&src, &dst, &mut |_| {}, &CancelToken::new())
            .expect("Failed to copy tree");

        for dir in [dst.join("storage").join("default"), dst.join("storage"), dst.clone()] {
            let metadata = fs::metadata(&dir).expect("Failed to read metadata");
            assert_eq!(
                FileTime::from_last_modification_time(&metadata).unix_seconds(),
                old.unix_seconds(),
                "{} kept a fresh mtime",
                dir.display()
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_skips_sockets() {
        use std::os::unix::net::UnixListener;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("prefs.js"), b"x");
        let _listener = UnixListener::bind(src.join("ipc.sock")).expect("Failed to bind socket");

        let entries = enumerate_tree(&src, Path::new("")).expect("Failed to enumerate");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, PathBuf::from("prefs.js"));

        let dst = temp_dir.path().join("dst");
        let stats = engine()
            .copy_tree(&src, &dst, &mut |_| {}, &CancelToken::new())
            .expect("Failed to copy tree");
        assert_eq!(stats.files_copied, 1);
        assert!(fs::symlink_metadata(dst.join("ipc.sock")).is_err());
    }

    #[test]
    fn test_copy_tree_reports_progress_per_file_and_mid_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("a.bin"), &vec![1u8; 10 * 1024]);
        write_file(&src.join("b.txt"), b"small");

        let config = EngineConfig::default()
            .with_buffer_size(1024)
            .with_progress_interval_bytes(2048);
        let mut snapshots = Vec::new();
        CopyEngine::new(&config)
            .copy_tree(
                &src,
                &temp_dir.path().join("dst"),
                &mut |p: &TransferProgress| snapshots.push(p.clone()),
                &CancelToken::new(),
            )
            .expect("Failed to copy tree");

        // initial + 5 mid-file for a.bin + one per file
        assert_eq!(snapshots.len(), 1 + 5 + 2);
        assert!(snapshots.windows(2).all(|w| w[0].bytes_copied <= w[1].bytes_copied));

        let last = snapshots.last().unwrap();
        assert_eq!(last.bytes_copied, last.total_bytes);
        assert_eq!(last.files_copied, 2);
        assert_eq!(last.current_file_name, "b.txt");
        assert_eq!(last.phase, TransferPhase::Copying);
    }

    #[test]
    fn test_copy_tree_cancel_before_start() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("prefs.js"), b"x");
        let token = CancelToken::new();
        token.cancel();

        let result = engine().copy_tree(&src, &temp_dir.path().join("dst"), &mut |_| {}, &token);
        assert!(matches!(result, Err(CopyError::Cancelled)));
        assert!(!temp_dir.path().join("dst").exists());
    }

    #[test]
    fn test_copy_tree_cancel_mid_copy_leaves_source_intact() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        for i in 0..5 {
            write_file(&src.join(format!("file{}.txt", i)), format!("content {}", i).as_bytes());
        }
        let before = tree_contents(&src);
        let dst = temp_dir.path().join("dst");

        let token = CancelToken::new();
        let canceller = token.clone();
        let result = engine().copy_tree(
            &src,
            &dst,
            &mut |p: &TransferProgress| {
                if p.files_copied == 2 {
                    canceller.cancel();
                }
            },
            &token,
        );

        assert!(matches!(result, Err(CopyError::Cancelled)));
        assert_eq!(tree_contents(&src), before);
        // Partial output is left for the caller
        assert_eq!(tree_contents(&dst).len(), 2);
    }

    #[test]
    fn test_copy_tree_io_failure_names_path() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("prefs.js"), b"x");
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"not a dir").expect("Failed to write file");

        let result = engine().copy_tree(&src, &blocker.join("dst"), &mut |_| {}, &CancelToken::new());
        match result {
            Err(CopyError::IoFailure { path, .. }) => assert!(path.starts_with(&blocker)),
            other => panic!("Expected IoFailure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_recreates_dangling_lock_symlink() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_file(&src.join("prefs.js"), b"x");
        std::os::unix::fs::symlink("127.0.1.1:+4242", src.join("lock")).expect("Failed to create link");

        let dst = temp_dir.path().join("dst");
        let stats = engine()
            .copy_tree(&src, &dst, &mut |_| {}, &CancelToken::new())
            .expect("Failed to copy tree");

        assert_eq!(stats.files_copied, 2);
        let target = fs::read_link(dst.join("lock")).expect("lock should be a symlink");
        assert_eq!(target, PathBuf::from("127.0.1.1:+4242"));
    }
}
