//! Zip archives of whole profiles.
//!
//! An archive holds one top-level directory per profile, named after the
//! profile directory: `abcd.default-release/prefs.js`,
//! `abcd.default-release/storage/...`. A restore takes the first of these
//! directories in archive order.
//!
//! Symlinks are not stored. Symlink entries and names escaping the
//! extraction directory in archives from elsewhere are rejected or skipped.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike};
use filetime::FileTime;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::checksums::{checksum_reader, compute_file_checksum, ChecksumAlgorithm};
use crate::error::{CopyError, EngineError};
use crate::fs_ops::{
    enumerate_tree, ensure_parent_dir_exists, restore_dir_mtimes, CopyEngine, CopyStats,
    EntryKind, TreeEntry,
};
use crate::model::{TransferPhase, TransferProgress};
use crate::progress::CancelToken;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// One profile tree laid out under `prefix` inside the archive.
struct PackedTree {
    source: PathBuf,
    prefix: String,
    entries: Vec<TreeEntry>,
}

fn zip_error(path: &Path, err: ZipError) -> CopyError {
    match err {
        ZipError::Io(e) => CopyError::io(path, e),
        other => CopyError::InvalidArchive {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> CopyError {
    CopyError::InvalidArchive {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Enumerate every source under its archive prefix.
fn plan(sources: &[&Path], archive: &Path) -> Result<Vec<PackedTree>, CopyError> {
    let mut prefixes = HashSet::new();
    let mut trees = Vec::with_capacity(sources.len());

    for source in sources {
        let Some(prefix) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Err(invalid(
                archive,
                format!("{} has no directory name", source.display()),
            ));
        };
        if !prefixes.insert(prefix.clone()) {
            return Err(invalid(archive, format!("two profiles named {}", prefix)));
        }
        let entries = enumerate_tree(source, Path::new(&prefix))?;
        trees.push(PackedTree {
            source: source.to_path_buf(),
            prefix,
            entries,
        });
    }
    Ok(trees)
}

/// `/`-separated entry name for a relative path.
fn entry_name(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_time(modified: SystemTime) -> Option<zip::DateTime> {
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}

fn file_time(stamp: zip::DateTime) -> Option<FileTime> {
    let naive = NaiveDate::from_ymd_opt(stamp.year() as i32, stamp.month() as u32, stamp.day() as u32)?
        .and_hms_opt(stamp.hour() as u32, stamp.minute() as u32, stamp.second() as u32)?;
    let local = naive.and_local_timezone(Local).earliest()?;
    Some(FileTime::from_unix_time(local.timestamp(), 0))
}

fn dir_options(source: &Path) -> SimpleFileOptions {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    match fs::metadata(source).and_then(|m| m.modified()).ok().and_then(zip_time) {
        Some(stamp) => options.last_modified_time(stamp),
        None => options,
    }
}

fn file_options(metadata: &fs::Metadata) -> SimpleFileOptions {
    let mut options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(metadata.len() >= u64::from(u32::MAX));
    if let Some(stamp) = metadata.modified().ok().and_then(zip_time) {
        options = options.last_modified_time(stamp);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode() & 0o7777);
    }
    options
}

fn is_symlink_mode(mode: Option<u32>) -> bool {
    mode.is_some_and(|m| m & S_IFMT == S_IFLNK)
}

fn in_member(relative: &Path, only: Option<&str>) -> bool {
    match (only, relative.components().next()) {
        (None, _) => true,
        (Some(member), Some(Component::Normal(first))) => first.to_string_lossy() == member,
        (Some(_), _) => false,
    }
}

impl CopyEngine {
    /// Pack every tree in `sources` into a new zip file at `archive`.
    ///
    /// Progress and cancellation work as in [`CopyEngine::copy_tree`]. A
    /// failed write leaves the partial archive in place.
    pub fn write_archive(
        &self,
        sources: &[&Path],
        archive: &Path,
        on_progress: &mut dyn FnMut(&TransferProgress),
        cancel: &CancelToken,
    ) -> Result<CopyStats, CopyError> {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }

        let trees = plan(sources, archive)?;
        let mut progress = TransferProgress::new(TransferPhase::Copying);
        for entry in trees.iter().flat_map(|t| &t.entries) {
            if entry.kind == EntryKind::File {
                progress.total_bytes += entry.file_size;
                progress.total_files += 1;
            }
        }

        ensure_parent_dir_exists(archive)?;
        let file = File::create(archive).map_err(|e| CopyError::io(archive, e))?;
        let mut zip = ZipWriter::new(file);
        on_progress(&progress);

        for tree in &trees {
            zip.add_directory(format!("{}/", tree.prefix), dir_options(&tree.source))
                .map_err(|e| zip_error(archive, e))?;

            for entry in &tree.entries {
                if cancel.is_cancelled() {
                    debug!(path = %entry.relative_path.display(), "archive cancelled");
                    return Err(CopyError::Cancelled);
                }

                let name = entry_name(&entry.destination_path);
                match entry.kind {
                    EntryKind::Directory => {
                        zip.add_directory(format!("{}/", name), dir_options(&entry.source_path))
                            .map_err(|e| zip_error(archive, e))?;
                    }
                    EntryKind::Symlink => {
                        debug!(path = %entry.source_path.display(), "symlink not stored in archive");
                    }
                    EntryKind::File => {
                        let src = &entry.source_path;
                        let mut src_file = File::open(src).map_err(|e| CopyError::io(src, e))?;
                        let metadata = src_file.metadata().map_err(|e| CopyError::io(src, e))?;
                        zip.start_file(name.clone(), file_options(&metadata))
                            .map_err(|e| zip_error(archive, e))?;

                        progress.current_file_name = name;
                        self.pump(
                            &mut src_file,
                            &mut zip,
                            src,
                            archive,
                            &mut progress,
                            on_progress,
                            cancel,
                        )?;
                        progress.files_copied += 1;
                        on_progress(&progress);
                    }
                }
            }
        }

        let file = zip.finish().map_err(|e| zip_error(archive, e))?;
        file.sync_all().map_err(|e| CopyError::io(archive, e))?;

        debug!(archive = %archive.display(), files = progress.files_copied, "archive written");
        Ok(CopyStats {
            bytes_copied: progress.bytes_copied,
            files_copied: progress.files_copied,
        })
    }

    /// Unpack `archive` into `destination`, creating it as needed.
    ///
    /// With `only` set, just the entries under that top-level directory are
    /// unpacked. Entry sizes are checked as they are written and the zip CRCs
    /// are checked on read. A failed extraction leaves its partial output in
    /// place.
    pub fn extract_archive(
        &self,
        archive: &Path,
        destination: &Path,
        only: Option<&str>,
        on_progress: &mut dyn FnMut(&TransferProgress),
        cancel: &CancelToken,
    ) -> Result<CopyStats, CopyError> {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }

        let file = File::open(archive).map_err(|e| CopyError::io(archive, e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| zip_error(archive, e))?;

        let mut progress = TransferProgress::new(TransferPhase::Copying);
        for index in 0..zip.len() {
            let entry = zip.by_index(index).map_err(|e| zip_error(archive, e))?;
            let wanted = entry.enclosed_name().is_some_and(|r| in_member(&r, only));
            if wanted && !entry.is_dir() && !is_symlink_mode(entry.unix_mode()) {
                progress.total_bytes += entry.size();
                progress.total_files += 1;
            }
        }

        fs::create_dir_all(destination).map_err(|e| CopyError::io(destination, e))?;
        on_progress(&progress);

        let mut dir_stamps = Vec::new();
        for index in 0..zip.len() {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }

            let mut entry = zip.by_index(index).map_err(|e| zip_error(archive, e))?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(invalid(
                    archive,
                    format!("entry {} points outside the archive", entry.name()),
                ));
            };
            if !in_member(&relative, only) {
                continue;
            }
            let target = destination.join(&relative);
            let stamp = entry.last_modified().and_then(file_time);

            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| CopyError::io(&target, e))?;
                if let Some(stamp) = stamp {
                    dir_stamps.push((target, stamp));
                }
                continue;
            }
            if is_symlink_mode(entry.unix_mode()) {
                warn!(entry = entry.name(), "skipping symlink entry in archive");
                continue;
            }

            ensure_parent_dir_exists(&target)?;
            progress.current_file_name = entry_name(&relative);
            let expected = entry.size();
            let mut out = File::create(&target).map_err(|e| CopyError::io(&target, e))?;
            let written = self.pump(
                &mut entry,
                &mut out,
                archive,
                &target,
                &mut progress,
                on_progress,
                cancel,
            )?;
            drop(out);

            if written != expected {
                return Err(invalid(
                    archive,
                    format!("entry {} holds {} bytes, expected {}", entry.name(), written, expected),
                ));
            }
            if let Some(stamp) = stamp {
                if let Err(e) = filetime::set_file_mtime(&target, stamp) {
                    warn!(path = %target.display(), error = %e, "could not preserve timestamps");
                }
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode().map(|m| m & 0o7777).filter(|m| *m != 0) {
                    if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(mode)) {
                        warn!(path = %target.display(), error = %e, "could not preserve permissions");
                    }
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
}

/// Top-level directory names in `archive`, in archive order.
pub fn archived_profiles(archive: &Path) -> Result<Vec<String>, CopyError> {
    let file = File::open(archive).map_err(|e| CopyError::io(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| zip_error(archive, e))?;

    let mut names: Vec<String> = Vec::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(|e| zip_error(archive, e))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let mut parts = relative.components();
        let Some(Component::Normal(first)) = parts.next() else {
            continue;
        };
        // a bare top-level file is not a profile
        if parts.next().is_none() && !entry.is_dir() {
            continue;
        }
        let first = first.to_string_lossy().into_owned();
        if !names.contains(&first) {
            names.push(first);
        }
    }
    Ok(names)
}

/// Check that every regular file under `sources` is stored in `archive`
/// with the same size and, when `algorithm` is set, the same digest.
pub fn verify_archive(
    sources: &[&Path],
    archive: &Path,
    algorithm: Option<ChecksumAlgorithm>,
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let trees = plan(sources, archive)?;
    let file = File::open(archive).map_err(|e| CopyError::io(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| zip_error(archive, e))?;

    let mut checked = 0usize;
    for entry in trees.iter().flat_map(|t| &t.entries) {
        if entry.kind != EntryKind::File {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled.into());
        }

        let name = entry_name(&entry.destination_path);
        let mismatch = |reason: String| EngineError::VerificationFailed {
            path: archive.join(&name),
            reason,
        };

        let mut stored = match zip.by_name(&name) {
            Ok(stored) => stored,
            Err(ZipError::FileNotFound) => return Err(mismatch("missing from archive".to_string())),
            Err(e) => return Err(zip_error(archive, e).into()),
        };
        if stored.size() != entry.file_size {
            return Err(mismatch(format!(
                "size mismatch: expected {} bytes, found {}",
                entry.file_size,
                stored.size()
            )));
        }
        if let Some(algorithm) = algorithm {
            let expected = compute_file_checksum(&entry.source_path, algorithm)?;
            let actual = checksum_reader(&mut stored, archive, algorithm)?;
            if expected != actual {
                return Err(mismatch(format!(
                    "checksum mismatch: expected {}, found {}",
                    expected, actual
                )));
            }
        }
        checked += 1;
    }

    debug!(archive = %archive.display(), files = checked, "archive verified");
    Ok(())
}
