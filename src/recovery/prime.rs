//! Startup directory selection and recovery snapshot publication
//!
//! The recovery snapshot is a sibling of the live directory
//! (`data` -> `data-recovery`) holding a full copy of the live directory as of
//! the last successful checkpoint. It is replaced atomically: the new copy is
//! built in a temporary directory beside it and then renamed into place.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::Result;

/// Which starting state [`prime`] settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimeOutcome {
    /// No live directory existed; an empty one and an empty snapshot were created
    Fresh,
    /// The live directory exists without a snapshot and was left as is
    Existing,
    /// The live directory was discarded and restored from the snapshot
    Restored,
}

impl PrimeOutcome {
    /// Whether the WAL should be replayed before serving
    pub fn needs_recovery(self) -> bool {
        !matches!(self, PrimeOutcome::Fresh)
    }
}

/// `<folder><suffix>` beside `folder`
pub fn snapshot_path(folder: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = folder
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("data"));
    name.push(suffix);
    folder.with_file_name(name)
}

/// Decide the trusted starting directory for `folder`.
///
/// Changes made to the live directory after the last checkpoint are not
/// assumed consistent, so when a snapshot exists the live directory is rebuilt
/// from it and the WAL tail must then be replayed.
pub fn prime(folder: &Path, suffix: &str) -> Result<PrimeOutcome> {
    let snapshot = snapshot_path(folder, suffix);
    restore_interrupted_swap(&snapshot)?;

    if !folder.exists() {
        fs::create_dir_all(folder)?;
        fs::create_dir_all(&snapshot)?;
        info!("primed fresh database at '{}'", folder.display());
        return Ok(PrimeOutcome::Fresh);
    }

    if !snapshot.exists() {
        info!(
            "no recovery snapshot for '{}', using live directory",
            folder.display()
        );
        return Ok(PrimeOutcome::Existing);
    }

    fs::remove_dir_all(folder)?;
    replace_with_copy(&snapshot, folder)?;
    info!(
        "restored '{}' from snapshot '{}'",
        folder.display(),
        snapshot.display()
    );
    Ok(PrimeOutcome::Restored)
}

/// Replace `snapshot` with a fresh copy of `live`.
pub fn publish_snapshot(live: &Path, snapshot: &Path) -> Result<()> {
    replace_with_copy(live, snapshot)?;
    debug!(
        "published snapshot of '{}' to '{}'",
        live.display(),
        snapshot.display()
    );
    Ok(())
}

/// Build a copy of `src` next to `dst`, then move it into place.
fn replace_with_copy(src: &Path, dst: &Path) -> Result<()> {
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".granite-staging-")
        .tempdir_in(&parent)?;
    copy_dir(src, staging.path())?;

    let retired = retired_path(dst);
    if dst.exists() {
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        fs::rename(dst, &retired)?;
    }
    fs::rename(staging.path(), dst)?;
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }
    sync_dir(&parent)?;
    Ok(())
}

/// A crash between the two renames of a swap leaves only the retired copy.
fn restore_interrupted_swap(snapshot: &Path) -> Result<()> {
    let retired = retired_path(snapshot);
    if retired.exists() {
        if snapshot.exists() {
            fs::remove_dir_all(&retired)?;
        } else {
            info!("resuming interrupted snapshot swap for '{}'", snapshot.display());
            fs::rename(&retired, snapshot)?;
        }
    }
    Ok(())
}

fn retired_path(dir: &Path) -> PathBuf {
    let mut name: OsString = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".old");
    dir.with_file_name(name)
}

/// Recursive copy; every copied file is synced.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            match fs::copy(entry.path(), &target) {
                Ok(_) => File::open(&target)?.sync_all()?,
                // a staging file renamed away while we were listing
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("'{}' vanished during copy", entry.path().display());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

/// Make the renames inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
