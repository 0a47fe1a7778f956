//! Moving staged content into the data directory.

use std::io;
use std::path::Path;

use nodeboot_core::error::{MultiError, Result, StageError};

use super::extract::{ExtractionPlan, StagingArea};

/// Move every planned subtree out of `staging` onto its destination.
///
/// A destination that does not exist yet is replaced by a single rename. An
/// existing destination is merged into entry by entry, with the staged entry
/// replacing a same-named one. Failures are collected per subtree and per
/// entry and returned together once everything was tried. The staging area
/// is removed afterwards either way.
///
/// The merge removes a conflicting entry before moving the new one in, so a
/// crash between the two steps leaves that entry missing until the next run.
pub fn place(staging: StagingArea, plan: &ExtractionPlan) -> Result<()> {
    let mut errs = MultiError::new();

    for (name, dest) in plan.iter() {
        let source = staging.subtree(name);
        if let Err(e) = std::fs::symlink_metadata(&source) {
            errs.push(StageError::Placement(format!(
                "Staged content {} is missing: {}",
                source.display(),
                e
            )));
            continue;
        }

        tracing::debug!(
            source = %source.display(),
            dest = %dest.display(),
            "Moving extracted content into place"
        );

        if let Some(parent) = dest.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                errs.push(StageError::Placement(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                )));
                continue;
            }
        }

        match std::fs::rename(&source, dest) {
            Ok(()) => continue,
            Err(e) if is_conflict(&e) => {}
            Err(e) => {
                errs.push(rename_error(&source, dest, e));
                continue;
            }
        }

        if let Err(e) = merge(&source, dest, &mut errs) {
            errs.push(StageError::Placement(format!(
                "Failed to list {}: {}",
                source.display(),
                e
            )));
        }
    }

    let staging_path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        tracing::warn!(path = %staging_path.display(), error = %e, "Failed to remove staging directory");
    }

    errs.into_result()
}

/// Move each entry of `source` into the existing directory `dest`.
fn merge(source: &Path, dest: &Path, errs: &mut MultiError) -> io::Result<()> {
    let mut entries = std::fs::read_dir(source)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let src = entry.path();
        let dst = dest.join(entry.file_name());

        match std::fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if is_conflict(&e) => {
                if let Err(e) = remove_all(&dst) {
                    errs.push(StageError::Placement(format!(
                        "Failed to remove {}: {}",
                        dst.display(),
                        e
                    )));
                    continue;
                }
                if let Err(e) = std::fs::rename(&src, &dst) {
                    errs.push(rename_error(&src, &dst, e));
                }
            }
            Err(e) => errs.push(rename_error(&src, &dst, e)),
        }
    }
    Ok(())
}

/// Rename failed because something is already at the destination.
fn is_conflict(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EEXIST) | Some(libc::ENOTEMPTY) | Some(libc::EISDIR) | Some(libc::ENOTDIR)
    )
}

fn remove_all(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn rename_error(src: &Path, dst: &Path, err: io::Error) -> StageError {
    StageError::Placement(format!(
        "Failed to rename {} to {}: {}",
        src.display(),
        dst.display(),
        err
    ))
}
