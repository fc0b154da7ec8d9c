//! Free disk space lookups.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::debug;

const GIB: u64 = 1024 * 1024 * 1024;

/// Available bytes on the filesystem holding `path`.
///
/// The path (or its nearest existing ancestor) is matched against the mount
/// point with the longest common prefix. Returns `None` when no disk matches.
pub fn available_bytes(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path)?;
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, u64)> = disks
        .list()
        .iter()
        .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()))
        .collect();
    let available = available_on(&target, &mounts);
    debug!(path = %target.display(), ?available, "disk space");
    available
}

/// True when the filesystem holding `path` has less than `min_gib` free.
/// A threshold of zero disables the check.
pub fn below_threshold(path: &Path, min_gib: u64) -> bool {
    if min_gib == 0 {
        return false;
    }
    available_bytes(path).is_some_and(|bytes| bytes < min_gib.saturating_mul(GIB))
}

fn available_on(target: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| target.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| *available)
}

fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute
        .ancestors()
        .find(|ancestor| ancestor.exists())
        .and_then(|ancestor| ancestor.canonicalize().ok())
}
