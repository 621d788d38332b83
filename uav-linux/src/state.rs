//! Peer-table persistence (JSON, 32-byte values as hex). The device-function salt is never written.

use std::path::Path;

use anyhow::Context;
use uav_core::PeerStore;

/// Load the peer table; a missing file is an empty table.
pub fn load(path: &Path) -> anyhow::Result<PeerStore> {
    if !path.exists() {
        return Ok(PeerStore::new());
    }
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    let store = serde_json::from_str(&s)
        .with_context(|| format!("parsing state file {}", path.display()))?;
    Ok(store)
}

/// Write the peer table via a temporary file and rename.
pub fn save(path: &Path, store: &PeerStore) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(store)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Write back only the records that differ between `before` and `after`, on top of the
/// current file contents. Records another process changed in the meantime are kept.
/// Returns the number of records written or removed.
pub fn save_changes(path: &Path, before: &PeerStore, after: &PeerStore) -> anyhow::Result<usize> {
    let mut disk = load(path)?;
    let mut changed = 0;
    for (id, rec) in after.iter() {
        if before.get(id) != Some(rec) {
            disk.insert(id, rec.clone());
            changed += 1;
        }
    }
    for (id, _) in before.iter() {
        if !after.contains(id) {
            disk.remove(id);
            changed += 1;
        }
    }
    if changed > 0 {
        save(path, &disk)?;
    }
    Ok(changed)
}
