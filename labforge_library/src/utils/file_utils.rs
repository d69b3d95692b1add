use crate::transaction::TransactionId;
use anyhow::Result;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Create the directory and all of its parents if missing
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    match std::fs::create_dir_all(&dir) {
        Ok(_) => Ok(()),
        Err(e) => anyhow::bail!("Failed to create dir '{}' because '{}'", dir.as_ref().display(), e),
    }
}

/// Tries to remove the specified file or empty directory
/// Swallows any failure
pub fn try_remove_pth<P: AsRef<Path>>(path: P, tid: &TransactionId) {
    let pth: &Path = path.as_ref();
    if pth.is_file() {
        if let Err(e) = std::fs::remove_file(pth) {
            warn!(tid=tid, path=%pth.display(), error=%e, "Unable to remove file");
        }
    } else if pth.is_dir() {
        if let Err(e) = std::fs::remove_dir(pth) {
            warn!(tid=tid, path=%pth.display(), error=%e, "Unable to remove directory");
        }
    } else {
        debug!(tid=tid, path=%pth.display(), "Path to delete does not exist")
    }
}

/// Serialize `value` as JSON into `path`.
/// The document is written to a sibling temp file and renamed over the target, so readers never see a partial file.
pub fn write_json_atomic<T: serde::Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    {
        let mut f = match std::fs::File::create(&tmp) {
            Ok(f) => f,
            Err(e) => anyhow::bail!("Failed to create '{}' because '{}'", tmp.display(), e),
        };
        f.write_all(&body)?;
        f.sync_all()?;
    }
    match std::fs::rename(&tmp, path) {
        Ok(_) => Ok(()),
        Err(e) => anyhow::bail!("Failed to move '{}' into place because '{}'", tmp.display(), e),
    }
}

/// Read a JSON document written by [write_json_atomic]
pub fn read_json<T: for<'a> serde::Deserialize<'a>, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let body = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => anyhow::bail!("Failed to read '{}' because '{}'", path.display(), e),
    };
    Ok(serde_json::from_slice(&body)?)
}
