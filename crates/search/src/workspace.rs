//! Snapshot/restore of the build-tree files a session overwrites.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use ternary_common::{write_atomic, Result, TuneError};

/// Holds the original content of each guarded file (or its absence) and
/// puts it back on [`restore`](Self::restore) or drop.
#[derive(Debug)]
pub struct BuildTreeGuard {
    saved: Vec<(PathBuf, Option<Vec<u8>>)>,
    restored: bool,
}

impl BuildTreeGuard {
    pub fn snapshot<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut saved = Vec::with_capacity(paths.len());
        for p in paths {
            let path = p.as_ref().to_path_buf();
            let content = match std::fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(TuneError::io(&path, e)),
            };
            debug!(path = %path.display(), existed = content.is_some(), "Build-tree file saved");
            saved.push((path, content));
        }
        Ok(Self {
            saved,
            restored: false,
        })
    }

    /// Put every file back. Idempotent.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        for (path, content) in &self.saved {
            match content {
                Some(bytes) => write_atomic(path, bytes)?,
                None => match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(TuneError::io(path, e)),
                },
            }
        }
        self.restored = true;
        debug!(files = self.saved.len(), "Build tree restored");
        Ok(())
    }
}

impl Drop for BuildTreeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Could not restore build tree");
        }
    }
}
