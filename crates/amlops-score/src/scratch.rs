use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs::File;

use crate::error::RequestError;

pub const DEFAULT_SCRATCH_ROOT: &str = "request_files";

/// Root under which uploads are staged, one subdirectory per request.
#[derive(Debug, Clone)]
pub struct ScratchRoot {
    root: PathBuf,
}

impl ScratchRoot {
    /// Creates the root if it does not exist yet.
    pub fn create(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Scratch space for one request. Nothing is created on disk until the
    /// first file is staged.
    pub fn request(&self, request_id: &str) -> RequestScratch {
        RequestScratch {
            dir: self.root.join(request_id),
            created: false,
            names: HashSet::new(),
        }
    }
}

/// Per-request upload directory.
///
/// Removed by [`RequestScratch::cleanup`]; dropping the guard without
/// cleaning up (a cancelled request) removes it synchronously.
#[derive(Debug)]
pub struct RequestScratch {
    dir: PathBuf,
    created: bool,
    names: HashSet<String>,
}

impl RequestScratch {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens a new file for an upload named `original` by the client.
    ///
    /// Only the final path component is kept. A second upload with the same
    /// name in one request gets a numeric prefix.
    pub async fn create_file(&mut self, original: &str) -> Result<(PathBuf, File), RequestError> {
        let base = sanitize_filename(original)
            .ok_or_else(|| RequestError::InvalidFilename(original.to_string()))?;
        let mut name = base.clone();
        let mut n = 1;
        while self.names.contains(&name) {
            name = format!("{n}_{base}");
            n += 1;
        }

        if !self.created {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|source| RequestError::Stage {
                    path: self.dir.clone(),
                    source,
                })?;
            self.created = true;
        }

        let path = self.dir.join(&name);
        let file = File::create(&path)
            .await
            .map_err(|source| RequestError::Stage {
                path: path.clone(),
                source,
            })?;
        self.names.insert(name);
        Ok((path, file))
    }

    pub async fn cleanup(mut self) {
        if !self.created {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!(dir=%self.dir.display(), error=%e, "failed to remove request scratch dir");
        }
        self.created = false;
    }
}

impl Drop for RequestScratch {
    fn drop(&mut self) {
        if self.created {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

/// Final component of a client-supplied filename, with either separator.
fn sanitize_filename(original: &str) -> Option<String> {
    let last = original.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}
