//! Path-keyed blob storage for template assets.
//!
//! Keys are relative, `/`-separated paths. Anything that is not a plain sequence of
//! normal components (absolute paths, `..`, drive prefixes) is refused.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::util::{hex_encode, random_bytes};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `path`.
    async fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    async fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Write a batch of blobs. Implementations should make the batch visible only once
    /// every blob has been stored.
    async fn write_all(&self, blobs: &[(String, Vec<u8>)]) -> io::Result<()> {
        for (path, bytes) in blobs {
            self.write(path, bytes).await?;
        }
        Ok(())
    }
}

/// Reject keys that could resolve outside the store root.
pub fn checked_relative(path: &str) -> io::Result<PathBuf> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid blob path: {path}"));

    if path.is_empty() || path.contains('\\') || path.contains(':') {
        return Err(invalid());
    }

    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(out)
}

/// Blob store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(checked_relative(path)?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await
    }

    /// Stage every blob under a private directory, then rename into place.
    ///
    /// Blobs being replaced are moved aside first. If any promotion fails, the ones already
    /// promoted are undone and the previous blobs restored, so a failed batch leaves the
    /// tree as it was.
    async fn write_all(&self, blobs: &[(String, Vec<u8>)]) -> io::Result<()> {
        let mut targets = Vec::with_capacity(blobs.len());
        for (path, _) in blobs {
            targets.push(checked_relative(path)?);
        }

        let suffix = random_bytes(8).map_err(|e| io::Error::other(e.to_string()))?;
        let staging = self.root.join(format!(".staging-{}", hex_encode(&suffix)));
        let fresh = staging.join("new");
        let backup = staging.join("old");

        let staged = async {
            for (rel, (_, bytes)) in targets.iter().zip(blobs) {
                let file = fresh.join(rel);
                if let Some(parent) = file.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&file, bytes).await?;
            }
            Ok::<_, io::Error>(())
        }
        .await;

        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let mut promoted: Vec<Promoted<'_>> = Vec::with_capacity(targets.len());
        let mut result = Ok(());
        for rel in &targets {
            let dest = self.root.join(rel);
            let displaced = match displace(&dest, &backup.join(rel)).await {
                Ok(displaced) => displaced,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            let placed = tokio::fs::rename(fresh.join(rel), &dest).await;
            promoted.push(Promoted {
                rel: rel.as_path(),
                placed: placed.is_ok(),
                displaced,
            });
            if let Err(e) = placed {
                result = Err(e);
                break;
            }
        }

        if result.is_err() {
            for entry in promoted.iter().rev() {
                if let Err(e) = entry.undo(&self.root, &backup).await {
                    tracing::error!(
                        error = %e,
                        path = %entry.rel.display(),
                        "failed to roll back blob batch"
                    );
                }
            }
        }

        let _ = tokio::fs::remove_dir_all(&staging).await;
        result
    }
}

/// One blob moved into place, and whether it displaced an earlier one.
struct Promoted<'a> {
    rel: &'a Path,
    placed: bool,
    displaced: bool,
}

impl Promoted<'_> {
    async fn undo(&self, root: &Path, backup: &Path) -> io::Result<()> {
        let dest = root.join(self.rel);
        if self.placed {
            tokio::fs::remove_file(&dest).await?;
        }
        if self.displaced {
            tokio::fs::rename(backup.join(self.rel), &dest).await?;
        }
        Ok(())
    }
}

/// Prepare `dest` for promotion: create its parent and move any current blob to `aside`.
/// Returns whether something was moved.
async fn displace(dest: &Path, aside: &Path) -> io::Result<bool> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::symlink_metadata(dest).await {
        Ok(_) => {
            if let Some(parent) = aside.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(dest, aside).await?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
