// ABOUTME: File operations inside a sandbox's bind-backed volumes
// ABOUTME: Every path is resolved against the volume root and rejected if it escapes it

use crate::error::{Result, SandboxError};
use crate::gateway::RuntimeGateway;
use crate::types::{DirEntry, EntryKind};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

fn not_found_or_io(path: &str, e: std::io::Error) -> SandboxError {
    if e.kind() == ErrorKind::NotFound {
        SandboxError::NotFound {
            kind: "Path",
            id: path.to_string(),
        }
    } else {
        SandboxError::Io(e)
    }
}

/// A canonicalized volume directory on the host
#[derive(Debug, Clone)]
pub struct VolumeRoot {
    root: PathBuf,
}

impl VolumeRoot {
    pub async fn open(path: &Path) -> Result<Self> {
        let root = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| not_found_or_io(&path.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a volume path (a leading `/` means the volume root) to a host path inside it.
    /// The target need not exist; its deepest existing ancestor must resolve inside the root,
    /// which also catches symlinks pointing elsewhere.
    pub async fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(SandboxError::PathTraversal(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::PathTraversal(path.to_string()))
                }
            }
        }

        let candidate = self.root.join(&relative);
        for ancestor in candidate.ancestors() {
            match tokio::fs::canonicalize(ancestor).await {
                Ok(resolved) => {
                    if !resolved.starts_with(&self.root) {
                        warn!("Rejected path escaping volume root: {}", path);
                        return Err(SandboxError::PathTraversal(path.to_string()));
                    }
                    let rest = candidate.strip_prefix(ancestor).unwrap_or(Path::new(""));
                    return Ok(resolved.join(rest));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(SandboxError::Io(e)),
            }
        }

        Err(SandboxError::PathTraversal(path.to_string()))
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(path).await?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| not_found_or_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
            let kind = if metadata.file_type().is_symlink() {
                EntryKind::Symlink
            } else if metadata.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: if kind == EntryKind::File { metadata.len() } else { 0 },
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn make_dir(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path).await?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.resolve(path).await?;
        tokio::fs::read(&file)
            .await
            .map_err(|e| not_found_or_io(path, e))
    }

    pub async fn read_text(&self, path: &str) -> Result<String> {
        String::from_utf8(self.read_bytes(path).await?)
            .map_err(|_| SandboxError::Validation(format!("{} is not UTF-8 text", path)))
    }

    /// Write `content`, creating parent directories as needed
    pub async fn write_bytes(&self, path: &str, content: &[u8]) -> Result<()> {
        let file = self.resolve(path).await?;
        if file == self.root {
            return Err(SandboxError::Validation("Cannot write to the volume root".to_string()));
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
        debug!("Wrote {} bytes to {}", content.len(), file.display());
        Ok(())
    }

    /// Tar archive of a file or directory subtree
    pub async fn export_archive(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path).await?;
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| not_found_or_io(path, e))?;

        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            // Links inside the subtree are archived as links, never followed out of the volume
            builder.follow_symlinks(false);
            if metadata.is_dir() {
                builder.append_dir_all(".", &target)?;
            } else {
                let name = target
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("file"));
                builder.append_path_with_name(&target, name)?;
            }
            builder.into_inner()
        })
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::new(ErrorKind::Other, e)))??;

        Ok(archive)
    }
}

/// Volume file operations scoped to the volumes attached to a sandbox
pub struct VolumeFiles {
    gateway: Arc<RuntimeGateway>,
}

impl VolumeFiles {
    pub fn new(gateway: Arc<RuntimeGateway>) -> Self {
        Self { gateway }
    }

    /// Open the host root of `volume` (by name or runtime id) attached to `sandbox_id`
    pub async fn open(&self, sandbox_id: &str, volume: &str) -> Result<VolumeRoot> {
        let attached = self.gateway.get_volumes_of(sandbox_id).await?;
        let Some(volume) = attached
            .iter()
            .find(|v| v.name == volume || v.id == volume)
        else {
            return Err(SandboxError::NotFound {
                kind: "Volume",
                id: volume.to_string(),
            });
        };

        if volume.driver != "local" {
            return Err(SandboxError::Validation(format!(
                "Volume {} uses driver {} and is not host-backed",
                volume.id, volume.driver
            )));
        }

        VolumeRoot::open(&self.gateway.volume_host_path(&volume.id)).await
    }

    pub async fn list_dir(&self, sandbox_id: &str, volume: &str, path: &str) -> Result<Vec<DirEntry>> {
        self.open(sandbox_id, volume).await?.list_dir(path).await
    }

    pub async fn make_dir(&self, sandbox_id: &str, volume: &str, path: &str) -> Result<()> {
        self.open(sandbox_id, volume).await?.make_dir(path).await
    }

    pub async fn read_file(&self, sandbox_id: &str, volume: &str, path: &str) -> Result<String> {
        self.open(sandbox_id, volume).await?.read_text(path).await
    }

    pub async fn read_bytes(&self, sandbox_id: &str, volume: &str, path: &str) -> Result<Vec<u8>> {
        self.open(sandbox_id, volume).await?.read_bytes(path).await
    }

    pub async fn write_file(
        &self,
        sandbox_id: &str,
        volume: &str,
        path: &str,
        content: &str,
    ) -> Result<()> {
        self.open(sandbox_id, volume)
            .await?
            .write_bytes(path, content.as_bytes())
            .await
    }

    pub async fn upload_file(
        &self,
        sandbox_id: &str,
        volume: &str,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        self.open(sandbox_id, volume)
            .await?
            .write_bytes(path, content)
            .await
    }

    pub async fn export_archive(&self, sandbox_id: &str, volume: &str, path: &str) -> Result<Vec<u8>> {
        self.open(sandbox_id, volume).await?.export_archive(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn volume() -> (TempDir, VolumeRoot) {
        let dir = TempDir::new().unwrap();
        let root = VolumeRoot::open(dir.path()).await.unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn test_write_list_and_read() {
        let (_dir, root) = volume().await;

        root.write_bytes("src/main.py", b"print('hi')").await.unwrap();
        root.make_dir("/data/cache").await.unwrap();

        let entries = root.list_dir("/").await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "data".to_string(),
                    kind: EntryKind::Directory,
                    size: 0,
                },
                DirEntry {
                    name: "src".to_string(),
                    kind: EntryKind::Directory,
                    size: 0,
                },
            ]
        );
        assert_eq!(root.read_text("/src/main.py").await.unwrap(), "print('hi')");
        assert_eq!(root.list_dir("src").await.unwrap()[0].size, 11);
    }

    #[tokio::test]
    async fn test_parent_escape_is_rejected() {
        let (_dir, root) = volume().await;

        for path in ["../outside.txt", "/../../etc/passwd", "a/../../b"] {
            assert!(
                matches!(root.resolve(path).await, Err(SandboxError::PathTraversal(_))),
                "{} should be rejected",
                path
            );
        }
        // Dot-dot that stays inside is fine
        assert_eq!(root.resolve("a/b/../c").await.unwrap(), root.path().join("a/c"));
    }

    #[tokio::test]
    async fn test_absolute_paths_stay_inside_the_volume() {
        let (_dir, root) = volume().await;

        root.write_bytes("/etc/passwd", b"volume copy").await.unwrap();
        let resolved = root.resolve("/etc/passwd").await.unwrap();

        assert!(resolved.starts_with(root.path()));
        assert_eq!(root.read_text("/etc/passwd").await.unwrap(), "volume copy");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_rejected() {
        let (_dir, root) = volume().await;
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "top secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        assert!(matches!(
            root.read_text("link/secret").await,
            Err(SandboxError::PathTraversal(_))
        ));
        // Not-yet-existing targets below the link are checked through their ancestor
        assert!(matches!(
            root.write_bytes("link/new/file.txt", b"x").await,
            Err(SandboxError::PathTraversal(_))
        ));
        assert!(!outside.path().join("new").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_dir, root) = volume().await;
        assert!(root.read_bytes("nope.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_binary_content_is_not_text() {
        let (_dir, root) = volume().await;
        root.write_bytes("blob.bin", &[0xff, 0xfe, 0x00]).await.unwrap();

        assert_eq!(root.read_bytes("blob.bin").await.unwrap(), vec![0xff, 0xfe, 0x00]);
        assert!(matches!(
            root.read_text("blob.bin").await,
            Err(SandboxError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_export_directory_archive() {
        let (_dir, root) = volume().await;
        root.write_bytes("out/report.txt", b"done").await.unwrap();
        root.write_bytes("out/logs/run.log", b"ok").await.unwrap();

        let archive = root.export_archive("out").await.unwrap();
        let mut names: Vec<String> = tar::Archive::new(archive.as_slice())
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .map(|name| name.trim_start_matches("./").to_string())
            .filter(|name| name.ends_with(".txt") || name.ends_with(".log"))
            .collect();
        names.sort();

        assert_eq!(names, vec!["logs/run.log", "report.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_export_keeps_symlinks_as_links() {
        let (_dir, root) = volume().await;
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "top secret").unwrap();
        root.write_bytes("out/report.txt", b"done").await.unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("out/link")).unwrap();

        let archive = root.export_archive("out").await.unwrap();
        let mut archive = tar::Archive::new(archive.as_slice());
        let mut entries = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            entries.push((name.trim_start_matches("./").to_string(), entry.header().entry_type()));
        }

        assert!(entries.iter().all(|(name, _)| !name.contains("secret")));
        assert!(entries
            .iter()
            .any(|(name, kind)| name == "link" && *kind == tar::EntryType::Symlink));
    }
}
