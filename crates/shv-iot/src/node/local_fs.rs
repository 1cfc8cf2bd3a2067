//! Node exposing a local directory read-only.

use super::{flags, AccessLevel, CallContext, MetaMethod, MethodSignature, ShvNode};
use crate::config::RpcConfig;
use crate::error::{Result, ShvError};
use shv_chainpack::rpc::split_shv_path;
use shv_chainpack::RpcValue;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const METHOD_SIZE: &str = "size";
const METHOD_READ: &str = "read";

/// Serves the files under `root`. Directories list their entries; files
/// answer `size` and `read`.
///
/// Symlinks are followed only while they resolve to somewhere under `root`.
pub struct LocalFsNode {
    root: PathBuf,
    max_read_size: u64,
}

impl LocalFsNode {
    /// Largest `read` result, so a whole-file read still fits in one frame.
    pub const DEFAULT_MAX_READ_SIZE: u64 = (RpcConfig::MAX_MESSAGE_SIZE / 2) as u64;

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_read_size: Self::DEFAULT_MAX_READ_SIZE,
        }
    }

    /// Cap `read` results at `size` bytes; larger files are read in windows.
    pub fn with_max_read_size(mut self, size: u64) -> Self {
        self.max_read_size = size;
        self
    }

    fn local_path(&self, sub_path: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in split_shv_path(sub_path) {
            if segment == ".." || segment == "." || segment.contains('\\') {
                return Err(ShvError::permission_denied(format!(
                    "Path segment '{}' is not allowed",
                    segment
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn metadata(&self, sub_path: &str) -> Result<(PathBuf, std::fs::Metadata)> {
        let not_found = |e: std::io::Error| match e.kind() {
            ErrorKind::NotFound => ShvError::path_not_found(sub_path),
            _ => e.into(),
        };
        let root = tokio::fs::canonicalize(&self.root).await.map_err(not_found)?;
        let path = tokio::fs::canonicalize(self.local_path(sub_path)?)
            .await
            .map_err(not_found)?;
        if !path.starts_with(&root) {
            return Err(ShvError::permission_denied(format!(
                "Path '{}' leads outside the served directory",
                sub_path
            )));
        }
        let meta = tokio::fs::metadata(&path).await.map_err(not_found)?;
        Ok((path, meta))
    }
}

#[async_trait::async_trait]
impl ShvNode for LocalFsNode {
    fn owns_subtree(&self) -> bool {
        true
    }

    async fn children(&self, sub_path: &str) -> Result<Vec<String>> {
        let (path, meta) = self.metadata(sub_path).await?;
        if !meta.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn methods(&self, sub_path: &str) -> Result<Vec<MetaMethod>> {
        let (_, meta) = self.metadata(sub_path).await?;
        if meta.is_dir() {
            return Ok(Vec::new());
        }
        Ok(vec![
            MetaMethod::getter(METHOD_SIZE, AccessLevel::Read),
            MetaMethod::new(
                METHOD_READ,
                MethodSignature::RetParam,
                flags::LARGE_RESULT_HINT,
                AccessLevel::Read,
            ),
        ])
    }

    async fn invoke(
        &self,
        sub_path: &str,
        method: &str,
        params: Option<RpcValue>,
        _ctx: &CallContext,
    ) -> Result<RpcValue> {
        let (path, meta) = self.metadata(sub_path).await?;
        if meta.is_dir() {
            return Err(ShvError::method_not_found(sub_path, method));
        }
        match method {
            METHOD_SIZE => Ok(RpcValue::from(meta.len())),
            METHOD_READ => {
                // Optional {"offset": n, "size": n} window
                let offset = params
                    .as_ref()
                    .and_then(|p| p.get("offset"))
                    .and_then(RpcValue::as_uint)
                    .unwrap_or(0);
                let size = params
                    .as_ref()
                    .and_then(|p| p.get("size"))
                    .and_then(RpcValue::as_uint)
                    .unwrap_or(u64::MAX)
                    .min(self.max_read_size);

                let mut file = tokio::fs::File::open(&path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut data = Vec::new();
                file.take(size).read_to_end(&mut data).await?;
                Ok(RpcValue::from(data))
            }
            _ => Err(ShvError::method_not_found(sub_path, method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ShvTree;
    use shv_chainpack::{ErrorCode, Map};
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, ShvTree) {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/file.txt"), b"hello world")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("top.bin"), [1u8, 2, 3])
            .await
            .unwrap();
        let tree = ShvTree::new()
            .with_node("fs", LocalFsNode::new(dir.path()))
            .unwrap();
        (dir, tree)
    }

    #[tokio::test]
    async fn test_ls_directories() {
        let (_dir, tree) = fixture().await;
        assert_eq!(tree.ls("fs").await.unwrap(), vec!["sub", "top.bin"]);
        assert_eq!(tree.ls("fs/sub").await.unwrap(), vec!["file.txt"]);
        assert!(tree.ls("fs/sub/file.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_and_size() {
        let (_dir, tree) = fixture().await;
        let size = tree.invoke("fs/sub/file.txt", "size", None).await.unwrap();
        assert_eq!(size.as_uint(), Some(11));

        let data = tree.invoke("fs/sub/file.txt", "read", None).await.unwrap();
        assert_eq!(data.as_blob(), Some(&b"hello world"[..]));

        let mut window = Map::new();
        window.insert("offset".to_string(), RpcValue::from(6));
        window.insert("size".to_string(), RpcValue::from(3));
        let part = tree
            .invoke("fs/sub/file.txt", "read", Some(RpcValue::from(window)))
            .await
            .unwrap();
        assert_eq!(part.as_blob(), Some(&b"wor"[..]));
    }

    #[tokio::test]
    async fn test_missing_file_is_path_not_found() {
        let (_dir, tree) = fixture().await;
        let err = tree.invoke("fs/nope.txt", "size", None).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PathNotFound);
    }

    #[tokio::test]
    async fn test_parent_segments_rejected() {
        let (_dir, tree) = fixture().await;
        let err = tree.invoke("fs/../etc/passwd", "read", None).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_directory_has_only_builtins() {
        let (_dir, tree) = fixture().await;
        let methods = tree.dir("fs/sub").await.unwrap();
        assert_eq!(methods.len(), 2);
        let methods = tree.dir("fs/top.bin").await.unwrap();
        assert_eq!(methods.len(), 4);
    }

    #[tokio::test]
    async fn test_read_is_capped() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("big.bin"), [7u8; 10])
            .await
            .unwrap();
        let tree = ShvTree::new()
            .with_node("fs", LocalFsNode::new(dir.path()).with_max_read_size(4))
            .unwrap();

        let head = tree.invoke("fs/big.bin", "read", None).await.unwrap();
        assert_eq!(head.as_blob().map(<[u8]>::len), Some(4));

        let mut window = Map::new();
        window.insert("offset".to_string(), RpcValue::from(8));
        let tail = tree
            .invoke("fs/big.bin", "read", Some(RpcValue::from(window)))
            .await
            .unwrap();
        assert_eq!(tail.as_blob(), Some(&[7u8, 7][..]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_stay_inside_root() {
        let (dir, tree) = fixture().await;
        let outside = TempDir::new().unwrap();
        tokio::fs::write(outside.path().join("secret.txt"), b"secret")
            .await
            .unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("top.bin"), dir.path().join("alias.bin"))
            .unwrap();

        let err = tree
            .invoke("fs/escape/secret.txt", "read", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PermissionDenied);

        let data = tree.invoke("fs/alias.bin", "read", None).await.unwrap();
        assert_eq!(data.as_blob(), Some(&[1u8, 2, 3][..]));
    }
}
