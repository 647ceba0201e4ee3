//! shader 源码与定义文件的读取

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum FileSystemError {
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 按路径读取字节流
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>, FileSystemError>;

    fn exists(&self, path: &Path) -> bool;
}

/// 以某个目录为根的本地文件系统
pub struct NativeFileSystem {
    root: PathBuf,
}

impl NativeFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSystem for NativeFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>, FileSystemError> {
        let full_path = self.root.join(path);
        std::fs::read(&full_path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                FileSystemError::NotFound(full_path)
            } else {
                FileSystemError::Io {
                    path: full_path,
                    source,
                }
            }
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).is_file()
    }
}

/// 内存中的文件系统，用于测试以及运行时生成的 shader
#[derive(Default)]
pub struct MemoryFileSystem {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), content.into());
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.files.write().remove(path).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>, FileSystemError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| FileSystemError::NotFound(path.to_path_buf()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_file_system() {
        let fs = MemoryFileSystem::new();
        fs.insert("shaders/a.hlsl", "float4 main() : SV_Target { return 1; }");

        assert!(fs.exists(Path::new("shaders/a.hlsl")));
        assert_eq!(fs.read(Path::new("shaders/a.hlsl")).unwrap()[..5], *b"float");
        assert!(matches!(fs.read(Path::new("missing.hlsl")), Err(FileSystemError::NotFound(_))));

        assert!(fs.remove(Path::new("shaders/a.hlsl")));
        assert!(fs.is_empty());
    }

    #[test]
    fn test_native_file_system() {
        let root = std::env::temp_dir().join(format!("ze-shader-fs-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("triangle.toml"), "name = \"triangle\"").unwrap();

        let fs = NativeFileSystem::new(&root);
        assert!(fs.exists(Path::new("triangle.toml")));
        assert_eq!(fs.read(Path::new("triangle.toml")).unwrap(), b"name = \"triangle\"");
        assert!(matches!(fs.read(Path::new("nope.toml")), Err(FileSystemError::NotFound(_))));

        std::fs::remove_dir_all(&root).unwrap();
    }
}
