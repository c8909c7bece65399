use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::common::utils::fs::write_atomic;
use crate::common::utils::str::sanitize_path_component;

/// Directory tree where credential files are materialized.
///
/// Every caller passes the components that identify its owner, e.g.
/// `["user_<name>", "entry_<entry>", "<client>", "<credential_id>"]`; two different component
/// lists never resolve to the same directory.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory(&self, parts: &[&str]) -> PathBuf {
        let mut path = self.root.clone();
        for part in parts {
            path.push(sanitize_path_component(part));
        }
        path
    }

    /// Atomically writes one file with mode 0600; directories are created with mode 0700.
    pub fn write(&self, parts: &[&str], file_name: &str, content: &[u8]) -> crate::Result<PathBuf> {
        let directory = self.directory(parts);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&directory)?;
        let path = directory.join(sanitize_path_component(file_name));
        write_atomic(&path, content, 0o600)?;
        Ok(path)
    }

    /// Removes the directory of one owner, for example when a client disappeared.
    pub fn remove(&self, parts: &[&str]) -> crate::Result<()> {
        let directory = self.directory(parts);
        if directory.exists() {
            std::fs::remove_dir_all(directory)?;
        }
        Ok(())
    }
}
