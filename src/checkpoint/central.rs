// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// The central blob store holding checkpoint files and manifests.
///
/// `try_get_file` answers `Ok(false)` for a missing blob; credential and
/// transport problems surface as `Forbidden` / `Transient`.
#[crate::async_trait]
pub trait CentralStore: Send + Sync {
    async fn put_file(&self, src: &Path, blob: &str) -> Result<()>;

    async fn try_get_file(&self, blob: &str, dest: &Path) -> Result<bool>;

    async fn contains(&self, blob: &str) -> Result<bool>;

    /// Blob names under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Directory-backed [`CentralStore`]; stands in for the blob service in
/// single-host deployments and tests.
pub struct LocalDiskCentralStore {
    root: PathBuf,
}

impl LocalDiskCentralStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDiskCentralStore { root: root.into() }
    }

    fn resolve(&self, blob: &str) -> Result<PathBuf> {
        if blob.is_empty() || blob.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::InvalidArgument(format!("blob name '{blob}'")));
        }
        Ok(self.root.join(blob))
    }

    fn walk(dir: &Path, root: &Path, names: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, root, names)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                names.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[crate::async_trait]
impl CentralStore for LocalDiskCentralStore {
    async fn put_file(&self, src: &Path, blob: &str) -> Result<()> {
        let dest = self.resolve(blob)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dest.with_extension("tmp");
        tokio::fs::copy(src, &tmp).await?;
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(())
    }

    async fn try_get_file(&self, blob: &str, dest: &Path) -> Result<bool> {
        let src = self.resolve(blob)?;
        if !tokio::fs::try_exists(&src).await? {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest).await?;
        Ok(true)
    }

    async fn contains(&self, blob: &str) -> Result<bool> {
        let path = self.resolve(blob)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        Self::walk(&self.root, &self.root, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}
