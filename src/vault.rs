//! Vault tree scanning and document reading.
//!
//! [`scan_vault`] walks the vault root (walkdir + globset excludes) and
//! returns a descriptor for every supported file. [`Document::from_files`]
//! reads a batch of descriptors concurrently; each file yields either a
//! [`Document`] or a typed [`DocumentError`].

use std::path::Path;

use anyhow::{bail, Result};
use futures::future::join_all;
use globset::{Glob, GlobSet, GlobSetBuilder};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::VaultConfig;
use crate::models::{Document, DocumentError, DocumentMetadata, FileDescriptor};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.obsidian/**", "**/.git/**", "**/.trash/**"];

/// List every supported file under the vault root, sorted by path.
pub fn scan_vault(config: &VaultConfig) -> Result<Vec<FileDescriptor>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Vault root does not exist: {}", root.display());
    }

    let excludes = exclude_set(config)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if excludes.is_match(&rel_str) {
            continue;
        }

        let file = FileDescriptor::from_path(&rel_str);
        if file.is_supported() {
            files.push(file);
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Built-in excludes plus the configured `exclude_globs`, matched against
/// vault-relative paths.
pub fn exclude_set(config: &VaultConfig) -> Result<GlobSet> {
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    build_globset(&excludes)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl Document {
    /// Read one vault file into a new document with a fresh id.
    pub async fn from_file(file: &FileDescriptor, vault_root: &Path) -> Result<Document, DocumentError> {
        if !file.is_supported() {
            return Err(DocumentError::extension(&file.extension));
        }

        let absolute = vault_root.join(&file.path);
        let content = tokio::fs::read_to_string(&absolute)
            .await
            .map_err(|_| DocumentError::read(format!("could not read {}", absolute.display())))?;

        Ok(Document {
            id: Uuid::new_v4().to_string(),
            page_content: content,
            metadata: DocumentMetadata {
                filename: file.name.clone(),
                extension: file.extension.clone(),
                path: file.path.clone(),
            },
        })
    }

    /// Read every file concurrently. Outcomes are in input order.
    pub async fn from_files(
        files: &[FileDescriptor],
        vault_root: &Path,
    ) -> Vec<Result<Document, DocumentError>> {
        join_all(files.iter().map(|file| Document::from_file(file, vault_root))).await
    }
}
