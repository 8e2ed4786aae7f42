// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Workspace file store.
//!
//! Owns all filesystem state under a fixed root: URI⇄path translation,
//! the path-escape check, file CRUD, tree listing, and per-document
//! version / languageId tracking. Sessions and the HTTP layer never touch
//! the filesystem directly; everything funnels through this store.
//!
//! Client URIs are workspace-relative (`file:///src/main.go`). Every path
//! argument is normalized lexically (collapsing `..`) and must resolve to
//! a descendant of the root before any I/O happens.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::WorkspaceError;

/// Tracked metadata for a document opened or written through the store.
#[derive(Debug, Clone)]
struct DocMeta {
    version: i32,
    language_id: String,
}

/// Content and metadata returned by [`WorkspaceStore::read_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// File text as read from disk.
    pub text: String,
    /// Tracked version, or 1 for untracked files.
    pub version: i32,
    /// Tracked languageId, or inferred from the extension.
    pub language_id: String,
}

/// One node of the workspace tree listing.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    /// Entry name (final path component).
    pub name: String,
    /// Workspace-relative path with forward slashes.
    pub path: String,
    /// `"file"` or `"directory"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Children, present for directories only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

/// Workspace store bound to one root directory.
pub struct WorkspaceStore {
    root: PathBuf,
    documents: Mutex<HashMap<String, DocMeta>>,
}

impl WorkspaceStore {
    /// Creates the store, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or resolved.
    pub fn new(root: &Path) -> Result<Arc<Self>, WorkspaceError> {
        std::fs::create_dir_all(root)?;
        // Resolve symlinks in the root once so prefix checks are stable.
        let root = root.canonicalize()?;
        Ok(Arc::new(Self {
            root,
            documents: Mutex::new(HashMap::new()),
        }))
    }

    /// The absolute workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── URI / path translation ──────────────────────────────────────────

    /// Resolves a client URI to an absolute path inside the root.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] if the path escapes the root.
    pub fn uri_to_path(&self, uri: &str) -> Result<PathBuf, WorkspaceError> {
        self.resolve(uri_path_part(uri))
    }

    /// Emits a `file:///`-style workspace-relative URI for an absolute path
    /// under the root. Forward slashes regardless of host OS.
    #[must_use]
    pub fn path_to_uri(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let mut out = String::from("file:///");
        let joined = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        out.push_str(&joined);
        out
    }

    /// Canonical form of a client URI (used as the tracking key).
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] if the URI escapes the root.
    pub fn normalize_uri(&self, uri: &str) -> Result<String, WorkspaceError> {
        Ok(self.path_to_uri(&self.uri_to_path(uri)?))
    }

    /// Resolves an arbitrary path argument (URI path part or relative path)
    /// to an absolute path inside the root.
    ///
    /// The escape check is lexical: leading separators are stripped, `..`
    /// components are collapsed, and any attempt to climb above the root
    /// fails before touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, WorkspaceError> {
        let trimmed = raw.trim_start_matches(['/', '\\']);
        let mut rel = PathBuf::new();

        for comp in Path::new(trimmed).components() {
            match comp {
                Component::Normal(c) => rel.push(c),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !rel.pop() {
                        return Err(WorkspaceError::Security(raw.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }

        let abs = self.root.join(rel);
        if !abs.starts_with(&self.root) {
            return Err(WorkspaceError::Security(raw.to_string()));
        }
        Ok(abs)
    }

    // ── File operations ─────────────────────────────────────────────────

    /// Writes a new file under the root, creating parent directories, and
    /// records it at version 1 with the given languageId.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape or `Io` on failure.
    pub async fn create_file(
        &self,
        uri: &str,
        text: &str,
        language_id: &str,
    ) -> Result<(), WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        let key = self.path_to_uri(&path);

        write_with_parents(&path, text).await?;

        let mut docs = self.documents.lock().await;
        docs.insert(
            key,
            DocMeta {
                version: 1,
                language_id: language_id.to_string(),
            },
        );
        debug!("created {} ({language_id})", path.display());
        Ok(())
    }

    /// Overwrites a file's content and increments its tracked version.
    /// Untracked files become tracked at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape or `Io` on failure.
    pub async fn update_file(&self, uri: &str, text: &str) -> Result<i32, WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        let key = self.path_to_uri(&path);

        write_with_parents(&path, text).await?;

        let mut docs = self.documents.lock().await;
        let meta = docs.entry(key).or_insert_with(|| DocMeta {
            version: 0,
            language_id: infer_language_id(&path).to_string(),
        });
        meta.version += 1;
        Ok(meta.version)
    }

    /// Reads a file with its tracked metadata. Untracked files report
    /// version 1 and a languageId inferred from the extension.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] if the file does not exist.
    pub async fn read_file(&self, uri: &str) -> Result<FileContent, WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        let key = self.path_to_uri(&path);

        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(uri.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let docs = self.documents.lock().await;
        let (version, language_id) = docs.get(&key).map_or_else(
            || (1, infer_language_id(&path).to_string()),
            |m| (m.version, m.language_id.clone()),
        );

        Ok(FileContent {
            text,
            version,
            language_id,
        })
    }

    /// Unlinks a file and forgets its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] if the file does not exist.
    pub async fn delete_file(&self, uri: &str) -> Result<(), WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        let key = self.path_to_uri(&path);

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(uri.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        self.documents.lock().await.remove(&key);
        Ok(())
    }

    /// True if the URI resolves to an existing regular file.
    #[must_use]
    pub async fn has_file(&self, uri: &str) -> bool {
        match self.uri_to_path(uri) {
            Ok(path) => fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // ── Document tracking (LSP lifecycle) ───────────────────────────────

    /// `didOpen` semantics: writes the text and records the document.
    /// Re-opening an already-tracked document keeps the stored version
    /// (never lets it decrease). Returns the effective version.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape or `Io` on failure.
    pub async fn open_document(
        &self,
        uri: &str,
        text: &str,
        language_id: &str,
        version: i32,
    ) -> Result<i32, WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        let key = self.path_to_uri(&path);

        write_with_parents(&path, text).await?;

        let mut docs = self.documents.lock().await;
        let meta = docs.entry(key).or_insert_with(|| DocMeta {
            version: 0,
            language_id: language_id.to_string(),
        });
        meta.version = meta.version.max(version).max(1);
        meta.language_id = language_id.to_string();
        trace!("open {} v{}", path.display(), meta.version);
        Ok(meta.version)
    }

    /// `didChange` semantics: writes the full new text and bumps the
    /// version, honoring the client's version when it is ahead. The
    /// returned version is strictly greater than the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape or `Io` on failure.
    pub async fn change_document(
        &self,
        uri: &str,
        text: &str,
        client_version: i32,
    ) -> Result<i32, WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        let key = self.path_to_uri(&path);

        write_with_parents(&path, text).await?;

        let mut docs = self.documents.lock().await;
        let meta = docs.entry(key).or_insert_with(|| DocMeta {
            version: 0,
            language_id: infer_language_id(&path).to_string(),
        });
        meta.version = (meta.version + 1).max(client_version);
        Ok(meta.version)
    }

    /// `didSave` semantics: rewrites the file content without touching the
    /// tracked version.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape or `Io` on failure.
    pub async fn save_document(&self, uri: &str, text: &str) -> Result<(), WorkspaceError> {
        let path = self.uri_to_path(uri)?;
        write_with_parents(&path, text).await
    }

    /// `didClose` semantics: forgets tracked metadata but keeps the file.
    pub async fn close_document(&self, uri: &str) {
        if let Ok(path) = self.uri_to_path(uri) {
            let key = self.path_to_uri(&path);
            self.documents.lock().await.remove(&key);
        }
    }

    /// Tracked version for a URI, if any.
    #[must_use]
    pub async fn document_version(&self, uri: &str) -> Option<i32> {
        let key = self.normalize_uri(uri).ok()?;
        self.documents.lock().await.get(&key).map(|m| m.version)
    }

    /// Tracked languageId for a URI, falling back to extension inference.
    #[must_use]
    pub async fn document_language(&self, uri: &str) -> String {
        let Ok(path) = self.uri_to_path(uri) else {
            return "plaintext".to_string();
        };
        let key = self.path_to_uri(&path);
        let docs = self.documents.lock().await;
        docs.get(&key).map_or_else(
            || infer_language_id(&path).to_string(),
            |m| m.language_id.clone(),
        )
    }

    // ── Tree / directory operations ─────────────────────────────────────

    /// Recursive listing rooted at `rel_path`. Entries whose name begins
    /// with `.` are skipped; children are sorted directories-first, then
    /// alphabetically.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] if the directory is missing.
    pub async fn list_tree(&self, rel_path: &str) -> Result<Vec<TreeNode>, WorkspaceError> {
        let abs = self.resolve(rel_path)?;
        if !abs.is_dir() {
            return Err(WorkspaceError::NotFound(rel_path.to_string()));
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || collect_children(&abs, &root))
            .await
            .map_err(|e| WorkspaceError::Io(std::io::Error::other(e)))?
    }

    /// Creates a directory (and parents) beneath the root.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] on escape or `Io` on failure.
    pub async fn create_directory(&self, rel_path: &str) -> Result<(), WorkspaceError> {
        let abs = self.resolve(rel_path)?;
        fs::create_dir_all(&abs).await?;
        Ok(())
    }

    /// Deletes a file or directory (recursively) beneath the root and
    /// forgets any tracked metadata under it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] if the path does not exist.
    pub async fn delete_path(&self, rel_path: &str) -> Result<(), WorkspaceError> {
        let abs = self.resolve(rel_path)?;

        let meta = match fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(rel_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            fs::remove_dir_all(&abs).await?;
        } else {
            fs::remove_file(&abs).await?;
        }

        let prefix = self.path_to_uri(&abs);
        let mut docs = self.documents.lock().await;
        docs.retain(|key, _| key != &prefix && !key.starts_with(&format!("{prefix}/")));
        Ok(())
    }

    /// Renames a path beneath the root, transferring tracked metadata from
    /// old URI keys to new ones (including everything under a renamed
    /// directory). Both arguments are escape-checked independently.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Security`] if either path escapes, or
    /// [`WorkspaceError::NotFound`] if the source is missing.
    pub async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<(), WorkspaceError> {
        let old_abs = self.resolve(old_path)?;
        let new_abs = self.resolve(new_path)?;

        if fs::metadata(&old_abs).await.is_err() {
            return Err(WorkspaceError::NotFound(old_path.to_string()));
        }

        if let Some(parent) = new_abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&old_abs, &new_abs).await?;

        let old_uri = self.path_to_uri(&old_abs);
        let new_uri = self.path_to_uri(&new_abs);
        let old_prefix = format!("{old_uri}/");

        let mut docs = self.documents.lock().await;
        let moved: Vec<(String, DocMeta)> = docs
            .iter()
            .filter(|(key, _)| *key == &old_uri || key.starts_with(&old_prefix))
            .map(|(key, meta)| (key.clone(), meta.clone()))
            .collect();

        for (key, meta) in moved {
            docs.remove(&key);
            let new_key = if key == old_uri {
                new_uri.clone()
            } else {
                format!("{new_uri}/{}", &key[old_prefix.len()..])
            };
            docs.insert(new_key, meta);
        }

        debug!("renamed {} -> {}", old_abs.display(), new_abs.display());
        Ok(())
    }
}

/// Writes `text` to `path`, creating parent directories first.
async fn write_with_parents(path: &Path, text: &str) -> Result<(), WorkspaceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, text).await?;
    Ok(())
}

/// Extracts the path component from a URI, or returns the input unchanged
/// when it carries no scheme.
fn uri_path_part(uri: &str) -> &str {
    uri.strip_prefix("file://").map_or(uri, |rest| {
        // file://host/path is not supported; everything after the authority
        // separator is treated as the path.
        rest
    })
}

/// Maps a file extension to an LSP languageId.
pub(crate) fn infer_language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("go") => "go",
        Some("ts" | "tsx") => "typescript",
        Some("js" | "jsx") => "javascript",
        _ => "plaintext",
    }
}

/// Recursively collects the children of `dir`, skipping hidden entries,
/// sorted directories-first then alphabetically.
fn collect_children(dir: &Path, root: &Path) -> Result<Vec<TreeNode>, WorkspaceError> {
    use ignore::WalkBuilder;

    let mut dirs = Vec::new();
    let mut files = Vec::new();

    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(true)
        .max_depth(Some(1))
        .build();

    for entry in walker.flatten() {
        let path = entry.path();
        if path == dir {
            continue;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_some_and(|t| t.is_dir()) {
            dirs.push(TreeNode {
                name,
                path: rel,
                kind: "directory",
                children: Some(collect_children(path, root)?),
            });
        } else {
            files.push(TreeNode {
                name,
                path: rel,
                kind: "file",
                children: None,
            });
        }
    }

    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    dirs.extend(files);
    Ok(dirs)
}
