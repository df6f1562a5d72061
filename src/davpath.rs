//! Mapping request paths onto the shared directory tree.
//!
//! Every WebDAV and uploader operation resolves its URL path against
//! the configured root with strict containment: a normalized path that
//! would climb out of the root is refused. The policy filters (allowed
//! file extensions, hidden dotfiles) are enforced here as well.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use http::StatusCode;

use crate::errors::{HttpError, HttpResult};

/// Visibility policy for the shared tree.
#[derive(Debug, Clone, Default)]
pub struct SharePolicy {
    /// When set, only files whose extension (case-insensitive, the
    /// part after the last `.`) is in this set are visible; files
    /// without an extension are filtered. Directories are exempt.
    pub allowed_file_extensions: Option<HashSet<String>>,
    /// Whether `.`-prefixed names are visible.
    pub allow_hidden_items: bool,
}

impl SharePolicy {
    /// Normalize the extension set to lowercase.
    pub fn with_extensions<I, S>(extensions: I, allow_hidden: bool) -> SharePolicy
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SharePolicy {
            allowed_file_extensions: Some(
                extensions
                    .into_iter()
                    .map(|e| e.as_ref().to_ascii_lowercase())
                    .collect(),
            ),
            allow_hidden_items: allow_hidden,
        }
    }

    /// Whether an entry with this basename may be seen or touched.
    pub(crate) fn allows(&self, name: &str, is_dir: bool) -> bool {
        if !self.allow_hidden_items && name.starts_with('.') {
            return false;
        }
        if is_dir {
            return true;
        }
        match &self.allowed_file_extensions {
            None => true,
            Some(extensions) => {
                let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
                extensions.contains(&ext.to_ascii_lowercase())
            }
        }
    }
}

/// An absolute root directory plus the policy guarding it.
pub(crate) struct ShareRoot {
    root: PathBuf,
    policy: SharePolicy,
}

impl ShareRoot {
    pub(crate) fn new(root: PathBuf, policy: SharePolicy) -> ShareRoot {
        ShareRoot { root, policy }
    }

    pub(crate) fn policy(&self) -> &SharePolicy {
        &self.policy
    }

    /// Resolve a decoded URL path to a filesystem path under the root.
    /// Normalizes `.` and empty segments and refuses any path whose
    /// `..` segments would escape.
    pub(crate) fn resolve(&self, url_path: &str) -> HttpResult<PathBuf> {
        let mut out = self.root.clone();
        let mut depth: usize = 0;
        for segment in url_path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if depth == 0 {
                        return Err(HttpError::Status(StatusCode::FORBIDDEN));
                    }
                    depth -= 1;
                    out.pop();
                }
                name => {
                    if name.contains('\0') || name.contains('\\') {
                        return Err(HttpError::Status(StatusCode::BAD_REQUEST));
                    }
                    out.push(name);
                    depth += 1;
                }
            }
        }
        Ok(out)
    }

    /// Policy verdict for a resolved path. The root itself is always
    /// allowed.
    pub(crate) fn allows_path(&self, abs: &Path, is_dir: bool) -> bool {
        if abs == self.root {
            return true;
        }
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.policy.allows(&name, is_dir)
    }

    /// Like [`allows_path`](Self::allows_path) but as a 403 error.
    pub(crate) fn check_path(&self, abs: &Path, is_dir: bool) -> HttpResult<()> {
        if self.allows_path(abs, is_dir) {
            Ok(())
        } else {
            Err(HttpError::Status(StatusCode::FORBIDDEN))
        }
    }
}
