//! Repository-relative path normalization and reserved-path enforcement.
//!
//! Every repository implementation funnels caller-supplied paths through
//! [`guard`] before touching storage, so the restriction lives in exactly
//! one place.

use crate::error::{KbError, Result};
use crate::models::METADATA_DIR;

/// Version-control internals. Reserved at any depth.
const VCS_DIR: &str = ".git";

/// Normalize a caller path to a `/`-separated, repository-relative form.
///
/// `""`, `"."` and `"/"` all normalize to `""` (the root). Leading slashes
/// are treated as repository-rooted, `.` segments are dropped and `..`
/// segments are resolved; a `..` that would leave the repository fails.
pub fn normalize(path: &str) -> Result<String> {
    let cleaned = path.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for segment in cleaned.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(KbError::InvalidPath {
                        path: path.to_string(),
                        reason: "escapes the repository root".to_string(),
                    });
                }
            }
            s if s.contains('\0') => {
                return Err(KbError::InvalidPath {
                    path: path.to_string(),
                    reason: "contains a NUL byte".to_string(),
                });
            }
            s => parts.push(s),
        }
    }

    Ok(parts.join("/"))
}

/// True if a normalized path lies inside a reserved control directory.
pub fn is_reserved(normalized: &str) -> bool {
    let mut segments = normalized.split('/').filter(|s| !s.is_empty());
    match segments.next() {
        None => false,
        Some(first) if first.eq_ignore_ascii_case(METADATA_DIR) => true,
        Some(first) => {
            first.eq_ignore_ascii_case(VCS_DIR)
                || segments.any(|s| s.eq_ignore_ascii_case(VCS_DIR))
        }
    }
}

/// Normalize and reject reserved paths.
pub fn guard(path: &str) -> Result<String> {
    let normalized = normalize(path)?;
    if is_reserved(&normalized) {
        return Err(KbError::PathProhibited {
            path: path.to_string(),
        });
    }
    Ok(normalized)
}

/// Parent directory of a normalized path (`""` for top-level entries).
pub fn parent(normalized: &str) -> &str {
    normalized.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Last segment of a normalized path.
pub fn file_name(normalized: &str) -> &str {
    normalized.rsplit('/').next().unwrap_or(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_aliases() {
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize(".").unwrap(), "");
        assert_eq!(normalize("/").unwrap(), "");
    }

    #[test]
    fn test_normalizes_segments() {
        assert_eq!(normalize("./raw//a.md").unwrap(), "raw/a.md");
        assert_eq!(normalize("raw/../wiki/b.md").unwrap(), "wiki/b.md");
        assert_eq!(normalize("/wiki\\c.md").unwrap(), "wiki/c.md");
    }

    #[test]
    fn test_escape_is_invalid() {
        let err = normalize("../etc/passwd").unwrap_err();
        assert!(matches!(err, KbError::InvalidPath { .. }));
        assert!(normalize("raw/../../x").is_err());
    }

    #[test]
    fn test_git_internals_prohibited_at_any_depth() {
        for p in [".git/config", ".git", "sub/.git/HEAD", "./.GIT/config", "a/../.git/x"] {
            let err = guard(p).unwrap_err();
            assert!(
                matches!(err, KbError::PathProhibited { .. }),
                "expected {} to be prohibited",
                p
            );
        }
    }

    #[test]
    fn test_metadata_dir_prohibited_at_root_only() {
        assert!(guard(".kb/timeline.json").is_err());
        assert!(guard("docs/.kb/notes.md").is_ok());
    }

    #[test]
    fn test_ordinary_paths_pass() {
        assert_eq!(guard("wiki/.gitignore-notes.md").unwrap(), "wiki/.gitignore-notes.md");
        assert_eq!(guard("raw/a.md").unwrap(), "raw/a.md");
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("raw/sub/a.md"), "raw/sub");
        assert_eq!(parent("a.md"), "");
        assert_eq!(file_name("raw/sub/a.md"), "a.md");
    }
}
