//! Installer path safety.
//!
//! The script a job runs is always `<root>/<app_id>/<install_script>`, and
//! must still lie inside the root once every symlink is resolved.
//!
//! # Security Model
//!
//! - Both segments must be plain names (no `..`, `.`, separators, or roots)
//! - Root and script are canonicalized before the containment check
//! - A symlink pointing outside the root is rejected
//! - The target must be a regular file with the expected extension

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Path safety failures. All of them are security-relevant.
#[derive(Debug, Error)]
pub enum PathGuardError {
    /// Segment is not a single plain path component.
    #[error("{what} '{value}' is not a plain path segment")]
    NotPlain { what: &'static str, value: String },

    /// Installer root cannot be resolved.
    #[error("installer root {path} is unavailable: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Script does not exist.
    #[error("installer script {0} not found")]
    NotFound(PathBuf),

    /// Resolved path leaves the installer root.
    #[error("installer script {path} resolves outside the installer root ({target})")]
    Escapes { path: PathBuf, target: PathBuf },

    /// Target is a directory, device, or other non-regular file.
    #[error("installer script {0} is not a regular file")]
    NotAFile(PathBuf),

    /// Target lacks the required extension.
    #[error("installer script {path} must have the .{expected} extension")]
    Extension { path: PathBuf, expected: String },

    #[error("IO error resolving {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A script that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeScript {
    /// Canonical script path.
    pub path: PathBuf,
    /// Canonical directory holding the script; the installer's working directory.
    pub dir: PathBuf,
}

/// Confines installer scripts to one root directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    extension: String,
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject anything but a single normal component.
    pub fn check_segment(what: &'static str, value: &str) -> Result<(), PathGuardError> {
        let not_plain = || PathGuardError::NotPlain {
            what,
            value: value.to_string(),
        };
        if value.is_empty() || value.contains('\0') {
            return Err(not_plain());
        }
        let mut components = Path::new(value).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) if c == value => Ok(()),
            _ => Err(not_plain()),
        }
    }

    /// Resolve and check `<root>/<app_id>/<script>`.
    pub fn resolve(&self, app_id: &str, script: &str) -> Result<SafeScript, PathGuardError> {
        Self::check_segment("app_id", app_id)?;
        Self::check_segment("install_script", script)?;

        let root = self
            .root
            .canonicalize()
            .map_err(|source| PathGuardError::Root {
                path: self.root.clone(),
                source,
            })?;

        let candidate = self.root.join(app_id).join(script);
        let canonical = match candidate.canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PathGuardError::NotFound(candidate));
            }
            Err(source) => {
                return Err(PathGuardError::Io {
                    path: candidate,
                    source,
                });
            }
        };

        if !canonical.starts_with(&root) {
            return Err(PathGuardError::Escapes {
                path: candidate,
                target: canonical,
            });
        }

        let meta = std::fs::metadata(&canonical).map_err(|source| PathGuardError::Io {
            path: canonical.clone(),
            source,
        })?;
        if !meta.is_file() {
            return Err(PathGuardError::NotAFile(canonical));
        }
        if canonical.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
            return Err(PathGuardError::Extension {
                path: canonical,
                expected: self.extension.clone(),
            });
        }

        let dir = match canonical.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return Err(PathGuardError::NotAFile(canonical)),
        };
        Ok(SafeScript {
            path: canonical,
            dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathGuard) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("installers");
        fs::create_dir_all(root.join("nginx")).unwrap();
        fs::write(root.join("nginx/install.sh"), "#!/bin/bash\n").unwrap();
        let guard = PathGuard::new(&root, "sh");
        (dir, guard)
    }

    #[test]
    fn test_valid_script() {
        let (_dir, guard) = setup();
        let script = guard.resolve("nginx", "install.sh").unwrap();
        let root = guard.root().canonicalize().unwrap();
        assert_eq!(script.path, root.join("nginx/install.sh"));
        assert_eq!(script.dir, root.join("nginx"));
    }

    #[test]
    fn test_segments_must_be_plain() {
        let (_dir, guard) = setup();
        for (app, script) in [
            ("..", "install.sh"),
            (".", "install.sh"),
            ("nginx/../..", "install.sh"),
            ("/etc", "install.sh"),
            ("nginx", "../nginx/install.sh"),
            ("nginx", "sub/install.sh"),
            ("nginx", ""),
            ("nginx", "./install.sh"),
        ] {
            assert!(
                matches!(
                    guard.resolve(app, script),
                    Err(PathGuardError::NotPlain { .. })
                ),
                "{app}/{script} accepted"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, guard) = setup();
        let outside = dir.path().join("evil.sh");
        fs::write(&outside, "#!/bin/bash\nrm -rf /\n").unwrap();
        std::os::unix::fs::symlink(&outside, guard.root().join("nginx/evil.sh")).unwrap();

        assert!(matches!(
            guard.resolve("nginx", "evil.sh"),
            Err(PathGuardError::Escapes { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_app_dir_escape_rejected() {
        let (dir, guard) = setup();
        let elsewhere = dir.path().join("elsewhere");
        fs::create_dir(&elsewhere).unwrap();
        fs::write(elsewhere.join("install.sh"), "#!/bin/bash\n").unwrap();
        std::os::unix::fs::symlink(&elsewhere, guard.root().join("redis")).unwrap();

        assert!(matches!(
            guard.resolve("redis", "install.sh"),
            Err(PathGuardError::Escapes { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_allowed() {
        let (_dir, guard) = setup();
        std::os::unix::fs::symlink("install.sh", guard.root().join("nginx/setup.sh")).unwrap();
        let script = guard.resolve("nginx", "setup.sh").unwrap();
        assert!(script.path.ends_with("nginx/install.sh"));
    }

    #[test]
    fn test_missing_and_wrong_kind() {
        let (_dir, guard) = setup();
        assert!(matches!(
            guard.resolve("nginx", "missing.sh"),
            Err(PathGuardError::NotFound(_))
        ));

        fs::create_dir(guard.root().join("nginx/dir.sh")).unwrap();
        assert!(matches!(
            guard.resolve("nginx", "dir.sh"),
            Err(PathGuardError::NotAFile(_))
        ));

        fs::write(guard.root().join("nginx/install.py"), "print()\n").unwrap();
        assert!(matches!(
            guard.resolve("nginx", "install.py"),
            Err(PathGuardError::Extension { .. })
        ));
    }

    #[test]
    fn test_missing_root() {
        let guard = PathGuard::new("/nonexistent/deckhand/installers", "sh");
        assert!(matches!(
            guard.resolve("nginx", "install.sh"),
            Err(PathGuardError::Root { .. })
        ));
    }
}
