//! Host platform detection and OS requirement checks.

use std::cmp::Ordering;
use std::path::Path;

use deckhand_types::{OsFamily, OsRequirement};
use thiserror::Error;

const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

/// Host does not satisfy a contract's OS requirements.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("host OS '{host}' is not one of: {supported}")]
    UnsupportedFamily { host: String, supported: String },

    #[error("host {family} {host_version} is older than required {required}")]
    VersionTooOld {
        family: String,
        host_version: String,
        required: String,
    },
}

/// Operating system identity read from `os-release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
}

impl HostPlatform {
    /// Read the host's `os-release`; `None` when it is missing or unreadable.
    pub fn detect() -> Option<Self> {
        OS_RELEASE_PATHS
            .iter()
            .find_map(|p| Self::from_file(Path::new(p)))
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        Self::parse(&contents)
    }

    /// Parse `os-release` contents. `None` without an `ID` line.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut id = None;
        let mut id_like = Vec::new();
        let mut version_id = None;

        for line in contents.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match key {
                "ID" => id = Some(value.to_ascii_lowercase()),
                "ID_LIKE" => id_like = value.split_whitespace().map(str::to_ascii_lowercase).collect(),
                "VERSION_ID" if !value.is_empty() => version_id = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Self {
            id: id.filter(|s| !s.is_empty())?,
            id_like,
            version_id,
        })
    }

    /// Families this host belongs to: its own `ID` first, then `ID_LIKE`.
    pub fn families(&self) -> Vec<OsFamily> {
        std::iter::once(&self.id)
            .chain(&self.id_like)
            .filter_map(|id| OsFamily::from_os_release_id(id))
            .collect()
    }

    /// Check `requirement` against this host.
    ///
    /// An empty family list accepts every host. Versions are compared as
    /// dotted numbers; when either side isn't numeric the version check is
    /// skipped.
    pub fn check(&self, requirement: &OsRequirement) -> Result<(), PlatformError> {
        if !requirement.family.is_empty() {
            let families = self.families();
            if !requirement.family.iter().any(|f| families.contains(f)) {
                return Err(PlatformError::UnsupportedFamily {
                    host: self.id.clone(),
                    supported: requirement
                        .family
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }

        if let (Some(required), Some(host_version)) =
            (&requirement.min_version, &self.version_id)
        {
            match compare_versions(host_version, required) {
                Some(Ordering::Less) => {
                    return Err(PlatformError::VersionTooOld {
                        family: self.id.clone(),
                        host_version: host_version.clone(),
                        required: required.clone(),
                    });
                }
                Some(_) => {}
                None => tracing::debug!(
                    host_version = %host_version,
                    required = %required,
                    "Versions not comparable, skipping minimum version check"
                ),
            }
        }
        Ok(())
    }
}

/// Compare dotted numeric versions; missing components count as zero.
fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let parse = |v: &str| -> Option<Vec<u64>> { v.split('.').map(|p| p.parse().ok()).collect() };
    let (mut a, mut b) = (parse(a)?, parse(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}
