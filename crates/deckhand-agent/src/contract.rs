//! Contract loading.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use deckhand_types::{Contract, ContractDef};

use crate::ContractError;

/// Manifest file names, in lookup order.
const MANIFEST_NAMES: &[&str] = &["manifest.yml", "manifest.yaml"];

/// Source of application contracts.
///
/// Contracts are looked up again for every job; implementations should not
/// cache them across jobs.
#[async_trait]
pub trait ContractLoader: Send + Sync {
    async fn load_contract(&self, app_id: &str) -> Result<Contract, ContractError>;
}

/// Reads `<root>/<app_id>/manifest.yml`.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    root: PathBuf,
}

impl ManifestLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse a manifest document.
    pub fn parse(app_id: &str, yaml: &str) -> Result<Contract, ContractError> {
        let invalid = |message: String| ContractError::Invalid {
            app_id: app_id.to_string(),
            message,
        };
        let def: ContractDef = serde_yaml::from_str(yaml).map_err(|e| invalid(e.to_string()))?;
        let contract = Contract::try_from(def).map_err(|e| invalid(e.to_string()))?;
        if contract.id != app_id {
            return Err(invalid(format!(
                "manifest declares id '{}' but lives under '{app_id}'",
                contract.id
            )));
        }
        Ok(contract)
    }
}

fn is_plain_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && app_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[async_trait]
impl ContractLoader for ManifestLoader {
    async fn load_contract(&self, app_id: &str) -> Result<Contract, ContractError> {
        if !is_plain_app_id(app_id) {
            return Err(ContractError::NotFound(app_id.to_string()));
        }

        let dir = self.root.join(app_id);
        for name in MANIFEST_NAMES {
            let path = dir.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(yaml) => {
                    tracing::debug!(app_id, path = %path.display(), "Loaded manifest");
                    return Self::parse(app_id, &yaml);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ContractError::Invalid {
                        app_id: app_id.to_string(),
                        message: format!("unreadable manifest {}: {e}", path.display()),
                    });
                }
            }
        }
        Err(ContractError::NotFound(app_id.to_string()))
    }
}
