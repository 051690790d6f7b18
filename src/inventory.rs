use crate::error::{Result, UpdateError};
use crate::model::{ManagedUnit, RepoId, Stack, StackAddress, StackId, UnitId};
use crate::utils::path_validator::PathValidator;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot produced by an external container scanner.
#[derive(Debug, Deserialize)]
pub struct Inventory {
    pub stacks: Vec<InventoryStack>,
    #[serde(default)]
    pub units: Vec<InventoryUnit>,
}

#[derive(Debug, Deserialize)]
pub struct InventoryStack {
    pub id: StackId,
    pub name: String,
    pub compose_file: Option<PathBuf>,
    pub remote: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InventoryUnit {
    pub id: UnitId,
    pub stack_id: StackId,
    pub name: String,
    pub image: String,
    /// Labels, environment and anything else worth sniffing for a source link.
    #[serde(default)]
    pub metadata: String,
    /// Manual `owner/name` repository override.
    pub repo: Option<String>,
    #[serde(default)]
    pub secondary: bool,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            UpdateError::InvalidInput(format!("Failed to read inventory '{}': {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Convert into model records, carrying over what was learned about units that
    /// still run the same image.
    pub fn into_model(self, existing: &[ManagedUnit]) -> Result<(Vec<Stack>, Vec<ManagedUnit>)> {
        let stacks = self
            .stacks
            .into_iter()
            .map(InventoryStack::into_stack)
            .collect::<Result<Vec<_>>>()?;

        let mut units = Vec::with_capacity(self.units.len());
        for entry in self.units {
            let mut unit = match existing.iter().find(|u| u.id == entry.id && u.image == entry.image) {
                Some(known) => known.clone(),
                None => ManagedUnit::new(entry.id, entry.stack_id, &entry.name, &entry.image),
            };
            unit.name = entry.name;
            unit.stack_id = entry.stack_id;
            unit.metadata = entry.metadata;
            unit.is_secondary = entry.secondary;
            unit.override_repo = entry.repo.as_deref().map(RepoId::parse).transpose()?;
            units.push(unit);
        }

        Ok((stacks, units))
    }
}

impl InventoryStack {
    fn into_stack(self) -> Result<Stack> {
        let address = match (self.compose_file, self.remote) {
            (Some(_), Some(_)) => {
                return Err(UpdateError::InvalidInput(format!(
                    "Stack '{}' declares both a compose file and a remote host",
                    self.name
                )));
            }
            (Some(path), None) => Some(StackAddress::File(PathValidator::validate_config_path(path)?)),
            (None, Some(remote)) => Some(StackAddress::Remote(remote)),
            (None, None) => None,
        };

        Ok(Stack {
            id: self.id,
            name: self.name,
            address,
        })
    }
}
