use crate::error::{Result, UpdateError};
use crate::model::{CandidateId, CandidateVersion, ManagedUnit, Stack, StackId, UnitId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persistence collaborator for stacks, units and candidate versions.
pub trait Store: Send + Sync {
    fn stacks(&self) -> Result<Vec<Stack>>;
    fn stack(&self, id: StackId) -> Result<Option<Stack>>;
    fn units(&self) -> Result<Vec<ManagedUnit>>;
    fn unit(&self, id: UnitId) -> Result<Option<ManagedUnit>>;
    fn save_unit(&self, unit: &ManagedUnit) -> Result<()>;

    fn candidates(&self) -> Result<Vec<CandidateVersion>>;
    /// Insert new candidates, assigning ids. Returns them as stored.
    fn insert_candidates(&self, candidates: Vec<CandidateVersion>) -> Result<Vec<CandidateVersion>>;
    fn save_candidate(&self, candidate: &CandidateVersion) -> Result<()>;
    /// Detach `unit_id` from the given candidates; candidates left without units are dropped.
    fn unlink_candidates(&self, unit_id: UnitId, candidate_ids: &[CandidateId]) -> Result<()>;
    fn clear_candidates(&self) -> Result<()>;

    /// Replace the inventory snapshot. Candidates of units that disappeared are dropped.
    fn import(&self, stacks: Vec<Stack>, units: Vec<ManagedUnit>) -> Result<()>;
    /// Remove a stack together with its units.
    fn remove_stack(&self, id: StackId) -> Result<()>;

    fn units_in_stack(&self, stack_id: StackId) -> Result<Vec<ManagedUnit>> {
        Ok(self
            .units()?
            .into_iter()
            .filter(|u| u.stack_id == stack_id)
            .collect())
    }

    fn candidates_for(&self, unit_id: UnitId) -> Result<Vec<CandidateVersion>> {
        Ok(self
            .candidates()?
            .into_iter()
            .filter(|c| c.applies_to(unit_id))
            .collect())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    stacks: Vec<Stack>,
    units: Vec<ManagedUnit>,
    candidates: Vec<CandidateVersion>,
    next_candidate_id: CandidateId,
}

impl State {
    fn prune_orphans(&mut self) {
        let known: Vec<UnitId> = self.units.iter().map(|u| u.id).collect();
        for candidate in &mut self.candidates {
            candidate.unit_ids.retain(|id| known.contains(id));
        }
        self.candidates.retain(|c| !c.unit_ids.is_empty());
    }
}

/// State kept in memory and, when opened from a path, mirrored to a JSON file after
/// every mutation.
pub struct StateStore {
    state: RwLock<State>,
    path: Option<PathBuf>,
}

impl StateStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                UpdateError::Store(format!("Failed to parse state '{}': {e}", path.display()))
            })?
        } else {
            State::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    fn persist(&self, state: &State) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "state persisted");
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }
}

impl Store for StateStore {
    fn stacks(&self) -> Result<Vec<Stack>> {
        Ok(self.state.read().stacks.clone())
    }

    fn stack(&self, id: StackId) -> Result<Option<Stack>> {
        Ok(self.state.read().stacks.iter().find(|s| s.id == id).cloned())
    }

    fn units(&self) -> Result<Vec<ManagedUnit>> {
        Ok(self.state.read().units.clone())
    }

    fn unit(&self, id: UnitId) -> Result<Option<ManagedUnit>> {
        Ok(self.state.read().units.iter().find(|u| u.id == id).cloned())
    }

    fn save_unit(&self, unit: &ManagedUnit) -> Result<()> {
        self.mutate(|state| {
            match state.units.iter_mut().find(|u| u.id == unit.id) {
                Some(existing) => *existing = unit.clone(),
                None => state.units.push(unit.clone()),
            }
            Ok(())
        })
    }

    fn candidates(&self) -> Result<Vec<CandidateVersion>> {
        Ok(self.state.read().candidates.clone())
    }

    fn insert_candidates(&self, candidates: Vec<CandidateVersion>) -> Result<Vec<CandidateVersion>> {
        self.mutate(|state| {
            let mut stored = Vec::with_capacity(candidates.len());
            for mut candidate in candidates {
                state.next_candidate_id += 1;
                candidate.id = state.next_candidate_id;
                state.candidates.push(candidate.clone());
                stored.push(candidate);
            }
            Ok(stored)
        })
    }

    fn save_candidate(&self, candidate: &CandidateVersion) -> Result<()> {
        self.mutate(|state| {
            let existing = state
                .candidates
                .iter_mut()
                .find(|c| c.id == candidate.id)
                .ok_or_else(|| UpdateError::Store(format!("Unknown candidate {}", candidate.id)))?;
            *existing = candidate.clone();
            Ok(())
        })
    }

    fn unlink_candidates(&self, unit_id: UnitId, candidate_ids: &[CandidateId]) -> Result<()> {
        self.mutate(|state| {
            for candidate in state
                .candidates
                .iter_mut()
                .filter(|c| candidate_ids.contains(&c.id))
            {
                candidate.unit_ids.retain(|id| *id != unit_id);
            }
            state.candidates.retain(|c| !c.unit_ids.is_empty());
            Ok(())
        })
    }

    fn clear_candidates(&self) -> Result<()> {
        self.mutate(|state| {
            state.candidates.clear();
            Ok(())
        })
    }

    fn import(&self, stacks: Vec<Stack>, units: Vec<ManagedUnit>) -> Result<()> {
        for unit in &units {
            if !stacks.iter().any(|s| s.id == unit.stack_id) {
                return Err(UpdateError::InvalidInput(format!(
                    "Unit '{}' references unknown stack {}",
                    unit.name, unit.stack_id
                )));
            }
        }

        self.mutate(|state| {
            state.stacks = stacks;
            state.units = units;
            state.prune_orphans();
            Ok(())
        })
    }

    fn remove_stack(&self, id: StackId) -> Result<()> {
        self.mutate(|state| {
            state.stacks.retain(|s| s.id != id);
            state.units.retain(|u| u.stack_id != id);
            state.prune_orphans();
            Ok(())
        })
    }
}
