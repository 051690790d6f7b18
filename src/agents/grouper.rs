use crate::error::Result;
use crate::model::{CompositeApp, ManagedUnit};
use crate::store::Store;
use std::collections::BTreeMap;
use tracing::debug;

const MIN_PREFIX_LEN: usize = 3;

/// Groups sibling units of a stack into composite applications.
///
/// Two units of the same stack belong together when they share an effective
/// repository or a name prefix (`immich-server` and `immich_ml` share `immich`).
/// The relation is closed transitively.
pub struct MultiContainerGrouper;

impl MultiContainerGrouper {
    pub fn group(units: &[ManagedUnit]) -> Vec<CompositeApp> {
        let mut by_stack: BTreeMap<u64, Vec<&ManagedUnit>> = BTreeMap::new();
        for unit in units {
            by_stack.entry(unit.stack_id).or_default().push(unit);
        }

        let mut apps = Vec::new();
        for (stack_id, members) in by_stack {
            let mut sets = DisjointSets::new(members.len());
            for i in 0..members.len() {
                for j in i + 1..members.len() {
                    if related(members[i], members[j]) {
                        sets.union(i, j);
                    }
                }
            }

            let mut groups: BTreeMap<usize, Vec<&ManagedUnit>> = BTreeMap::new();
            for (idx, unit) in members.iter().enumerate() {
                groups.entry(sets.find(idx)).or_default().push(*unit);
            }

            for group in groups.into_values().filter(|g| g.len() > 1) {
                apps.push(CompositeApp {
                    name: app_name(&group),
                    stack_id,
                    unit_ids: group.iter().map(|u| u.id).collect(),
                });
            }
        }

        apps.sort_by(|a, b| (a.stack_id, &a.name).cmp(&(b.stack_id, &b.name)));
        apps
    }

    /// Recompute groupings and stamp `app` on every unit whose membership changed.
    pub fn assign(store: &dyn Store) -> Result<Vec<CompositeApp>> {
        let units = store.units()?;
        let apps = Self::group(&units);

        for mut unit in units {
            let app = apps
                .iter()
                .find(|a| a.unit_ids.contains(&unit.id))
                .map(|a| a.name.clone());
            if unit.app != app {
                debug!(unit = %unit.name, app = ?app, "composite app changed");
                unit.app = app;
                store.save_unit(&unit)?;
            }
        }

        Ok(apps)
    }
}

fn name_prefix(name: &str) -> Option<&str> {
    let idx = name.find(['-', '_'])?;
    let prefix = &name[..idx];
    (prefix.chars().count() >= MIN_PREFIX_LEN).then_some(prefix)
}

fn related(a: &ManagedUnit, b: &ManagedUnit) -> bool {
    if let (Some(ra), Some(rb)) = (a.effective_repo(), b.effective_repo()) {
        if ra.same_as(rb) {
            return true;
        }
    }
    matches!(
        (name_prefix(&a.name), name_prefix(&b.name)),
        (Some(pa), Some(pb)) if pa.eq_ignore_ascii_case(pb)
    )
}

/// The common name prefix when every member has it, otherwise the shared
/// repository name, otherwise the first member's name.
fn app_name(group: &[&ManagedUnit]) -> String {
    let first_prefix = group.iter().find_map(|u| name_prefix(&u.name));
    if let Some(prefix) = first_prefix {
        let shared = group
            .iter()
            .all(|u| name_prefix(&u.name).is_some_and(|p| p.eq_ignore_ascii_case(prefix)));
        if shared {
            return prefix.to_lowercase();
        }
    }

    group
        .iter()
        .find_map(|u| u.effective_repo().map(|r| r.name.to_lowercase()))
        .unwrap_or_else(|| group[0].name.clone())
}

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}
