use crate::agents::analysis::ReleaseAnalyzer;
use crate::agents::config_storage::StackConfigAccess;
use crate::agents::deploy_execution::{ComposeCommand, DeploymentExecutor};
use crate::agents::grouper::MultiContainerGrouper;
use crate::agents::notifier::{Notifier, build_applied_message, build_update_message};
use crate::agents::update_planner::{PlanStatus, UpdatePlanner};
use crate::agents::version_resolver::VersionResolver;
use crate::error::Result;
use crate::jobs::{JobHandler, JobKind};
use crate::model::{CandidateVersion, CompositeApp, ManagedUnit, RepoId, StackId, UnitId};
use crate::repository::{ReleaseLister, RepositoryResolver};
use crate::store::Store;
use crate::version::VersionComparator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Units checked together: same repository, same current version.
#[derive(Debug, Clone)]
pub struct SweepGroup {
    pub repo: RepoId,
    pub version: Option<String>,
    pub units: Vec<ManagedUnit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub groups: usize,
    pub found: usize,
    pub rate_limited: usize,
    pub failed: usize,
}

/// Everything the engine talks to.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub lister: Arc<dyn ReleaseLister>,
    pub analyzer: ReleaseAnalyzer,
    pub security_scan: bool,
    pub config: StackConfigAccess,
    pub executor: Arc<dyn DeploymentExecutor>,
    pub notifier: Arc<dyn Notifier>,
}

/// Runs sweeps and jobs against the stored inventory.
pub struct UpdateEngine {
    store: Arc<dyn Store>,
    repositories: RepositoryResolver,
    versions: VersionResolver,
    planner: UpdatePlanner,
    executor: Arc<dyn DeploymentExecutor>,
    notifier: Arc<dyn Notifier>,
}

impl UpdateEngine {
    pub fn new(parts: Collaborators) -> Self {
        Self {
            repositories: RepositoryResolver::new(parts.lister.clone()),
            versions: VersionResolver::new(
                parts.lister,
                parts.store.clone(),
                parts.analyzer,
                parts.security_scan,
            ),
            planner: UpdatePlanner::new(parts.config, parts.executor.clone(), parts.store.clone()),
            store: parts.store,
            executor: parts.executor,
            notifier: parts.notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Discover repositories for units that have none. A rate limit stops the pass;
    /// other lookup failures only skip the unit. Returns how many units gained one.
    pub fn resolve_repositories(&self, log: &mut dyn FnMut(&str)) -> Result<usize> {
        let mut attached = 0;
        for mut unit in self.store.units()? {
            if unit.effective_repo().is_some() {
                continue;
            }
            match self.repositories.resolve_unit(&mut unit) {
                Ok(true) => {
                    self.store.save_unit(&unit)?;
                    attached += 1;
                }
                Ok(false) => debug!(unit = %unit.name, "no repository"),
                Err(err) if err.is_rate_limited() => {
                    log(&format!("Repository discovery stopped: {err}"));
                    break;
                }
                Err(err) => warn!(unit = %unit.name, error = %err, "repository discovery failed"),
            }
        }
        Ok(attached)
    }

    /// Eligible units (primary, repository attached) grouped by repository and then
    /// by current version.
    pub fn sweep_groups(&self) -> Result<Vec<SweepGroup>> {
        let mut groups: BTreeMap<(String, Option<String>), SweepGroup> = BTreeMap::new();

        for unit in self.store.units()? {
            if unit.is_secondary {
                continue;
            }
            let Some(repo) = unit.effective_repo().cloned() else {
                continue;
            };
            let key = (repo.to_string().to_lowercase(), unit.version.clone());
            groups
                .entry(key)
                .or_insert_with(|| SweepGroup {
                    repo,
                    version: unit.version.clone(),
                    units: Vec::new(),
                })
                .units
                .push(unit);
        }

        Ok(groups.into_values().collect())
    }

    /// One release listing for the whole group.
    pub fn check_group(&self, group: &SweepGroup) -> Result<Vec<CandidateVersion>> {
        match group.units.split_first() {
            Some((unit, siblings)) => self.versions.get_newer_versions(unit, siblings),
            None => Ok(Vec::new()),
        }
    }

    /// Sum up one group's outcome. Rate limits and failures skip the group only.
    pub fn record_group(
        report: &mut SweepReport,
        group: &SweepGroup,
        outcome: Result<Vec<CandidateVersion>>,
        log: &mut dyn FnMut(&str),
    ) {
        report.groups += 1;
        match outcome {
            Ok(found) => {
                if !found.is_empty() {
                    log(&format!("{}: {} new version(s)", group.repo, found.len()));
                }
                report.found += found.len();
            }
            Err(err) if err.is_rate_limited() => {
                log(&format!("{}: skipped, {err}", group.repo));
                report.rate_limited += 1;
            }
            Err(err) => {
                warn!(repo = %group.repo, error = %err, "version check failed");
                log(&format!("{}: check failed: {err}", group.repo));
                report.failed += 1;
            }
        }
    }

    pub fn check_all(&self, log: &mut dyn FnMut(&str)) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for group in self.sweep_groups()? {
            let outcome = self.check_group(&group);
            Self::record_group(&mut report, &group, outcome, log);
        }
        self.finish_sweep(&report, log)?;
        Ok(report)
    }

    /// Refresh composite apps and announce candidates nobody has been told about.
    pub fn finish_sweep(&self, report: &SweepReport, log: &mut dyn FnMut(&str)) -> Result<()> {
        info!(
            groups = report.groups,
            found = report.found,
            rate_limited = report.rate_limited,
            failed = report.failed,
            "sweep finished"
        );
        log(&format!(
            "Checked {} group(s): {} new version(s), {} rate limited, {} failed",
            report.groups, report.found, report.rate_limited, report.failed
        ));

        let apps = MultiContainerGrouper::assign(self.store.as_ref())?;
        self.notify_new(&apps)
    }

    fn notify_new(&self, apps: &[CompositeApp]) -> Result<()> {
        let units = self.store.units()?;
        let pending: Vec<CandidateVersion> = self
            .store
            .candidates()?
            .into_iter()
            .filter(|c| !c.ignored && !c.notified)
            .collect();

        let Some(message) = build_update_message(&units, apps, &pending) else {
            return Ok(());
        };

        match self.notifier.send(&message) {
            Ok(true) => {
                for mut candidate in pending {
                    candidate.notified = true;
                    self.store.save_candidate(&candidate)?;
                }
            }
            Ok(false) => warn!("notification not delivered"),
            Err(err) => warn!(error = %err, "notification failed"),
        }
        Ok(())
    }

    fn update(&self, unit_id: UnitId, version: &str, pinned: bool, log: &mut dyn FnMut(&str)) -> Result<()> {
        let Some(unit) = self.store.unit(unit_id)? else {
            warn!(unit_id, "update target no longer exists");
            log(&format!("Unit {unit_id} no longer exists"));
            return Ok(());
        };

        if !pinned && !self.is_pending(&unit, version)? {
            warn!(unit = %unit.name, version, "update target no longer pending");
            log(&format!("Version {version} no longer pending for '{}'", unit.name));
            return Ok(());
        }

        let plan = self.planner.plan(&unit, version)?;
        for step in &plan.steps {
            log(step);
        }

        match plan.status {
            PlanStatus::Unavailable => {
                log(&format!("Nothing applied to '{}': configuration unavailable", unit.name));
                Ok(())
            }
            PlanStatus::NoMutation => {
                log(&format!("Nothing applied to '{}': image not referenced", unit.name));
                Ok(())
            }
            PlanStatus::Ready => {
                if let Some(applied) = self.planner.apply(&plan, log)? {
                    log(&format!(
                        "Updated {} unit(s) to {}, cleared {} candidate link(s)",
                        applied.updated_units.len(),
                        applied.new_image,
                        applied.cleared_candidates
                    ));
                    let message = build_applied_message(
                        unit.app.as_deref().unwrap_or(&unit.name),
                        unit.version.as_deref(),
                        &applied.new_version,
                        applied.updated_units.len(),
                    );
                    match self.notifier.send(&message) {
                        Ok(true) => {}
                        Ok(false) => warn!(unit = %unit.name, "update notification not delivered"),
                        Err(err) => warn!(unit = %unit.name, error = %err, "update notification failed"),
                    }
                }
                Ok(())
            }
        }
    }

    /// A queued target still counts only while it is an open candidate of the unit
    /// and newer than what the unit runs.
    fn is_pending(&self, unit: &ManagedUnit, version: &str) -> Result<bool> {
        let open = self
            .store
            .candidates_for(unit.id)?
            .iter()
            .any(|c| !c.ignored && c.version == version);
        let newer = unit
            .version
            .as_deref()
            .is_none_or(|current| VersionComparator::is_newer(version, current));
        Ok(open && newer)
    }

    fn reset_all(&self, log: &mut dyn FnMut(&str)) -> Result<()> {
        self.store.clear_candidates()?;
        for mut unit in self.store.units()? {
            unit.upstream_pattern = None;
            unit.last_checked = None;
            self.store.save_unit(&unit)?;
        }
        log("Cleared candidates and derived patterns");

        let mut resolved = 0;
        for mut unit in self.store.units()? {
            if unit.override_repo.is_some() {
                continue;
            }
            match self.repositories.resolve_unit(&mut unit) {
                Ok(found) => {
                    self.store.save_unit(&unit)?;
                    resolved += usize::from(found);
                }
                Err(err) if err.is_rate_limited() => {
                    log(&format!("Repository discovery stopped: {err}"));
                    break;
                }
                Err(err) => warn!(unit = %unit.name, error = %err, "repository discovery failed"),
            }
        }
        log(&format!("Repositories known for {resolved} unit(s)"));

        self.check_all(log).map(|_| ())
    }

    fn restart_stack(&self, stack_id: StackId, log: &mut dyn FnMut(&str)) -> Result<()> {
        let Some(stack) = self.store.stack(stack_id)? else {
            warn!(stack_id, "restart target no longer exists");
            log(&format!("Stack {stack_id} no longer exists"));
            return Ok(());
        };

        if !stack.is_file_addressed() {
            log(&format!("Restart is not supported for remote stack '{}'", stack.name));
            return Ok(());
        }

        self.executor.run(&stack, ComposeCommand::Restart, log)?;
        log(&format!("Restarted stack '{}'", stack.name));
        Ok(())
    }
}

impl JobHandler for UpdateEngine {
    fn handle(&self, kind: &JobKind, log: &mut dyn FnMut(&str)) -> Result<()> {
        match kind {
            JobKind::Update {
                unit_id,
                version,
                pinned,
            } => self.update(*unit_id, version, *pinned, log),
            JobKind::ResetAll => self.reset_all(log),
            JobKind::CheckAllForUpdates => self.check_all(log).map(|_| ()),
            JobKind::RestartStack { stack_id } => self.restart_stack(*stack_id, log),
        }
    }
}
