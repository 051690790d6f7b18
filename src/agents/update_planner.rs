use crate::agents::config_storage::StackConfigAccess;
use crate::agents::deploy_execution::{ComposeCommand, DeploymentExecutor};
use crate::error::{Result, UpdateError};
use crate::model::{CandidateId, ManagedUnit, Stack, UnitId};
use crate::store::Store;
use crate::utils::path_validator::PathValidator;
use crate::version::{VersionComparator, VersionPattern};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const ENV_FILE: &str = ".env";
const ROLLOUT: [ComposeCommand; 3] = [ComposeCommand::Pull, ComposeCommand::Down, ComposeCommand::Up];

/// Concrete text change planned for a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Every literal occurrence of the old image reference is replaced.
    ConfigText { occurrences: usize, new_text: String },
    /// One `NAME=version` line of the stack's `.env` file is replaced.
    EnvLine {
        env_path: PathBuf,
        old_line: String,
        new_line: String,
        new_text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Ready,
    /// The configuration was readable but does not reference the image.
    NoMutation,
    /// The stack's configuration cannot be reached through its addressing mode.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub unit_id: UnitId,
    pub stack: Stack,
    pub target_version: String,
    pub previous_image: String,
    pub new_version: Option<String>,
    pub new_image: Option<String>,
    pub steps: Vec<String>,
    pub mutation: Option<Mutation>,
    pub status: PlanStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub new_version: String,
    pub new_image: String,
    pub updated_units: Vec<UnitId>,
    pub cleared_candidates: usize,
}

/// Turns a target version into a text patch and rolls it out.
pub struct UpdatePlanner {
    config: StackConfigAccess,
    executor: Arc<dyn DeploymentExecutor>,
    store: Arc<dyn Store>,
}

impl UpdatePlanner {
    pub fn new(config: StackConfigAccess, executor: Arc<dyn DeploymentExecutor>, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            executor,
            store,
        }
    }

    pub fn plan(&self, unit: &ManagedUnit, target_version: &str) -> Result<UpdatePlan> {
        let stack = self.store.stack(unit.stack_id)?.ok_or_else(|| {
            UpdateError::InvalidInput(format!("Unit '{}' belongs to unknown stack {}", unit.name, unit.stack_id))
        })?;

        let mut plan = UpdatePlan {
            unit_id: unit.id,
            stack: stack.clone(),
            target_version: target_version.to_string(),
            previous_image: unit.image.clone(),
            new_version: None,
            new_image: None,
            steps: Vec::new(),
            mutation: None,
            status: PlanStatus::Unavailable,
        };

        let Some(text) = self.config.load(&stack)? else {
            plan.steps
                .push(format!("Configuration of stack '{}' is unavailable", stack.name));
            return Ok(plan);
        };
        plan.steps.push(format!("Load configuration of stack '{}'", stack.name));

        let image = unit.image_ref();
        let occurrences = text.matches(unit.image.as_str()).count();

        if occurrences > 0 {
            let new_version = self.synthesize_for(unit, target_version)?;
            let new_image = image.with_tag(&new_version);
            plan.steps.push(format!(
                "Replace {occurrences} occurrence(s) of {} with {new_image}",
                unit.image
            ));
            plan.mutation = Some(Mutation::ConfigText {
                occurrences,
                new_text: text.replace(unit.image.as_str(), &new_image),
            });
            plan.new_version = Some(new_version);
            plan.new_image = Some(new_image);
        } else if let Some(variable) = find_env_reference(&text, &image.repository)? {
            debug!(unit = %unit.name, variable, "image tag is interpolated");
            if let Some((env_path, env_text)) = self.load_env_file(&stack)? {
                let current = unit.version.as_deref().unwrap_or_default();
                if let Some(old_line) = find_env_line(&env_text, &variable, current) {
                    let new_version = self.synthesize_for(unit, target_version)?;
                    let new_line = rewrite_env_line(&old_line, current, &new_version);
                    plan.steps.push(format!(
                        "Set {variable} to {new_version} in {}",
                        env_path.display()
                    ));
                    plan.mutation = Some(Mutation::EnvLine {
                        new_text: replace_line(&env_text, &old_line, &new_line),
                        env_path,
                        old_line,
                        new_line,
                    });
                    plan.new_image = Some(image.with_tag(&new_version));
                    plan.new_version = Some(new_version);
                }
            }
        }

        match &plan.mutation {
            Some(_) => {
                plan.status = PlanStatus::Ready;
                if stack.is_file_addressed() {
                    plan.steps
                        .extend(ROLLOUT.iter().map(|cmd| self.executor.describe(*cmd)));
                }
                plan.steps.push(format!(
                    "Record {target_version} on '{}' and sibling units sharing {}",
                    unit.name, unit.image
                ));
            }
            None => {
                plan.status = PlanStatus::NoMutation;
                plan.steps
                    .push(format!("No reference to {} found in the configuration", unit.image));
            }
        }

        Ok(plan)
    }

    fn synthesize_for(&self, unit: &ManagedUnit, target_version: &str) -> Result<String> {
        let current = unit.version.as_deref().ok_or_else(|| UpdateError::PatchSynthesis {
            current: String::new(),
            target: target_version.to_string(),
        })?;
        let shape = unit.version_pattern()?;
        let upstream = match unit.upstream_pattern()? {
            Some(pattern) => Some(pattern),
            None => Some(VersionPattern::build(target_version)?),
        };
        synthesize_version(current, shape.as_ref(), upstream.as_ref(), target_version)
    }

    fn load_env_file(&self, stack: &Stack) -> Result<Option<(PathBuf, String)>> {
        let Some(config_path) = stack.config_path() else {
            return Ok(None);
        };
        let Some(stack_dir) = config_path.parent() else {
            return Ok(None);
        };
        let env_path = PathValidator::validate_file_path(stack_dir.join(ENV_FILE), stack_dir)?;
        let files = self.config.files();
        if !files.exists(&env_path) {
            return Ok(None);
        }
        Ok(Some((env_path.clone(), files.read_text(&env_path)?)))
    }

    /// Write the mutation, roll the stack and commit the new baseline on the unit
    /// and every sibling sharing its pre-update image.
    pub fn apply(&self, plan: &UpdatePlan, on_line: &mut dyn FnMut(&str)) -> Result<Option<AppliedUpdate>> {
        let (Some(mutation), Some(new_version), Some(new_image)) =
            (&plan.mutation, &plan.new_version, &plan.new_image)
        else {
            return Ok(None);
        };

        match mutation {
            Mutation::ConfigText { new_text, occurrences } => {
                self.config.store(&plan.stack, new_text)?;
                on_line(&format!("Rewrote {occurrences} image reference(s) in '{}'", plan.stack.name));
            }
            Mutation::EnvLine {
                env_path,
                new_line,
                new_text,
                ..
            } => {
                self.config.files().write_text(env_path, new_text)?;
                on_line(&format!("Wrote '{new_line}' to {}", env_path.display()));
            }
        }

        if plan.stack.is_file_addressed() {
            for command in ROLLOUT {
                on_line(&format!("$ {}", self.executor.describe(command)));
                self.executor.run(&plan.stack, command, on_line)?;
            }
        }

        let applied = self.propagate(plan, new_version, new_image)?;
        info!(
            stack = %plan.stack.name,
            version = %new_version,
            units = applied.updated_units.len(),
            cleared = applied.cleared_candidates,
            "update applied"
        );
        Ok(Some(applied))
    }

    fn propagate(&self, plan: &UpdatePlan, new_version: &str, new_image: &str) -> Result<AppliedUpdate> {
        let mut updated_units = Vec::new();
        let mut cleared_candidates = 0;

        for mut unit in self.store.units_in_stack(plan.stack.id)? {
            if unit.id != plan.unit_id && unit.image != plan.previous_image {
                continue;
            }

            unit.commit_version(new_version, new_image)?;
            self.store.save_unit(&unit)?;

            let stale: Vec<CandidateId> = self
                .store
                .candidates_for(unit.id)?
                .into_iter()
                .filter(|c| !VersionComparator::is_newer(&c.version, &plan.target_version))
                .map(|c| c.id)
                .collect();
            cleared_candidates += stale.len();
            self.store.unlink_candidates(unit.id, &stale)?;

            updated_units.push(unit.id);
        }

        Ok(AppliedUpdate {
            new_version: new_version.to_string(),
            new_image: new_image.to_string(),
            updated_units,
            cleared_candidates,
        })
    }
}

/// Derive the version string to deploy for `target`, keeping the convention of the
/// string in use.
///
/// First the upstream convention is located inside `current` (with and without its
/// `v` prefix) and the new tag is spliced in at that spot. Failing that, the unit's
/// own version shape is located inside `target` and that capture replaces the
/// current version. If neither direction matches, no guess is made.
pub fn synthesize_version(
    current: &str,
    shape: Option<&VersionPattern>,
    upstream: Option<&VersionPattern>,
    target: &str,
) -> Result<String> {
    let stripped_target = target.strip_prefix('v').unwrap_or(target);

    if let Some(upstream) = upstream {
        let variants = std::iter::once(upstream.clone()).chain(upstream.without_v_prefix());
        for pattern in variants {
            if let Some(found) = pattern.find(current) {
                let replacement = if found.as_str().starts_with('v') {
                    format!("v{stripped_target}")
                } else {
                    stripped_target.to_string()
                };
                return Ok(splice(current, found.start(), found.end(), &replacement));
            }
        }
    }

    if let Some(shape) = shape {
        if let (Some(in_target), Some(in_current)) = (shape.find(target), shape.find(current)) {
            return Ok(splice(current, in_current.start(), in_current.end(), in_target.as_str()));
        }
    }

    Err(UpdateError::PatchSynthesis {
        current: current.to_string(),
        target: target.to_string(),
    })
}

fn splice(text: &str, start: usize, end: usize, replacement: &str) -> String {
    format!("{}{}{}", &text[..start], replacement, &text[end..])
}

/// Name of the variable in a `repository:${NAME:-default}` image reference.
fn find_env_reference(text: &str, repository: &str) -> Result<Option<String>> {
    let pattern = Regex::new(&format!(
        r"{}:\$\{{([A-Za-z_][A-Za-z0-9_]*)(?::?-[^}}]*)?\}}",
        regex::escape(repository)
    ))?;
    Ok(pattern.captures(text).map(|caps| caps[1].to_string()))
}

/// The `.env` line assigning `current` to `variable`, quoted or not.
fn find_env_line(env_text: &str, variable: &str, current: &str) -> Option<String> {
    env_text
        .lines()
        .find(|line| {
            let trimmed = line.trim();
            let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            let Some(value) = trimmed
                .strip_prefix(variable)
                .and_then(|rest| rest.trim_start().strip_prefix('='))
            else {
                return false;
            };
            let value = value.trim();
            value == current
                || value == format!("\"{current}\"")
                || value == format!("'{current}'")
        })
        .map(str::to_string)
}

fn rewrite_env_line(line: &str, current: &str, new_version: &str) -> String {
    match line.rfind(current) {
        Some(idx) => splice(line, idx, idx + current.len(), new_version),
        None => line.to_string(),
    }
}

/// Replace the first line equal to `old_line`, keeping line endings intact.
fn replace_line(text: &str, old_line: &str, new_line: &str) -> String {
    let mut out = String::with_capacity(text.len() + new_line.len());
    let mut replaced = false;

    for line in text.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        if !replaced && body == old_line.trim_end_matches('\r') {
            out.push_str(new_line.trim_end_matches('\r'));
            out.push_str(&line[body.len()..]);
            replaced = true;
        } else {
            out.push_str(line);
        }
    }
    out
}
