use crate::agents::analysis::{AiBackend, DisabledAi, OpenAiBackend, ReleaseAnalyzer};
use crate::agents::config_storage::{LocalFiles, StackConfigAccess};
use crate::agents::deploy_execution::ComposeExecutor;
use crate::agents::grouper::MultiContainerGrouper;
use crate::agents::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::config::Settings;
use crate::engine::{Collaborators, SweepReport, UpdateEngine};
use crate::error::{Result, UpdateError};
use crate::inventory::Inventory;
use crate::jobs::{JobHandler, JobKind, JobScheduler};
use crate::model::UnitId;
use crate::repository::{GithubClient, ReleaseLister};
use crate::store::{StateStore, Store};
use crate::version::VersionComparator;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

fn build_engine(settings: &Settings) -> Result<UpdateEngine> {
    let store: Arc<dyn Store> = Arc::new(StateStore::open(&settings.state_path)?);
    let lister: Arc<dyn ReleaseLister> = Arc::new(GithubClient::new(
        &settings.github.api_url,
        settings.github.token.clone(),
    )?);

    let ai: Arc<dyn AiBackend> = match OpenAiBackend::from_settings(&settings.ai)? {
        Some(backend) => Arc::new(backend),
        None => Arc::new(DisabledAi),
    };
    let notifier: Arc<dyn Notifier> = match &settings.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    Ok(UpdateEngine::new(Collaborators {
        store,
        lister,
        analyzer: ReleaseAnalyzer::new(ai, settings.ai.max_attempts, settings.ai.chunk_chars),
        security_scan: settings.scan.security,
        config: StackConfigAccess::new(Arc::new(LocalFiles), None),
        executor: Arc::new(ComposeExecutor::new(settings.compose.program.clone())),
        notifier,
    }))
}

/// Execute the import workflow
pub fn execute_import(settings: &Settings, inventory_path: &Path) -> Result<()> {
    println!("{}", "Importing container inventory...".cyan().bold());

    println!("\n{}", "1. Reading inventory...".yellow());
    let inventory = Inventory::load(inventory_path)?;
    let engine = build_engine(settings)?;
    let store = engine.store();

    let (stacks, units) = inventory.into_model(&store.units()?)?;
    println!("   Found {} stack(s) and {} unit(s)", stacks.len(), units.len());
    store.import(stacks, units)?;
    println!("{}", "✓ Inventory stored".green());

    println!("\n{}", "2. Discovering source repositories...".yellow());
    let attached = engine.resolve_repositories(&mut |line| println!("   {}", line.dimmed()))?;
    println!("{}", format!("✓ Attached {attached} repository link(s)").green());

    println!("\n{}", "3. Grouping composite applications...".yellow());
    let apps = MultiContainerGrouper::assign(store.as_ref())?;
    for app in &apps {
        println!(
            "   • {} ({} units)",
            app.name.bright_cyan(),
            app.unit_ids.len()
        );
    }

    println!("\n{}", "✨ Import completed successfully!".green().bold());
    Ok(())
}

/// Execute the check workflow
pub fn execute_check(settings: &Settings) -> Result<()> {
    println!("{}", "Checking for upstream releases...".cyan().bold());
    let engine = build_engine(settings)?;

    let groups = engine.sweep_groups()?;
    println!(
        "\n{}",
        format!("1. Checking {} repository group(s)...", groups.len()).yellow()
    );

    let pb = ProgressBar::new(groups.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{bar:40}] {pos}/{len} {msg}")
            .map_err(|e| UpdateError::Config(format!("Invalid progress template: {e}")))?
            .progress_chars("=>-"),
    );

    let mut report = SweepReport::default();
    let mut lines = Vec::new();
    for group in &groups {
        pb.set_message(format!("Checking {}", group.repo));
        let outcome = engine.check_group(group);
        UpdateEngine::record_group(&mut report, group, outcome, &mut |line| lines.push(line.to_string()));
        pb.inc(1);
    }
    pb.finish_and_clear();

    engine.finish_sweep(&report, &mut |line| lines.push(line.to_string()))?;
    for line in &lines {
        println!("   {}", line.dimmed());
    }
    println!("{}", "✓ Check completed".green());

    print_pending(engine.store().as_ref(), false)
}

/// Execute the list workflow - display tracked units and pending versions
pub fn execute_list(settings: &Settings, include_unstable: bool) -> Result<()> {
    let store = StateStore::open(&settings.state_path)?;
    print_pending(&store, include_unstable)
}

fn print_pending(store: &dyn Store, include_unstable: bool) -> Result<()> {
    let stacks = store.stacks()?;
    if stacks.is_empty() {
        println!("\n{}", "No stacks imported yet. Run `stackbump import` first.".yellow());
        return Ok(());
    }

    let mut pending_total = 0;
    for stack in stacks {
        println!("\n{} {}", "Stack".cyan().bold(), stack.name.white().bold());
        for unit in store.units_in_stack(stack.id)? {
            let mut candidates: Vec<_> = store
                .candidates_for(unit.id)?
                .into_iter()
                .filter(|c| !c.ignored && (include_unstable || !c.prerelease))
                .collect();
            candidates.sort_by(|a, b| {
                VersionComparator::compare(&a.version, &b.version).unwrap_or(std::cmp::Ordering::Equal)
            });
            pending_total += candidates.len();

            let repo = unit
                .effective_repo()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no repository".to_string());
            println!(
                "  • [{}] {} {} ({})",
                unit.id,
                unit.name.white().bold(),
                unit.version.as_deref().unwrap_or("?").red(),
                repo.dimmed()
            );

            for candidate in candidates {
                let mut flags = Vec::new();
                if candidate.prerelease {
                    flags.push("pre-release".yellow().to_string());
                }
                if candidate.is_breaking() {
                    flags.push("breaking".red().bold().to_string());
                }
                if candidate.suspected_malicious == Some(true) {
                    flags.push("suspected malicious".on_red().to_string());
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                };
                println!("      → {}{}", candidate.version.green().bold(), flags);
                if let Some(summary) = &candidate.ai_summary {
                    println!("        {}", summary.dimmed());
                }
            }
        }
    }

    if pending_total == 0 {
        println!("\n{}", "✨ Everything is up to date!".green().bold());
    } else {
        println!("\n{}", "To apply an update, run:".dimmed());
        println!("  {}", "stackbump update <unit> [--to <version>]".cyan());
    }
    Ok(())
}

/// Execute the update workflow
pub fn execute_update(settings: &Settings, unit_id: UnitId, to: Option<String>) -> Result<()> {
    let engine = build_engine(settings)?;
    let store = engine.store();

    let unit = store
        .unit(unit_id)?
        .ok_or_else(|| UpdateError::InvalidInput(format!("Unknown unit {unit_id}")))?;

    let pinned = to.is_some();
    let version = match to {
        Some(version) => version,
        None => {
            let candidates = store.candidates_for(unit_id)?;
            VersionComparator::newest(
                candidates
                    .iter()
                    .filter(|c| !c.ignored && !c.prerelease)
                    .map(|c| c.version.as_str()),
            )
            .map(str::to_string)
            .ok_or_else(|| {
                UpdateError::InvalidInput(format!("No pending stable version for '{}'", unit.name))
            })?
        }
    };

    println!(
        "{}",
        format!(
            "Updating {} from {} to {}...",
            unit.name,
            unit.version.as_deref().unwrap_or("?"),
            version
        )
        .cyan()
        .bold()
    );
    run_jobs(
        engine,
        vec![JobKind::Update {
            unit_id,
            version,
            pinned,
        }],
    )
}

/// Execute the restart workflow
pub fn execute_restart(settings: &Settings, stack_id: u64) -> Result<()> {
    println!("{}", format!("Restarting stack {stack_id}...").cyan().bold());
    run_jobs(build_engine(settings)?, vec![JobKind::RestartStack { stack_id }])
}

/// Execute the reset workflow
pub fn execute_reset(settings: &Settings) -> Result<()> {
    println!("{}", "Resetting discovered state...".cyan().bold());
    run_jobs(build_engine(settings)?, vec![JobKind::ResetAll])
}

/// Run the job worker, enqueueing a sweep on every tick.
pub fn execute_serve(settings: &Settings, max_ticks: Option<u64>) -> Result<()> {
    let interval = settings.sweep.interval();
    println!(
        "{}",
        format!("Serving, sweeping every {}s...", interval.as_secs())
            .cyan()
            .bold()
    );

    let engine = Arc::new(build_engine(settings)?);
    let scheduler = JobScheduler::start(engine)?;
    scheduler.submit(JobKind::CheckAllForUpdates)?;

    let ticker = crossbeam_channel::tick(interval);
    let mut ticks = 0;
    while max_ticks.is_none_or(|max| ticks < max) {
        ticker
            .recv()
            .map_err(|e| UpdateError::InvalidInput(format!("Sweep timer stopped: {e}")))?;
        ticks += 1;

        let already_queued = scheduler
            .registry()
            .snapshot()
            .iter()
            .any(|job| job.kind == JobKind::CheckAllForUpdates && !job.processing);
        if already_queued {
            debug!(tick = ticks, "sweep still queued, not adding another");
        } else {
            scheduler.submit(JobKind::CheckAllForUpdates)?;
        }
        debug!(jobs = %scheduler.registry().snapshot_json()?, "job queue");
    }

    scheduler.drain();
    println!("\n{}", "✨ Worker stopped".green().bold());
    Ok(())
}

/// Echoes job output to the terminal and counts failed jobs.
struct ConsoleHandler {
    engine: UpdateEngine,
    failures: AtomicUsize,
}

impl JobHandler for ConsoleHandler {
    fn handle(&self, kind: &JobKind, log: &mut dyn FnMut(&str)) -> Result<()> {
        let result = self.engine.handle(kind, &mut |line| {
            println!("   {}", line.dimmed());
            log(line);
        });
        if let Err(err) = &result {
            self.failures.fetch_add(1, Ordering::SeqCst);
            println!("{} {}", "✗".red().bold(), err.to_string().red());
        }
        result
    }
}

fn run_jobs(engine: UpdateEngine, kinds: Vec<JobKind>) -> Result<()> {
    let handler = Arc::new(ConsoleHandler {
        engine,
        failures: AtomicUsize::new(0),
    });
    let scheduler = JobScheduler::start(handler.clone())?;

    for kind in kinds {
        let seq = scheduler.submit(kind.clone())?;
        debug!(seq, %kind, "job submitted");
    }
    scheduler.drain();

    match handler.failures.load(Ordering::SeqCst) {
        0 => {
            println!("\n{}", "✨ Done!".green().bold());
            Ok(())
        }
        failed => Err(UpdateError::Deployment(format!("{failed} job(s) failed"))),
    }
}
