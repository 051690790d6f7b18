use crate::error::{Result, UpdateError};
use crate::model::Stack;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeCommand {
    Pull,
    Down,
    Up,
    Restart,
}

impl ComposeCommand {
    fn args(self) -> &'static [&'static str] {
        match self {
            ComposeCommand::Pull => &["pull"],
            ComposeCommand::Down => &["down"],
            ComposeCommand::Up => &["up", "-d"],
            ComposeCommand::Restart => &["restart"],
        }
    }
}

impl fmt::Display for ComposeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComposeCommand::Pull => "pull",
            ComposeCommand::Down => "down",
            ComposeCommand::Up => "up",
            ComposeCommand::Restart => "restart",
        };
        f.write_str(label)
    }
}

/// Runs compose subcommands for a stack. Success is the absence of an error; output
/// is streamed line by line.
pub trait DeploymentExecutor: Send + Sync {
    fn run(&self, stack: &Stack, command: ComposeCommand, on_line: &mut dyn FnMut(&str)) -> Result<()>;

    /// How `command` reads in plan steps and job output.
    fn describe(&self, command: ComposeCommand) -> String {
        format!("docker compose {command}")
    }
}

/// `docker compose` (or a compatible program) against the stack's compose file.
pub struct ComposeExecutor {
    program: String,
}

impl ComposeExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(compose_file: &Path, command: ComposeCommand) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            compose_file.display().to_string(),
        ];
        if let Some(dir) = compose_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            args.push("--project-directory".to_string());
            args.push(dir.display().to_string());
        }
        args.extend(command.args().iter().map(|a| a.to_string()));
        args
    }
}

impl DeploymentExecutor for ComposeExecutor {
    /// Execute a compose command with live output streaming.
    fn run(&self, stack: &Stack, command: ComposeCommand, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        let compose_file = stack.config_path().ok_or_else(|| {
            UpdateError::Deployment(format!(
                "Stack '{}' is not file-addressed; cannot run {command}",
                stack.name
            ))
        })?;

        let args = Self::build_args(compose_file, command);
        info!(stack = %stack.name, %command, "running compose");
        debug!(program = %self.program, args = ?args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| UpdateError::Deployment(format!("Failed to spawn {}: {e}", self.program)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = crossbeam_channel::unbounded::<String>();

        thread::scope(|scope| {
            for stream in [
                stdout.map(|s| Box::new(s) as Box<dyn Read + Send>),
                stderr.map(|s| Box::new(s) as Box<dyn Read + Send>),
            ]
            .into_iter()
            .flatten()
            {
                let tx = tx.clone();
                scope.spawn(move || {
                    for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for line in rx.iter() {
                on_line(&line);
            }
        });

        let status = child
            .wait()
            .map_err(|e| UpdateError::Deployment(format!("Failed to wait for {}: {e}", self.program)))?;

        if !status.success() {
            return Err(UpdateError::Deployment(format!(
                "compose {command} for '{}' failed with exit code {}",
                stack.name,
                status.code().unwrap_or(-1)
            )));
        }

        Ok(())
    }

    fn describe(&self, command: ComposeCommand) -> String {
        format!("{} compose {command}", self.program)
    }
}
