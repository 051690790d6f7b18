use crate::error::{Result, UpdateError};
use crate::model::{Stack, StackAddress};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// File-based configuration access.
pub trait ConfigFiles: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read_text(&self, path: &Path) -> Result<String>;
    fn write_text(&self, path: &Path, text: &str) -> Result<()>;
}

/// Stacks whose compose file is held by a remote management host.
pub trait RemoteStackHost: Send + Sync {
    fn get_stack_content(&self, name: &str) -> Result<String>;
    /// Returns whether the host accepted the new content.
    fn update_stack_content(&self, name: &str, text: &str) -> Result<bool>;
}

/// Plain local filesystem.
pub struct LocalFiles;

impl ConfigFiles for LocalFiles {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_text(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| {
            UpdateError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read '{}': {e}", path.display()),
            ))
        })
    }

    fn write_text(&self, path: &Path, text: &str) -> Result<()> {
        fs::write(path, text).map_err(|e| {
            UpdateError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write '{}': {e}", path.display()),
            ))
        })
    }
}

/// Reads and writes a stack's configuration through whichever addressing mode the
/// stack uses.
#[derive(Clone)]
pub struct StackConfigAccess {
    files: Arc<dyn ConfigFiles>,
    remote: Option<Arc<dyn RemoteStackHost>>,
}

impl StackConfigAccess {
    pub fn new(files: Arc<dyn ConfigFiles>, remote: Option<Arc<dyn RemoteStackHost>>) -> Self {
        Self { files, remote }
    }

    pub fn files(&self) -> &dyn ConfigFiles {
        self.files.as_ref()
    }

    /// `None` when the stack's addressing mode cannot be used.
    pub fn load(&self, stack: &Stack) -> Result<Option<String>> {
        match &stack.address {
            Some(StackAddress::File(path)) if self.files.exists(path) => {
                self.files.read_text(path).map(Some)
            }
            Some(StackAddress::Remote(name)) => match &self.remote {
                Some(remote) => remote.get_stack_content(name).map(Some),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    pub fn store(&self, stack: &Stack, text: &str) -> Result<()> {
        match &stack.address {
            Some(StackAddress::File(path)) => self.files.write_text(path, text),
            Some(StackAddress::Remote(name)) => {
                let remote = self.remote.as_ref().ok_or_else(|| {
                    UpdateError::Config(format!("No remote host configured for stack '{}'", stack.name))
                })?;
                if remote.update_stack_content(name, text)? {
                    Ok(())
                } else {
                    Err(UpdateError::Deployment(format!(
                        "Remote host rejected the update of stack '{name}'"
                    )))
                }
            }
            None => Err(UpdateError::Config(format!(
                "Stack '{}' has no configuration source",
                stack.name
            ))),
        }
    }
}
