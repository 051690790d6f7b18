use crate::error::{Result, UpdateError};
use std::path::{Component, Path, PathBuf};

const FORBIDDEN: &[&str] = &["/etc", "/sys", "/proc", "/dev", "/boot"];

/// Lexical path checks for stack configuration files.
///
/// Paths are never canonicalised: configuration may be served by a non-local
/// `ConfigFiles` implementation, so only the path text is inspected.
pub struct PathValidator;

impl PathValidator {
    /// Validates a compose file path taken from an imported inventory.
    pub fn validate_config_path(path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        if !path.is_absolute() {
            return Err(UpdateError::InvalidInput(format!(
                "Configuration path '{}' must be absolute",
                path.display()
            )));
        }

        let normalized = normalize(path)?;

        for forbidden in FORBIDDEN {
            if normalized.starts_with(forbidden) {
                return Err(UpdateError::InvalidInput(format!(
                    "Access to system directory '{forbidden}' is not allowed"
                )));
            }
        }

        Ok(normalized)
    }

    /// Ensures the file path resides inside the provided base directory.
    pub fn validate_file_path(file_path: impl AsRef<Path>, base_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let file = normalize(file_path.as_ref())?;
        let base = normalize(base_dir.as_ref())?;

        if file == base || !file.starts_with(&base) {
            return Err(UpdateError::InvalidInput(format!(
                "File path '{}' is outside '{}'",
                file.display(),
                base.display()
            )));
        }

        Ok(file)
    }
}

/// Drop `.` components; refuse `..` outright.
fn normalize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(UpdateError::InvalidInput(format!(
                    "Path '{}' must not contain '..'",
                    path.display()
                )));
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_accepts_stack_directory() {
        let path = PathValidator::validate_config_path("/srv/./media/compose.yml").unwrap();
        assert_eq!(path, PathBuf::from("/srv/media/compose.yml"));
    }

    #[test]
    fn config_path_rejects_relative_and_system_paths() {
        assert!(PathValidator::validate_config_path("media/compose.yml").is_err());
        assert!(PathValidator::validate_config_path("/etc/compose.yml").is_err());
        assert!(PathValidator::validate_config_path("/srv/../proc/compose.yml").is_err());
    }

    #[test]
    fn validate_file_path_rejects_traversal() {
        assert!(PathValidator::validate_file_path("/srv/media/.env", "/srv/media").is_ok());
        assert!(PathValidator::validate_file_path("/srv/media/../.env", "/srv/media").is_err());
        assert!(PathValidator::validate_file_path("/tmp/.env", "/srv/media").is_err());
        assert!(PathValidator::validate_file_path("/srv/media", "/srv/media").is_err());
    }
}
