// src/core/paths.rs

use crate::constants::{CONFIG_DIR_NAME, DEFAULT_CONFIG_FILENAME};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    #[error("Failed to expand path '{path}': {reason}")]
    Expansion { path: String, reason: String },
}

/// Expands `~` and environment variables (`$VAR`, `${VAR}`) in a path string.
///
/// # Errors
/// Returns [`PathError::Expansion`] when a referenced variable is not set.
pub fn expand_path(raw: &str) -> Result<PathBuf, PathError> {
    let expanded = shellexpand::full(raw).map_err(|e| PathError::Expansion {
        path: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Expands `raw` and, when it is still relative, joins it onto `base`.
pub fn resolve_under(base: Option<&Path>, raw: &str) -> Result<PathBuf, PathError> {
    let expanded = expand_path(raw)?;
    match base {
        Some(base) if expanded.is_relative() => Ok(base.join(expanded)),
        _ => Ok(expanded),
    }
}

/// Returns `<config_dir>/titan/titan.yaml`, the fallback configuration location.
pub fn default_config_path() -> Result<PathBuf, PathError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(DEFAULT_CONFIG_FILENAME))
        .ok_or(PathError::ConfigDirNotFound)
}

/// The last normal component of a path, used to name list-form repositories.
pub fn last_segment(path: &Path) -> Option<String> {
    path.components().rev().find_map(|component| match component {
        std::path::Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~/work").unwrap(), home.join("work"));
    }

    #[test]
    fn test_expand_path_unknown_variable_fails() {
        let err = expand_path("$TITAN_SURELY_UNSET_VARIABLE/x").unwrap_err();
        assert!(matches!(err, PathError::Expansion { .. }));
    }

    #[test]
    fn test_resolve_under_joins_relative_only() {
        let base = Path::new("/srv/code");
        assert_eq!(
            resolve_under(Some(base), "web-app").unwrap(),
            PathBuf::from("/srv/code/web-app")
        );
        assert_eq!(
            resolve_under(Some(base), "/opt/api").unwrap(),
            PathBuf::from("/opt/api")
        );
        assert_eq!(resolve_under(None, "web").unwrap(), PathBuf::from("web"));
    }

    #[test]
    fn test_last_segment_ignores_trailing_separators() {
        assert_eq!(last_segment(Path::new("/a/b/web-app/")), Some("web-app".into()));
        assert_eq!(last_segment(Path::new("/")), None);
    }

    #[test]
    fn test_default_config_path_shape() {
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with("titan/titan.yaml"));
        }
    }
}
