use std::env;
use std::path::{Path, PathBuf};

/// Failure to turn an executable name into an absolute path.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("executable name is blank")]
    BlankName,
    #[error("could not resolve '{name}' to an existing file")]
    NotFound { name: String },
}

/// Resolve an executable name to an absolute path.
///
/// Names containing a path separator are checked directly (relative ones
/// against the current directory). Bare names are searched for in each entry
/// of the `PATH` environment variable, in order, first existing file wins.
pub fn resolve_executable(name: &str) -> Result<PathBuf, ResolveError> {
    if name.trim().is_empty() {
        return Err(ResolveError::BlankName);
    }

    let candidate = Path::new(name);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(ResolveError::NotFound {
            name: name.to_string(),
        });
    }

    for root in search_roots() {
        let path = root.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(ResolveError::NotFound {
        name: name.to_string(),
    })
}

fn search_roots() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_common_tool_from_path() {
        let resolved = resolve_executable("sh").expect("sh should be on PATH");
        assert!(resolved.is_absolute());
        assert!(resolved.is_file());
    }

    #[test]
    fn absolute_path_passes_through_when_present() {
        let sh = resolve_executable("sh").unwrap();
        let again = resolve_executable(sh.to_str().unwrap()).unwrap();
        assert_eq!(sh, again);
    }

    #[test]
    fn blank_name_is_rejected() {
        assert!(matches!(
            resolve_executable("   "),
            Err(ResolveError::BlankName)
        ));
    }

    #[test]
    fn missing_tool_reports_name() {
        let err = resolve_executable("definitely_not_a_real_tool_xyz").unwrap_err();
        assert!(err.to_string().contains("definitely_not_a_real_tool_xyz"));
    }

    #[test]
    fn missing_absolute_path_is_not_found() {
        assert!(matches!(
            resolve_executable("/no/such/dir/tool"),
            Err(ResolveError::NotFound { .. })
        ));
    }
}
