//! Loading of the API spec (`apispec.json`).
//!
//! The API spec is read once at startup. Relative executable/invoker paths are
//! resolved against the directory containing `apispec.json`, and the
//! declarations are checked so that every executable can be planned.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::core::spec::ApiSpec;

/// Load, resolve and validate the API spec at `path`.
pub fn load_api_spec(path: &Path) -> Result<ApiSpec> {
    debug!(path = %path.display(), "loading api spec");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read api spec {}", path.display()))?;
    let mut spec: ApiSpec = serde_json::from_str(&contents)
        .with_context(|| format!("parse api spec {}", path.display()))?;

    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let base = std::path::absolute(parent)
        .with_context(|| format!("resolve directory of api spec {}", path.display()))?;
    for exe in spec.executables.values_mut() {
        exe.path = resolve_path(&base, &exe.path);
    }
    for invoker in spec.invokers.values_mut() {
        invoker.path = resolve_path(&base, &invoker.path);
    }

    validate_api_spec(&spec)?;
    info!(
        executables = spec.executables.len(),
        invokers = spec.invokers.len(),
        "api spec loaded"
    );
    Ok(spec)
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Check that every declaration can be executed.
pub fn validate_api_spec(spec: &ApiSpec) -> Result<()> {
    let mut errors = Vec::new();
    for (name, invoker) in &spec.invokers {
        if invoker.command.first().is_none_or(|program| program.trim().is_empty()) {
            errors.push(format!("invoker '{}' must declare a non-empty command", name));
        }
    }
    for (name, exe) in &spec.executables {
        match (&exe.invoker_name, exe.command.is_empty()) {
            (_, false) => {
                if exe.command[0].trim().is_empty() {
                    errors.push(format!("executable '{}' has an empty program", name));
                }
            }
            (Some(invoker), true) if !spec.invokers.contains_key(invoker) => errors.push(format!(
                "executable '{}' references unknown invoker '{}'",
                name, invoker
            )),
            (Some(_), true) => {}
            (None, true) => errors.push(format!(
                "executable '{}' must declare a command or an invoker_name",
                name
            )),
        }
    }
    if errors.is_empty() {
        return Ok(());
    }
    bail!("api spec invalid:\n- {}", errors.join("\n- "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CollectionKey;

    #[test]
    fn relative_paths_resolve_against_spec_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("apispec.json");
        fs::write(
            &path,
            r#"{
                "executables": { "hello": { "path": "executables/hello", "command": ["./hello"] } },
                "invokers": { "sh": { "path": "/opt/sh", "command": ["sh", "run.sh"] } }
            }"#,
        )
        .expect("write spec");

        let spec = load_api_spec(&path).expect("load");
        assert_eq!(
            spec.executables["hello"].path,
            temp.path().join("executables/hello")
        );
        assert_eq!(spec.invokers["sh"].path, PathBuf::from("/opt/sh"));
        assert!(spec.contains(&CollectionKey::executable("hello")));
    }

    /// A spec named by a relative path still yields absolute working directories.
    #[test]
    fn relative_spec_path_resolves_to_absolute_dirs() {
        let cwd = std::env::current_dir().expect("cwd");
        let temp = tempfile::tempdir_in(&cwd).expect("tempdir");
        let relative = temp
            .path()
            .strip_prefix(&cwd)
            .unwrap_or(temp.path())
            .join("apispec.json");
        assert!(relative.is_relative());
        fs::write(
            &relative,
            r#"{ "executables": { "greet": { "path": "greet", "command": ["./run.sh"] } } }"#,
        )
        .expect("write spec");

        let spec = load_api_spec(&relative).expect("load");
        let workdir = &spec.executables["greet"].path;
        assert!(workdir.is_absolute());
        assert_eq!(workdir, &cwd.join(&relative).with_file_name("greet"));
    }

    #[test]
    fn reports_every_broken_declaration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("apispec.json");
        fs::write(
            &path,
            r#"{
                "executables": {
                    "a": { "path": "a" },
                    "b": { "path": "b", "invoker_name": "ghost" }
                },
                "invokers": { "c": { "path": "c", "command": [] } }
            }"#,
        )
        .expect("write spec");

        let err = load_api_spec(&path).expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("invoker 'c' must declare a non-empty command"));
        assert!(message.contains("executable 'a' must declare a command or an invoker_name"));
        assert!(message.contains("unknown invoker 'ghost'"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_api_spec(&temp.path().join("missing.json")).expect_err("missing");
        assert!(err.to_string().contains("read api spec"));
    }
}
