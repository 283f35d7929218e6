//! Mapping of raw process output into named, typed result fields.
//!
//! Mapping runs in two phases. Phase one resolves every declared field from
//! the `stdout`/`stderr` placeholders, files or literals while recording which
//! placeholders were claimed. Phase two drops the claimed placeholders, so any
//! number of fields may read the same source.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::core::spec::{Mapping, ResultsSchema};

pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("result '{name}' is not valid JSON: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("result '{name}' could not read {}: {source}", path.display())]
    ReadFile {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Raw output placeholders before any mapping (`stdout`, `stderr`).
pub fn raw_results(stdout: &str, stderr: &str) -> Map<String, Value> {
    let mut results = Map::new();
    results.insert(STDOUT.to_string(), Value::from(stdout));
    results.insert(STDERR.to_string(), Value::from(stderr));
    results
}

/// Map process output onto the declared result schema.
///
/// `read_file` loads `file` mappings; paths are joined onto `workdir`.
pub fn map_results<F>(
    stdout: &str,
    stderr: &str,
    workdir: &Path,
    schema: &ResultsSchema,
    read_file: F,
) -> Result<Map<String, Value>, MappingError>
where
    F: Fn(&Path) -> io::Result<String>,
{
    let mut results = raw_results(stdout, stderr);
    let mut claimed_stdout = false;
    let mut claimed_stderr = false;

    for (name, spec) in schema.iter() {
        match &spec.mapping {
            Some(Mapping::Stdout) => {
                results.insert(name.to_string(), Value::from(stdout));
                claimed_stdout = true;
            }
            Some(Mapping::Stderr) => {
                results.insert(name.to_string(), Value::from(stderr));
                claimed_stderr = true;
            }
            Some(Mapping::File) => {
                let Some(file_path) = &spec.file_path else {
                    continue;
                };
                let path = workdir.join(file_path);
                let contents = read_file(&path).map_err(|source| MappingError::ReadFile {
                    name: name.to_string(),
                    path: path.clone(),
                    source,
                })?;
                results.insert(name.to_string(), Value::from(contents));
            }
            Some(Mapping::Literal(value)) => {
                if !results.contains_key(name) {
                    results.insert(name.to_string(), value.clone());
                }
            }
            None => {}
        }
    }

    // A declared field named like a placeholder owns that slot.
    if claimed_stdout && schema.get(STDOUT).is_none() {
        results.remove(STDOUT);
    }
    if claimed_stderr && schema.get(STDERR).is_none() {
        results.remove(STDERR);
    }

    for (name, spec) in schema.iter() {
        if !spec.is_structured() {
            continue;
        }
        let Some(Value::String(text)) = results.get(name) else {
            continue;
        };
        let parsed = serde_json::from_str(text).map_err(|source| MappingError::Parse {
            name: name.to_string(),
            source,
        })?;
        results.insert(name.to_string(), parsed);
    }

    Ok(results)
}
