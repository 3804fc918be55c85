//! Per-step `CIRRUS_ENV` scratch file.
//!
//! Each step receives a fresh temp file it may append `KEY=VALUE` lines to;
//! the dispatcher parses the file at step end and merges the result back
//! into the task environment. The file is deleted when the handle drops.

use std::collections::HashMap;
use std::path::Path;

use tempfile::TempPath;

use crate::errors::{Error, Result};

pub struct CirrusEnv {
    path: TempPath,
}

impl CirrusEnv {
    pub fn new(task_id: i64) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(&format!("cirrus-env-{task_id}-"))
            .tempfile()
            .map_err(|e| {
                Error::file_system(std::env::temp_dir(), "create CIRRUS_ENV scratch file", e)
            })?;

        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the `KEY=VALUE` lines a step appended. Lines without a `=` are
    /// ignored.
    pub fn consume(&self) -> Result<HashMap<String, String>> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::file_system(self.path.to_path_buf(), "read", e))?;

        let mut variables = HashMap::new();
        for line in contents.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                variables.insert(key.to_string(), value.to_string());
            }
        }

        Ok(variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn consume_parses_key_value_lines() {
        let cirrus_env = CirrusEnv::new(42).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(cirrus_env.path())
            .unwrap();
        writeln!(file, "FOO=bar").unwrap();
        writeln!(file, "EMPTY=").unwrap();
        writeln!(file, "not a variable").unwrap();
        writeln!(file, "URL=https://example.com/?a=b").unwrap();

        let variables = cirrus_env.consume().unwrap();
        assert_eq!(variables.len(), 3);
        assert_eq!(variables["FOO"], "bar");
        assert_eq!(variables["EMPTY"], "");
        assert_eq!(variables["URL"], "https://example.com/?a=b");
    }

    #[test]
    fn scratch_file_is_removed_on_drop() {
        let cirrus_env = CirrusEnv::new(7).unwrap();
        let path = cirrus_env.path().to_path_buf();
        assert!(path.exists());

        drop(cirrus_env);
        assert!(!path.exists());
    }
}
