//! Artifact upload through the HTTP cache host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSetBuilder};

use crate::api;
use crate::environment::Environment;
use crate::logs::LogUploader;

fn matching_files(base: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
        builder.add(glob);
    }
    let globs = builder.build().map_err(|e| e.to_string())?;

    let mut matches = Vec::new();
    let mut pending = vec![base.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                let relative = path.strip_prefix(base).unwrap_or(&path);
                if globs.is_match(relative) {
                    matches.push(path);
                }
            }
        }
    }
    matches.sort();
    Ok(matches)
}

/// Upload every file matching the instruction's patterns. Patterns are
/// expanded against the task environment and matched relative to the
/// working directory.
pub async fn upload_artifacts(
    uploader: Arc<LogUploader>,
    task_id: i64,
    command_name: &str,
    cache_host: &str,
    instruction: &api::ArtifactsInstruction,
    env: &Environment,
) -> bool {
    let base = PathBuf::from(env.get("CIRRUS_WORKING_DIR"));
    let patterns: Vec<String> = instruction
        .paths
        .iter()
        .map(|pattern| env.expand_text(pattern))
        .collect();

    let files = match matching_files(&base, &patterns) {
        Ok(files) => files,
        Err(message) => {
            uploader.write_line(format!("Failed to match artifact paths: {message}!"));
            return false;
        }
    };

    if files.is_empty() {
        uploader.write_line(format!(
            "No files matched {} for artifacts {command_name}.",
            patterns.join(", ")
        ));
        return true;
    }

    let client = reqwest::Client::new();
    for file in &files {
        let relative = file
            .strip_prefix(&base)
            .unwrap_or(file)
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                uploader.write_line(format!("Failed to read artifact {relative}: {e}!"));
                return false;
            }
        };

        uploader.write_line(format!("Uploading {relative} ({} bytes)...", bytes.len()));
        let url = format!("http://{cache_host}/artifacts/{task_id}/{command_name}/{relative}");
        match client.put(&url).body(bytes).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                uploader.write_line(format!(
                    "Failed to upload artifact {relative}: status {}!",
                    response.status()
                ));
                return false;
            }
            Err(e) => {
                uploader.write_line(format!("Failed to upload artifact {relative}: {e}!"));
                return false;
            }
        }
    }

    uploader.write_line(format!("Uploaded {} artifact files.", files.len()));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn glob_matching_is_relative_to_the_base() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("reports")).unwrap();
        std::fs::write(dir.path().join("reports/junit.xml"), b"<xml/>").unwrap();
        std::fs::write(dir.path().join("readme.md"), b"docs").unwrap();

        let files = matching_files(dir.path(), &["reports/*.xml".to_string()]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("reports/junit.xml"));
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let dir = TempDir::new().unwrap();
        let result = matching_files(dir.path(), &["reports/[".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn recursive_globs_descend() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::write(dir.path().join("a/b/c/out.bin"), b"bits").unwrap();

        let files = matching_files(dir.path(), &["**/*.bin".to_string()]).unwrap();
        assert_eq!(files.len(), 1);
    }
}
