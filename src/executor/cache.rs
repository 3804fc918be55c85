//! Folder cache download/upload against the HTTP cache host.
//!
//! A cache key is derived from the instruction's fingerprint scripts (or
//! the folder list when no scripts are given). Folder snapshots travel as
//! gzip-compressed protobuf entry lists; the format is internal to the
//! agent on both ends of the HTTP cache, the store itself only sees opaque
//! blobs.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api;
use crate::environment::Environment;
use crate::errors::{Error, Result};
use crate::logs::LogUploader;
use crate::process;

#[derive(Clone, PartialEq, ::prost::Message)]
struct ArchiveEntry {
    #[prost(string, tag = "1")]
    path: String,
    #[prost(uint32, tag = "2")]
    mode: u32,
    #[prost(bytes = "vec", tag = "3")]
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct FolderArchive {
    #[prost(message, repeated, tag = "1")]
    entries: Vec<ArchiveEntry>,
}

/// What happened for one cache key; promoted to a protocol message at
/// task end.
enum Attempt {
    Hit {
        size_bytes: u64,
        downloaded_in_seconds: u64,
    },
    Miss {
        size_bytes: u64,
        populated_in_seconds: u64,
        archived_in_seconds: u64,
        uploaded_in_seconds: u64,
    },
    Error(String),
}

#[derive(Default)]
pub struct CacheAttempts {
    attempts: HashMap<String, Attempt>,
}

impl CacheAttempts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn hit(&mut self, name: &str, size_bytes: u64, downloaded_in_seconds: u64) {
        self.attempts.insert(
            name.to_string(),
            Attempt::Hit {
                size_bytes,
                downloaded_in_seconds,
            },
        );
    }

    fn miss(&mut self, name: &str, populated_in_seconds: u64) {
        self.attempts.insert(
            name.to_string(),
            Attempt::Miss {
                size_bytes: 0,
                populated_in_seconds,
                archived_in_seconds: 0,
                uploaded_in_seconds: 0,
            },
        );
    }

    fn miss_uploaded(
        &mut self,
        name: &str,
        size_bytes: u64,
        archived_in_seconds: u64,
        uploaded_in_seconds: u64,
    ) {
        if let Some(Attempt::Miss {
            size_bytes: size,
            archived_in_seconds: archived,
            uploaded_in_seconds: uploaded,
            ..
        }) = self.attempts.get_mut(name)
        {
            *size = size_bytes;
            *archived = archived_in_seconds;
            *uploaded = uploaded_in_seconds;
        }
    }

    fn error(&mut self, name: &str, message: impl Into<String>) {
        self.attempts
            .insert(name.to_string(), Attempt::Error(message.into()));
    }

    pub fn to_proto(&self) -> api::CacheRetrievalAttempts {
        let attempts = self
            .attempts
            .iter()
            .map(|(name, attempt)| {
                let proto = match attempt {
                    Attempt::Hit {
                        size_bytes,
                        downloaded_in_seconds,
                    } => api::CacheRetrievalAttempt {
                        error: String::new(),
                        result: Some(api::cache_retrieval_attempt::Result::Hit(
                            api::cache_retrieval_attempt::Hit {
                                size_bytes: *size_bytes,
                                downloaded_in_seconds: *downloaded_in_seconds,
                            },
                        )),
                    },
                    Attempt::Miss {
                        size_bytes,
                        populated_in_seconds,
                        archived_in_seconds,
                        uploaded_in_seconds,
                    } => api::CacheRetrievalAttempt {
                        error: String::new(),
                        result: Some(api::cache_retrieval_attempt::Result::Miss(
                            api::cache_retrieval_attempt::Miss {
                                size_bytes: *size_bytes,
                                populated_in_seconds: *populated_in_seconds,
                                archived_in_seconds: *archived_in_seconds,
                                uploaded_in_seconds: *uploaded_in_seconds,
                            },
                        )),
                    },
                    Attempt::Error(message) => api::CacheRetrievalAttempt {
                        error: message.clone(),
                        result: None,
                    },
                };
                (name.clone(), proto)
            })
            .collect();

        api::CacheRetrievalAttempts { attempts }
    }
}

/// Remembered between the cache step and its matching upload step.
pub struct CachePlan {
    pub key: String,
    pub folders: Vec<PathBuf>,
    pub reupload_on_changes: bool,
    /// Folder digest at download time, for change detection.
    pub base_digest: Option<String>,
}

fn working_dir(env: &Environment) -> PathBuf {
    PathBuf::from(env.get("CIRRUS_WORKING_DIR"))
}

fn resolve_folder(folder: &str, env: &Environment) -> PathBuf {
    let expanded = env.expand_text(folder);
    let path = PathBuf::from(&expanded);
    if path.is_absolute() {
        path
    } else {
        working_dir(env).join(path)
    }
}

fn collect_files(root: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(root)
        .map_err(|e| Error::file_system(root.to_path_buf(), "read directory", e))?
    {
        let entry = entry.map_err(|e| Error::file_system(root.to_path_buf(), "read entry", e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn archive_path(file: &Path, base: &Path) -> String {
    let path = file.strip_prefix(base).unwrap_or(file);
    path.to_string_lossy().replace('\\', "/")
}

fn file_mode(path: &Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(0o644)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0o644
    }
}

/// Snapshot the folders into one compressed blob.
fn pack_folders(folders: &[PathBuf], base: &Path) -> Result<Vec<u8>> {
    let mut archive = FolderArchive::default();

    for folder in folders {
        if !folder.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        collect_files(folder, &mut files)?;
        files.sort();
        for file in files {
            let data = std::fs::read(&file)
                .map_err(|e| Error::file_system(file.clone(), "read", e))?;
            archive.entries.push(ArchiveEntry {
                path: archive_path(&file, base),
                mode: file_mode(&file),
                data,
            });
        }
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&archive.encode_to_vec())
        .map_err(|e| Error::file_system(base.to_path_buf(), "compress archive", e))?;
    encoder
        .finish()
        .map_err(|e| Error::file_system(base.to_path_buf(), "compress archive", e))
}

/// Restore a blob produced by [`pack_folders`]; relative entries land
/// under `base`.
fn unpack_archive(blob: &[u8], base: &Path) -> Result<usize> {
    let mut decoder = GzDecoder::new(blob);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::file_system(base.to_path_buf(), "decompress archive", e))?;

    let archive = FolderArchive::decode(decoded.as_slice())
        .map_err(|e| Error::configuration(format!("corrupt cache archive: {e}")))?;

    let count = archive.entries.len();
    for entry in archive.entries {
        let entry_path = PathBuf::from(&entry.path);
        let destination = if entry_path.is_absolute() {
            entry_path
        } else {
            base.join(entry_path)
        };
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::file_system(parent.to_path_buf(), "create", e))?;
        }
        std::fs::write(&destination, &entry.data)
            .map_err(|e| Error::file_system(destination.clone(), "write", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &destination,
                std::fs::Permissions::from_mode(entry.mode),
            );
        }
    }

    Ok(count)
}

/// Cheap folder digest used by `reupload_on_changes`: file paths, sizes
/// and modification times, not contents.
fn folders_digest(folders: &[PathBuf], base: &Path) -> String {
    let mut hasher = Sha256::new();
    for folder in folders {
        if !folder.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        if collect_files(folder, &mut files).is_err() {
            continue;
        }
        files.sort();
        for file in files {
            hasher.update(archive_path(&file, base).as_bytes());
            if let Ok(metadata) = std::fs::metadata(&file) {
                hasher.update(metadata.len().to_le_bytes());
                if let Ok(modified) = metadata.modified() {
                    if let Ok(elapsed) = modified.duration_since(std::time::UNIX_EPOCH) {
                        hasher.update(elapsed.as_secs().to_le_bytes());
                    }
                }
            }
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Derive the cache key: fingerprint scripts win, folder names are the
/// fallback.
async fn cache_key(
    command_name: &str,
    instruction: &api::CacheInstruction,
    env: &Environment,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(command_name.as_bytes());

    if instruction.fingerprint_scripts.is_empty() {
        for folder in &instruction.folders {
            hasher.update(env.expand_text(folder).as_bytes());
        }
    } else {
        for script in &instruction.fingerprint_scripts {
            let output = fingerprint_script_output(script, env).await?;
            hasher.update(&output);
        }
    }

    Ok(format!("{}-{:x}", command_name, hasher.finalize()))
}

async fn fingerprint_script_output(script: &str, env: &Environment) -> Result<Vec<u8>> {
    #[cfg(unix)]
    let mut command = {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(script);
        command
    };
    #[cfg(windows)]
    let mut command = {
        let mut command = tokio::process::Command::new("cmd.exe");
        command.arg("/c").arg(script);
        command
    };

    command.envs(env.items());
    let working_dir = working_dir(env);
    if working_dir.is_dir() {
        command.current_dir(&working_dir);
    }

    let output = command
        .output()
        .await
        .map_err(|e| Error::command_execution(script, format!("fingerprint script: {e}"), None))?;
    if !output.status.success() {
        return Err(Error::command_execution(
            script,
            "fingerprint script failed",
            output.status.code(),
        ));
    }
    Ok(output.stdout)
}

fn cache_url(cache_host: &str, key: &str) -> String {
    format!("http://{cache_host}/{key}")
}

/// Download a cache entry; on a miss, run the populate scripts. Returns
/// the step success flag and leaves a plan behind for a later upload step.
#[allow(clippy::too_many_arguments)]
pub async fn download_cache(
    token: &CancellationToken,
    deadline: tokio::time::Instant,
    uploader: Arc<LogUploader>,
    command_name: &str,
    cache_host: &str,
    instruction: &api::CacheInstruction,
    env: &Environment,
    attempts: &mut CacheAttempts,
    kill_tree: bool,
) -> (bool, Option<CachePlan>) {
    let key = match cache_key(command_name, instruction, env).await {
        Ok(key) => key,
        Err(e) => {
            uploader.write_line(format!("Failed to calculate cache key: {e}!"));
            attempts.error(command_name, e.to_string());
            return (false, None);
        }
    };

    let folders: Vec<PathBuf> = instruction
        .folders
        .iter()
        .map(|folder| resolve_folder(folder, env))
        .collect();
    let base = working_dir(env);

    uploader.write_line(format!("Downloading cache entry {key}..."));
    let download_started = Instant::now();
    let response = reqwest::Client::new()
        .get(cache_url(cache_host, &key))
        .send()
        .await;

    let mut plan = CachePlan {
        key: key.clone(),
        folders,
        reupload_on_changes: instruction.reupload_on_changes,
        base_digest: None,
    };

    match response {
        Ok(response) if response.status().is_success() => {
            let blob = match response.bytes().await {
                Ok(blob) => blob,
                Err(e) => {
                    uploader.write_line(format!("Failed to read cache entry body: {e}!"));
                    attempts.error(command_name, e.to_string());
                    return (false, Some(plan));
                }
            };
            let downloaded_in = download_started.elapsed().as_secs();
            match unpack_archive(&blob, &base) {
                Ok(count) => {
                    uploader.write_line(format!(
                        "Cache hit! Restored {count} files from a {} byte archive.",
                        blob.len()
                    ));
                    attempts.hit(command_name, blob.len() as u64, downloaded_in);
                    if plan.reupload_on_changes {
                        plan.base_digest = Some(folders_digest(&plan.folders, &base));
                    }
                    (true, Some(plan))
                }
                Err(e) => {
                    uploader.write_line(format!("Failed to unpack cache entry: {e}!"));
                    attempts.error(command_name, e.to_string());
                    (false, Some(plan))
                }
            }
        }
        Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
            uploader.write_line("Cache miss!");
            let populate_started = Instant::now();
            if !instruction.populate_scripts.is_empty() {
                uploader.write_line("Populating the cache...");
                let result = process::run_scripts_and_wait(
                    token,
                    deadline,
                    command_name,
                    &instruction.populate_scripts,
                    env,
                    Arc::clone(&uploader),
                    kill_tree,
                )
                .await;
                match result {
                    Ok(status) if status.success() => {}
                    Ok(_) | Err(_) => {
                        uploader.write_line("Failed to populate the cache!");
                        attempts.error(command_name, "populate scripts failed");
                        return (false, Some(plan));
                    }
                }
            }
            attempts.miss(command_name, populate_started.elapsed().as_secs());
            if plan.reupload_on_changes {
                plan.base_digest = Some(folders_digest(&plan.folders, &base));
            }
            (true, Some(plan))
        }
        Ok(response) => {
            let message = format!("cache host answered with status {}", response.status());
            uploader.write_line(format!("Failed to download cache entry: {message}!"));
            attempts.error(command_name, message);
            (false, Some(plan))
        }
        Err(e) => {
            uploader.write_line(format!("Failed to download cache entry: {e}!"));
            attempts.error(command_name, e.to_string());
            (false, Some(plan))
        }
    }
}

/// Pack and upload the folders recorded by the matching cache step.
/// Accounting is keyed by the cache step's name so hit/miss/upload figures
/// aggregate per cache.
pub async fn upload_cache(
    uploader: Arc<LogUploader>,
    cache_name: &str,
    cache_host: &str,
    plan: Option<&CachePlan>,
    env: &Environment,
    attempts: &mut CacheAttempts,
) -> bool {
    let Some(plan) = plan else {
        uploader.write_line(format!(
            "No cache entry named {cache_name} was downloaded in this task, nothing to upload."
        ));
        return true;
    };

    let base = working_dir(env);

    if plan.reupload_on_changes {
        let current = folders_digest(&plan.folders, &base);
        if plan.base_digest.as_deref() == Some(current.as_str()) {
            uploader.write_line("Cache folders did not change, skipping upload.");
            return true;
        }
    }

    let archive_started = Instant::now();
    let blob = match pack_folders(&plan.folders, &base) {
        Ok(blob) => blob,
        Err(e) => {
            uploader.write_line(format!("Failed to archive cache folders: {e}!"));
            attempts.error(cache_name, e.to_string());
            return false;
        }
    };
    let archived_in = archive_started.elapsed().as_secs();

    uploader.write_line(format!(
        "Uploading a {} byte cache archive for {}...",
        blob.len(),
        plan.key
    ));
    let upload_started = Instant::now();
    let response = reqwest::Client::new()
        .put(cache_url(cache_host, &plan.key))
        .body(blob.clone())
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            attempts.miss_uploaded(
                cache_name,
                blob.len() as u64,
                archived_in,
                upload_started.elapsed().as_secs(),
            );
            uploader.write_line("Uploaded!");
            true
        }
        Ok(response) => {
            let message = format!("cache host answered with status {}", response.status());
            uploader.write_line(format!("Failed to upload cache entry: {message}!"));
            warn!(key = %plan.key, error = %message, "cache upload failed");
            attempts.error(cache_name, message);
            false
        }
        Err(e) => {
            uploader.write_line(format!("Failed to upload cache entry: {e}!"));
            attempts.error(cache_name, e.to_string());
            false
        }
    }
}
