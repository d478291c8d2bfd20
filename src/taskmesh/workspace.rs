//! Per-task isolated, versioned artifact store.
//!
//! Every task owns one [`Workspace`] rooted at `<task_dir>/artifacts`. An
//! artifact is a named file with a totally-ordered version history: each
//! write appends a commit record to the artifact's manifest and stores the
//! bytes as a content-addressed blob under their SHA-256 digest. Writing the
//! same bytes twice yields two distinct versions sharing one blob.
//!
//! # Disk format
//!
//! ```text
//! artifacts/
//!   objects/<sha256>               blob, written once per distinct content
//!   manifests/<safe>-<fp16>.jsonl  one VersionRecord JSON line per write
//! ```
//!
//! The manifest filename combines a sanitised artifact name with a SHA-256
//! fingerprint of the full name, so path-like names (`notes/day1.md`) map to
//! flat files without collisions.
//!
//! Artifact names are normalised and confined to the workspace root: absolute
//! paths and `..` components are rejected with
//! [`EngineError::PathEscape`]. Writes to the same name are serialised;
//! writes to different names proceed in parallel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::taskmesh::error::{EngineError, EngineResult};
use crate::taskmesh::event_bus::{EventBus, EventKind};

/// One commit in an artifact's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactVersion {
    /// Normalised artifact name.
    pub name: String,
    /// Opaque version identifier.
    pub version_id: String,
    /// SHA-256 hex digest of the content blob.
    pub digest: String,
    /// Content length in bytes.
    pub size: u64,
    /// MIME-ish content type recorded at write time.
    pub content_type: String,
    /// Commit message recorded at write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the version was written.
    pub created_at: DateTime<Utc>,
}

/// Listing entry for one artifact.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    /// Normalised artifact name.
    pub name: String,
    /// Version id of the most recent write.
    pub latest_version: String,
    /// Size of the latest version in bytes.
    pub size: u64,
    /// Timestamp of the first write.
    pub created_at: DateTime<Utc>,
    /// Total number of versions.
    pub version_count: usize,
}

/// Per-task versioned artifact store.
pub struct Workspace {
    root: PathBuf,
    objects_dir: PathBuf,
    manifests_dir: PathBuf,
    bus: Option<Arc<EventBus>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Workspace {
    /// Open (or create) a workspace rooted at `root`.
    pub fn open(root: PathBuf) -> EngineResult<Self> {
        let objects_dir = root.join("objects");
        let manifests_dir = root.join("manifests");
        fs::create_dir_all(&objects_dir)?;
        fs::create_dir_all(&manifests_dir)?;
        Ok(Self {
            root,
            objects_dir,
            manifests_dir,
            bus: None,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Emit `artifact_created` / `artifact_updated` events on `bus`
    /// (builder pattern).
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The workspace root directory.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Normalise an artifact name, rejecting anything that would escape the
    /// workspace root.
    pub fn normalize(name: &str) -> EngineResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::PathEscape("empty name".to_string()));
        }
        if name.starts_with('/') || name.starts_with('\\') || name.contains(':') {
            return Err(EngineError::PathEscape(name.to_string()));
        }
        let mut parts = Vec::new();
        for component in name.split(|c| c == '/' || c == '\\') {
            match component {
                "" | "." => continue,
                ".." => return Err(EngineError::PathEscape(name.to_string())),
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Err(EngineError::PathEscape(name.to_string()));
        }
        Ok(parts.join("/"))
    }

    /// Manifest path for a normalised name: sanitised stem plus a 16-hex-char
    /// fingerprint of the full name for collision resistance.
    fn manifest_path(&self, name: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let fingerprint = &digest[..16];

        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        self.manifests_dir
            .join(format!("{}-{}.jsonl", safe, fingerprint))
    }

    async fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("workspace lock map poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn read_manifest(&self, name: &str) -> EngineResult<Vec<ArtifactVersion>> {
        let path = self.manifest_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ArtifactVersion = serde_json::from_str(&line)
                .map_err(|e| EngineError::Storage(format!("bad manifest line: {}", e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Append a new version of `name`. The first version of a name emits
    /// `artifact_created`; later versions emit `artifact_updated`.
    pub async fn write(
        &self,
        name: &str,
        bytes: &[u8],
        content_type: &str,
        commit_message: Option<&str>,
    ) -> EngineResult<ArtifactVersion> {
        let name = Self::normalize(name)?;
        let lock = self.name_lock(&name).await;
        let _guard = lock.lock().await;

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = format!("{:x}", hasher.finalize());

        let blob_path = self.objects_dir.join(&digest);
        if !blob_path.exists() {
            fs::write(&blob_path, bytes)?;
        }

        let record = ArtifactVersion {
            name: name.clone(),
            version_id: uuid::Uuid::new_v4().to_string(),
            digest,
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            message: commit_message.map(|m| m.to_string()),
            created_at: Utc::now(),
        };

        let manifest = self.manifest_path(&name);
        let is_new = !manifest.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&manifest)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        file.sync_all()?;

        if let Some(bus) = &self.bus {
            let kind = if is_new {
                EventKind::ArtifactCreated {
                    name: name.clone(),
                    version: record.version_id.clone(),
                }
            } else {
                EventKind::ArtifactUpdated {
                    name: name.clone(),
                    version: record.version_id.clone(),
                }
            };
            bus.publish(kind);
        }

        Ok(record)
    }

    /// Read a version's bytes. Without `version`, the latest version is
    /// returned. Unknown names and unknown versions yield `Ok(None)`.
    pub async fn read(&self, name: &str, version: Option<&str>) -> EngineResult<Option<Vec<u8>>> {
        let name = Self::normalize(name)?;
        let records = self.read_manifest(&name)?;
        let record = match version {
            Some(id) => records.iter().find(|r| r.version_id == id),
            None => records.last(),
        };
        match record {
            Some(record) => {
                let blob_path = self.objects_dir.join(&record.digest);
                Ok(Some(fs::read(blob_path)?))
            }
            None => Ok(None),
        }
    }

    /// Whether at least one version of `name` exists.
    pub async fn has(&self, name: &str) -> bool {
        match Self::normalize(name) {
            Ok(name) => self.manifest_path(&name).exists(),
            Err(_) => false,
        }
    }

    /// List every artifact with its latest version, sorted by name.
    pub async fn list(&self) -> EngineResult<Vec<ArtifactEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.manifests_dir)? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
                continue;
            }
            let file = fs::File::open(&path)?;
            let reader = BufReader::new(file);
            let mut records: Vec<ArtifactVersion> = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                records.push(
                    serde_json::from_str(&line)
                        .map_err(|e| EngineError::Storage(format!("bad manifest line: {}", e)))?,
                );
            }
            if let (Some(first), Some(last)) = (records.first(), records.last()) {
                entries.push(ArtifactEntry {
                    name: last.name.clone(),
                    latest_version: last.version_id.clone(),
                    size: last.size,
                    created_at: first.created_at,
                    version_count: records.len(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Version history for `name`, oldest first.
    pub async fn versions(&self, name: &str) -> EngineResult<Vec<ArtifactVersion>> {
        let name = Self::normalize(name)?;
        self.read_manifest(&name)
    }

    /// Unified text diff between two versions of `name`. Returns `Ok(None)`
    /// when either version is missing or the content is not valid UTF-8.
    pub async fn diff(&self, name: &str, v1: &str, v2: &str) -> EngineResult<Option<String>> {
        let old = match self.read(name, Some(v1)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let new = match self.read(name, Some(v2)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let old_text = match String::from_utf8(old) {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };
        let new_text = match String::from_utf8(new) {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };

        let diff = similar::TextDiff::from_lines(old_text.as_str(), new_text.as_str());
        Ok(Some(diff.unified_diff().header(v1, v2).to_string()))
    }

    /// Delete one version, or every version when `version` is `None`.
    /// Unknown names and versions are a no-op.
    pub async fn delete(&self, name: &str, version: Option<&str>) -> EngineResult<()> {
        let name = Self::normalize(name)?;
        let lock = self.name_lock(&name).await;
        let _guard = lock.lock().await;

        let manifest = self.manifest_path(&name);
        if !manifest.exists() {
            return Ok(());
        }
        match version {
            None => {
                fs::remove_file(&manifest)?;
            }
            Some(id) => {
                let records = self.read_manifest(&name)?;
                let kept: Vec<&ArtifactVersion> =
                    records.iter().filter(|r| r.version_id != id).collect();
                if kept.is_empty() {
                    fs::remove_file(&manifest)?;
                } else {
                    let mut file = fs::File::create(&manifest)?;
                    for record in kept {
                        writeln!(file, "{}", serde_json::to_string(record)?)?;
                    }
                    file.sync_all()?;
                }
            }
        }
        Ok(())
    }

    /// One-line-per-artifact summary used when briefing agents.
    pub async fn summary(&self) -> EngineResult<String> {
        let entries = self.list().await?;
        if entries.is_empty() {
            return Ok("(workspace is empty)".to_string());
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&format!(
                "- {} ({} bytes, {} version{})\n",
                entry.name,
                entry.size,
                entry.version_count,
                if entry.version_count == 1 { "" } else { "s" }
            ));
        }
        Ok(out)
    }
}
