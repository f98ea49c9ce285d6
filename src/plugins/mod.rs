pub mod envfile;
pub mod hot_loader;
pub mod invoker;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::error::RuntimeError;

/// File that marks a directory as a plugin and carries its metadata.
pub const MANIFEST_FILE: &str = "plugin.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Dotted `module.function` path relative to the plugin directory.
    pub entry_point: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Advisory only; recorded but not enforced.
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Object => value.is_object(),
            ParameterType::Array => value.is_array(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
            ParameterType::Array => "array",
        }
    }
}

/// One discovered plugin: its manifest, directory, and source hashes.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
    pub file_hashes: BTreeMap<PathBuf, String>,
}

/// Discovers plugin directories under the plugins root, parses manifests,
/// and manages per-plugin dependency environments.
pub struct PluginRegistry {
    plugins_dir: PathBuf,
    envs_dir: PathBuf,
    plugins: RwLock<HashMap<String, Arc<PluginRecord>>>,
}

impl PluginRegistry {
    pub fn new<P: Into<PathBuf>>(plugins_dir: P, envs_dir: P) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            envs_dir: envs_dir.into(),
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Scan the plugins root. A broken manifest excludes that plugin only;
    /// the rest of the registry is unaffected.
    pub async fn scan(&self) -> Result<()> {
        let mut found = HashMap::new();
        let entries = match std::fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "plugins directory {} not readable: {}",
                    self.plugins_dir.display(),
                    e
                );
                return Ok(());
            }
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(MANIFEST_FILE).exists() {
                continue;
            }
            match load_record(&dir) {
                Ok(record) => {
                    info!(
                        "loaded plugin {} v{}",
                        record.manifest.name, record.manifest.version
                    );
                    found.insert(record.manifest.name.clone(), Arc::new(record));
                }
                Err(e) => warn!("skipping plugin at {}: {}", dir.display(), e),
            }
        }
        let count = found.len();
        *self.plugins.write().await = found;
        info!("registry holds {} plugin(s)", count);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<PluginRecord>> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<PluginRecord>> {
        let mut all: Vec<_> = self.plugins.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        all
    }

    /// Re-read one plugin's manifest and file hashes from disk.
    pub async fn reload(&self, name: &str) -> Result<Arc<PluginRecord>, RuntimeError> {
        let dir = match self.get(name).await {
            Some(record) => record.dir.clone(),
            None => self.plugins_dir.join(name),
        };
        if !dir.join(MANIFEST_FILE).exists() {
            // Manifest gone: the plugin no longer exists.
            self.plugins.write().await.remove(name);
            return Err(RuntimeError::PluginNotAvailable(name.to_string()));
        }
        let record = load_record(&dir).map_err(|e| RuntimeError::ManifestInvalid {
            path: dir.join(MANIFEST_FILE),
            detail: e.to_string(),
        })?;
        let record = Arc::new(record);
        self.plugins
            .write()
            .await
            .insert(record.manifest.name.clone(), record.clone());
        info!("reloaded plugin {}", name);
        Ok(record)
    }

    /// Validate an invocation's parameters against the manifest schema:
    /// missing required fail, declared defaults are substituted, declared
    /// types are checked, unknown keys pass through unchanged.
    pub fn validate_parameters(
        manifest: &PluginManifest,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, RuntimeError> {
        let supplied = match parameters {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(RuntimeError::ParameterInvalid(format!(
                    "parameters must be an object, got {other}"
                )))
            }
        };
        let mut validated = supplied.clone();
        let mut missing = Vec::new();
        for (name, spec) in &manifest.parameters {
            match supplied.get(name) {
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(RuntimeError::ParameterInvalid(format!(
                            "parameter '{}' expects {}, got {}",
                            name,
                            spec.kind.label(),
                            value
                        )));
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        validated.insert(name.clone(), default.clone());
                    } else if spec.required {
                        missing.push(name.clone());
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(RuntimeError::ParameterInvalid(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }
        Ok(serde_json::Value::Object(validated))
    }

    /// Lazily materialize the isolated package root for a plugin's declared
    /// dependencies. Reused while the dependency list is unchanged; rebuilt
    /// when it moves. Returns None for plugins with no dependencies.
    pub async fn ensure_deps_env(&self, record: &PluginRecord) -> Result<Option<PathBuf>> {
        if record.manifest.dependencies.is_empty() {
            return Ok(None);
        }
        let root = self.envs_dir.join(&record.manifest.name);
        let marker = root.join(".deps-fingerprint");
        let fingerprint = deps_fingerprint(&record.manifest.dependencies);

        if let Ok(existing) = std::fs::read_to_string(&marker) {
            if existing.trim() == fingerprint {
                return Ok(Some(root));
            }
        }

        info!(
            "materializing dependency env for {} ({} requirement(s))",
            record.manifest.name,
            record.manifest.dependencies.len()
        );
        std::fs::create_dir_all(&root)?;
        let requirements = root.join("requirements.txt");
        std::fs::write(&requirements, record.manifest.dependencies.join("\n"))?;

        let status = tokio::process::Command::new("python3")
            .arg("-m")
            .arg("pip")
            .arg("install")
            .arg("--quiet")
            .arg("--target")
            .arg(&root)
            .arg("-r")
            .arg(&requirements)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => warn!(
                "pip install for {} exited with {}; continuing with bare env",
                record.manifest.name, s
            ),
            Err(e) => warn!(
                "pip unavailable for {} ({}); continuing with bare env",
                record.manifest.name, e
            ),
        }
        std::fs::write(&marker, &fingerprint)?;
        Ok(Some(root))
    }

    /// The env-file overlay for one plugin (global layer, then plugin layer).
    pub fn env_overlay(&self, record: &PluginRecord) -> HashMap<String, String> {
        envfile::overlay_for(&self.plugins_dir, &record.dir)
    }
}

fn load_record(dir: &Path) -> Result<PluginRecord> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&manifest_path)?;
    let manifest: PluginManifest = serde_json::from_str(&raw)?;
    let file_hashes = hash_plugin_files(dir)?;
    Ok(PluginRecord {
        manifest,
        dir: dir.to_path_buf(),
        file_hashes,
    })
}

/// Hash every file in the plugin directory that participates in hot-reload
/// detection: sources, JSON (manifest included), and the plugin's own env
/// file. Paths are relative so hashes are stable across checkouts.
pub fn hash_plugin_files(dir: &Path) -> Result<BTreeMap<PathBuf, String>> {
    let mut hashes = BTreeMap::new();
    collect_hashes(dir, dir, &mut hashes)?;
    Ok(hashes)
}

fn collect_hashes(
    root: &Path,
    dir: &Path,
    hashes: &mut BTreeMap<PathBuf, String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_hashes(root, &path, hashes)?;
            continue;
        }
        if !is_tracked_file(&path) {
            continue;
        }
        let content = std::fs::read(&path)?;
        let digest = Sha256::digest(&content);
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        hashes.insert(rel, hex(&digest));
    }
    Ok(())
}

fn is_tracked_file(path: &Path) -> bool {
    if path.file_name().and_then(|n| n.to_str()) == Some(envfile::ENV_FILE_NAME) {
        return true;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("py") | Some("sh") | Some("json")
    )
}

fn deps_fingerprint(dependencies: &[String]) -> String {
    let mut sorted: Vec<&String> = dependencies.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for dep in sorted {
        hasher.update(dep.as_bytes());
        hasher.update(b"\n");
    }
    hex(&hasher.finalize())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
