use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::core::error::RuntimeError;
use crate::plugins::{hash_plugin_files, hex, PluginRegistry, MANIFEST_FILE};

/// Default debounce window for the directory watcher.
pub const DEBOUNCE_MS: u64 = 500;

type LoadedCallback = Box<dyn Fn(&str) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Watches plugin directories for content changes and marks plugins dirty.
/// The invoker consults the loader before executing and reloads dirty
/// plugins, so every execution sees the latest on-disk content without a
/// process restart.
pub struct HotLoader {
    registry: Arc<PluginRegistry>,
    /// Combined content checksum per plugin, as last observed.
    checksums: Mutex<HashMap<String, String>>,
    dirty: Mutex<HashSet<String>>,
    loaded_callbacks: Mutex<Vec<LoadedCallback>>,
    error_callbacks: Mutex<Vec<ErrorCallback>>,
}

impl HotLoader {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            checksums: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            loaded_callbacks: Mutex::new(Vec::new()),
            error_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Record the current checksum of every registered plugin.
    pub async fn snapshot(&self) {
        let mut checksums = HashMap::new();
        for record in self.registry.list().await {
            if let Some(sum) = checksum_of_dir(&record.dir) {
                checksums.insert(record.manifest.name.clone(), sum);
            }
        }
        *self.checksums.lock().unwrap_or_else(|e| e.into_inner()) = checksums;
    }

    pub fn on_loaded<F: Fn(&str) + Send + Sync + 'static>(&self, callback: F) {
        self.loaded_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    pub fn on_error<F: Fn(&str, &str) + Send + Sync + 'static>(&self, callback: F) {
        self.error_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    pub fn mark_dirty(&self, name: &str) {
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Compare the on-disk content of one plugin against the last recorded
    /// checksum.
    pub async fn has_updates(&self, name: &str) -> bool {
        let Some(record) = self.registry.get(name).await else {
            return false;
        };
        let current = checksum_of_dir(&record.dir);
        let stored = self
            .checksums
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        current != stored
    }

    /// Reload a plugin when it is dirty or its content moved; no-op when it
    /// is current. Returns whether a reload happened.
    pub async fn reload_if_updated(&self, name: &str) -> Result<bool, RuntimeError> {
        if !self.is_dirty(name) && !self.has_updates(name).await {
            return Ok(false);
        }
        self.force_reload(name).await.map(|_| true)
    }

    /// Unconditionally drop cached state and reload from disk.
    pub async fn force_reload(&self, name: &str) -> Result<(), RuntimeError> {
        match self.registry.reload(name).await {
            Ok(record) => {
                if let Some(sum) = checksum_of_dir(&record.dir) {
                    self.checksums
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(name.to_string(), sum);
                }
                self.dirty
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(name);
                info!("hot reloaded plugin {}", name);
                self.fire_loaded(name);
                Ok(())
            }
            Err(e) => {
                self.fire_error(name, &e.to_string());
                Err(e)
            }
        }
    }

    /// Background watcher: every debounce window, rescan plugin directories
    /// and mark content changes dirty. New plugin directories are registered
    /// on sight; a deleted manifest drops the plugin from the registry.
    pub fn spawn_watcher(self: &Arc<Self>, debounce: Duration) -> tokio::task::JoinHandle<()> {
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(debounce);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                loader.poll_once().await;
            }
        })
    }

    async fn poll_once(&self) {
        let known: Vec<_> = self
            .registry
            .list()
            .await
            .iter()
            .map(|r| (r.manifest.name.clone(), r.dir.clone()))
            .collect();

        for (name, dir) in &known {
            if !dir.join(MANIFEST_FILE).exists() {
                debug!("manifest of {} removed, dropping from registry", name);
                let _ = self.registry.reload(name).await;
                self.checksums
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(name);
                continue;
            }
            let current = checksum_of_dir(dir);
            let stored = self
                .checksums
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(name)
                .cloned();
            if current != stored {
                debug!("content change detected in plugin {}", name);
                self.mark_dirty(name);
            }
        }

        // Pick up directories that appeared since the last scan.
        let known_dirs: HashSet<_> = known.iter().map(|(_, d)| d.clone()).collect();
        if let Ok(entries) = std::fs::read_dir(self.registry.plugins_dir()) {
            for entry in entries.flatten() {
                let dir = entry.path();
                if !dir.is_dir() || known_dirs.contains(&dir) || !dir.join(MANIFEST_FILE).exists()
                {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                match self.force_reload(&name).await {
                    Ok(()) => info!("discovered new plugin {}", name),
                    Err(e) => warn!("new plugin {} failed to load: {}", name, e),
                }
            }
        }
    }

    fn fire_loaded(&self, name: &str) {
        for callback in self
            .loaded_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            callback(name);
        }
    }

    fn fire_error(&self, name: &str, message: &str) {
        for callback in self
            .error_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            callback(name, message);
        }
    }
}

/// Fold the per-file hashes of a plugin directory into one checksum. The
/// global plugins-root env file is outside the directory, so it never
/// participates.
fn checksum_of_dir(dir: &Path) -> Option<String> {
    let hashes = hash_plugin_files(dir).ok()?;
    let mut hasher = Sha256::new();
    for (path, digest) in &hashes {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"=");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Some(hex(&hasher.finalize()))
}
