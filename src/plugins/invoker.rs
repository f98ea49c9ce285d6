use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::core::error::RuntimeError;
use crate::plugins::{hot_loader::HotLoader, PluginRecord, PluginRegistry};

/// Structured outcome of one plugin invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub plugin_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

impl ExecutionReport {
    fn success(plugin: &str, result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            plugin_name: plugin.to_string(),
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failure(plugin: &str, error: String) -> Self {
        Self {
            status: ExecutionStatus::Error,
            plugin_name: plugin.to_string(),
            result: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Executes plugins through the sub-process contract: the entry module runs
/// as a child process, validated parameters arrive as one JSON object on
/// stdin, and stdout is the result. Each invocation gets a private
/// environment (parent snapshot + env-file overlay); the shared process
/// environment is never touched, so concurrent invocations cannot leak
/// variables into each other.
pub struct PluginInvoker {
    registry: Arc<PluginRegistry>,
    loader: Arc<HotLoader>,
}

impl PluginInvoker {
    pub fn new(registry: Arc<PluginRegistry>, loader: Arc<HotLoader>) -> Self {
        Self { registry, loader }
    }

    pub fn loader(&self) -> &Arc<HotLoader> {
        &self.loader
    }

    /// Run one plugin. Plugin-body failures come back as an `Error` report;
    /// only registry/validation problems are `Err`.
    pub async fn execute(
        &self,
        plugin_name: &str,
        parameters: &serde_json::Value,
        time_limit: Option<Duration>,
    ) -> Result<ExecutionReport, RuntimeError> {
        // Reload first so a freshly fixed manifest is visible to the lookup.
        if self.loader.is_dirty(plugin_name) || self.loader.has_updates(plugin_name).await {
            self.loader.force_reload(plugin_name).await?;
        }

        let record = self
            .registry
            .get(plugin_name)
            .await
            .ok_or_else(|| RuntimeError::PluginNotAvailable(plugin_name.to_string()))?;
        if !record.manifest.enabled {
            return Err(RuntimeError::PluginNotAvailable(format!(
                "{plugin_name} is disabled"
            )));
        }

        // Validation happens before entrypoint resolution.
        let validated = PluginRegistry::validate_parameters(&record.manifest, parameters)?;

        let (module, function) =
            record
                .manifest
                .entry_point
                .rsplit_once('.')
                .ok_or_else(|| RuntimeError::ManifestInvalid {
                    path: record.dir.clone(),
                    detail: format!(
                        "entry_point '{}' is not of the form module.function",
                        record.manifest.entry_point
                    ),
                })?;
        let (program, script) = resolve_module(&record, module)?;

        let deps_root = self
            .registry
            .ensure_deps_env(&record)
            .await
            .map_err(|e| RuntimeError::PluginRuntimeError(e.to_string()))?;
        let env = self.build_env(&record, function, deps_root);

        info!("executing plugin {} ({})", plugin_name, record.manifest.entry_point);
        let report = self
            .run_subprocess(&record, program, script, env, &validated, time_limit)
            .await?;
        if report.status == ExecutionStatus::Error {
            warn!(
                "plugin {} reported error: {}",
                plugin_name,
                report.error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(report)
    }

    /// Private environment for one invocation: snapshot of the parent env,
    /// env-file overlay on top, then the invocation context variables.
    fn build_env(
        &self,
        record: &PluginRecord,
        function: &str,
        deps_root: Option<PathBuf>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.registry.env_overlay(record));
        env.insert("TASKBEAT_PLUGIN".into(), record.manifest.name.clone());
        env.insert(
            "TASKBEAT_PLUGIN_DIR".into(),
            record.dir.to_string_lossy().to_string(),
        );
        env.insert("TASKBEAT_ENTRY_FUNCTION".into(), function.to_string());
        if let Some(root) = deps_root {
            let root = root.to_string_lossy().to_string();
            let pythonpath = match env.get("PYTHONPATH") {
                Some(existing) if !existing.is_empty() => format!("{root}:{existing}"),
                _ => root,
            };
            env.insert("PYTHONPATH".into(), pythonpath);
        }
        env
    }

    async fn run_subprocess(
        &self,
        record: &PluginRecord,
        program: String,
        script: Option<PathBuf>,
        env: HashMap<String, String>,
        parameters: &serde_json::Value,
        time_limit: Option<Duration>,
    ) -> Result<ExecutionReport, RuntimeError> {
        let name = &record.manifest.name;
        let mut cmd = Command::new(&program);
        if let Some(script) = &script {
            cmd.arg(script);
        }
        cmd.current_dir(&record.dir);
        cmd.env_clear();
        cmd.envs(&env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::PluginRuntimeError(format!("spawn {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = parameters.to_string();
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!("failed writing parameters to plugin {}: {}", name, e);
            }
            drop(stdin);
        }

        let waited = match time_limit {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                // Dropping the in-flight future kills the child (kill_on_drop).
                Err(_) => {
                    return Ok(ExecutionReport::failure(
                        name,
                        format!("timed out after {}s", limit.as_secs()),
                    ))
                }
            },
            None => child.wait_with_output().await,
        };
        let output =
            waited.map_err(|e| RuntimeError::PluginRuntimeError(format!("wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            };
            return Ok(ExecutionReport::failure(name, detail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        let result = serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()));
        Ok(ExecutionReport::success(name, result))
    }
}

/// Resolve the module half of an entry point to something runnable inside
/// the plugin directory: a bare executable, a Python module, or a shell
/// script, in that order.
fn resolve_module(
    record: &PluginRecord,
    module: &str,
) -> Result<(String, Option<PathBuf>), RuntimeError> {
    let bare = record.dir.join(module);
    if bare.is_file() {
        return Ok((bare.to_string_lossy().to_string(), None));
    }
    let python = record.dir.join(format!("{module}.py"));
    if python.is_file() {
        return Ok(("python3".to_string(), Some(python)));
    }
    let shell = record.dir.join(format!("{module}.sh"));
    if shell.is_file() {
        return Ok(("sh".to_string(), Some(shell)));
    }
    Err(RuntimeError::PluginNotAvailable(format!(
        "entry module '{}' not found in {}",
        module,
        record.dir.display()
    )))
}
