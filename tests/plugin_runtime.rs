use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use taskbeat::core::error::RuntimeError;
use taskbeat::plugins::hot_loader::HotLoader;
use taskbeat::plugins::invoker::{ExecutionStatus, PluginInvoker};
use taskbeat::plugins::PluginRegistry;

struct Harness {
    dir: tempfile::TempDir,
    registry: Arc<PluginRegistry>,
    invoker: PluginInvoker,
}

fn plugins_root(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("plugins")
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugins = plugins_root(&dir);
    let envs = dir.path().join("plugin_envs");
    std::fs::create_dir_all(&plugins).expect("plugins dir");
    let registry = Arc::new(PluginRegistry::new(plugins, envs));
    registry.scan().await.expect("scan");
    let loader = Arc::new(HotLoader::new(Arc::clone(&registry)));
    loader.snapshot().await;
    let invoker = PluginInvoker::new(Arc::clone(&registry), loader);
    Harness {
        dir,
        registry,
        invoker,
    }
}

fn write_plugin(root: &Path, name: &str, manifest: serde_json::Value, script: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::to_string_pretty(&manifest).expect("manifest json"),
    )
    .expect("manifest");
    std::fs::write(dir.join("main.sh"), script).expect("script");
}

fn echo_manifest(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "description": "test plugin",
        "entry_point": "main.run",
        "parameters": {},
        "dependencies": [],
        "python_version": ">=3.8",
        "enabled": true,
        "tags": ["test"]
    })
}

#[tokio::test]
async fn executes_plugin_and_parses_json_result() {
    let h = harness().await;
    write_plugin(
        &plugins_root(&h.dir),
        "echo",
        echo_manifest("echo"),
        "#!/bin/sh\nparams=$(cat)\necho \"{\\\"received\\\": $params}\"\n",
    );
    h.registry.scan().await.expect("scan");

    let report = h
        .invoker
        .execute("echo", &serde_json::json!({"x": 7}), None)
        .await
        .expect("execute");
    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(
        report.result.expect("result")["received"],
        serde_json::json!({"x": 7})
    );
}

#[tokio::test]
async fn unknown_and_disabled_plugins_are_not_available() {
    let h = harness().await;
    let err = h
        .invoker
        .execute("ghost", &serde_json::json!({}), None)
        .await
        .expect_err("unknown plugin");
    assert!(matches!(err, RuntimeError::PluginNotAvailable(_)));

    let mut manifest = echo_manifest("off");
    manifest["enabled"] = serde_json::json!(false);
    write_plugin(
        &plugins_root(&h.dir),
        "off",
        manifest,
        "#!/bin/sh\necho '{}'\n",
    );
    h.registry.scan().await.expect("scan");

    let err = h
        .invoker
        .execute("off", &serde_json::json!({}), None)
        .await
        .expect_err("disabled plugin");
    assert!(matches!(err, RuntimeError::PluginNotAvailable(_)));
}

#[tokio::test]
async fn validation_happens_before_execution() {
    let h = harness().await;
    let mut manifest = echo_manifest("strict");
    manifest["parameters"] = serde_json::json!({
        "mode": {"type": "string", "required": true},
        "batch": {"type": "integer", "default": 10}
    });
    write_plugin(
        &plugins_root(&h.dir),
        "strict",
        manifest,
        "#!/bin/sh\nparams=$(cat)\necho \"$params\"\n",
    );
    h.registry.scan().await.expect("scan");

    let err = h
        .invoker
        .execute("strict", &serde_json::json!({}), None)
        .await
        .expect_err("missing required");
    assert!(matches!(err, RuntimeError::ParameterInvalid(_)));

    // With the required value present, the declared default is filled in.
    let report = h
        .invoker
        .execute("strict", &serde_json::json!({"mode": "full"}), None)
        .await
        .expect("execute");
    let result = report.result.expect("result");
    assert_eq!(result["mode"], serde_json::json!("full"));
    assert_eq!(result["batch"], serde_json::json!(10));
}

#[tokio::test]
async fn plugin_failure_is_a_report_not_an_error() {
    let h = harness().await;
    write_plugin(
        &plugins_root(&h.dir),
        "broken",
        echo_manifest("broken"),
        "#!/bin/sh\necho 'kaboom' >&2\nexit 3\n",
    );
    h.registry.scan().await.expect("scan");

    let report = h
        .invoker
        .execute("broken", &serde_json::json!({}), None)
        .await
        .expect("captured failure");
    assert_eq!(report.status, ExecutionStatus::Error);
    assert!(report.error.expect("error").contains("kaboom"));
}

#[tokio::test]
async fn overrunning_plugin_is_killed_at_the_time_limit() {
    let h = harness().await;
    write_plugin(
        &plugins_root(&h.dir),
        "slow",
        echo_manifest("slow"),
        "#!/bin/sh\nsleep 30\necho '{}'\n",
    );
    h.registry.scan().await.expect("scan");

    let report = h
        .invoker
        .execute("slow", &serde_json::json!({}), Some(Duration::from_secs(1)))
        .await
        .expect("captured timeout");
    assert_eq!(report.status, ExecutionStatus::Error);
    assert!(report.error.expect("error").contains("timed out"));
}

#[tokio::test]
async fn env_overlay_is_visible_to_plugin_and_invisible_to_process() {
    let h = harness().await;
    let root = plugins_root(&h.dir);
    write_plugin(
        &root,
        "envy",
        echo_manifest("envy"),
        "#!/bin/sh\ncat > /dev/null\necho \"{\\\"k\\\": \\\"$TB_ENV_SCOPE_K\\\", \\\"g\\\": \\\"$TB_ENV_SCOPE_G\\\"}\"\n",
    );
    // Global layer, then the plugin layer overriding one key.
    std::fs::write(root.join(".env"), "TB_ENV_SCOPE_K=global\nTB_ENV_SCOPE_G=shared\n")
        .expect("global env");
    std::fs::write(root.join("envy").join(".env"), "TB_ENV_SCOPE_K=B\n").expect("plugin env");
    h.registry.scan().await.expect("scan");

    std::env::set_var("TB_ENV_SCOPE_K", "A");
    let report = h
        .invoker
        .execute("envy", &serde_json::json!({}), None)
        .await
        .expect("execute");
    let result = report.result.expect("result");
    // The plugin sees the overlay: plugin layer wins, global fills gaps.
    assert_eq!(result["k"], serde_json::json!("B"));
    assert_eq!(result["g"], serde_json::json!("shared"));
    // The invoking process keeps its own environment.
    assert_eq!(std::env::var("TB_ENV_SCOPE_K").as_deref(), Ok("A"));
    std::env::remove_var("TB_ENV_SCOPE_K");
}

#[tokio::test]
async fn content_change_is_observed_by_the_next_execution() {
    let h = harness().await;
    let root = plugins_root(&h.dir);
    write_plugin(
        &root,
        "hot",
        echo_manifest("hot"),
        "#!/bin/sh\ncat > /dev/null\necho '{\"version\": \"v1\"}'\n",
    );
    h.registry.scan().await.expect("scan");
    h.invoker.loader().snapshot().await;

    let report = h
        .invoker
        .execute("hot", &serde_json::json!({}), None)
        .await
        .expect("first run");
    assert_eq!(report.result.expect("result")["version"], "v1");

    // Rewrite the module on disk; no rescan, no restart.
    std::fs::write(
        root.join("hot").join("main.sh"),
        "#!/bin/sh\ncat > /dev/null\necho '{\"version\": \"v2\"}'\n",
    )
    .expect("rewrite");

    let report = h
        .invoker
        .execute("hot", &serde_json::json!({}), None)
        .await
        .expect("second run");
    assert_eq!(report.result.expect("result")["version"], "v2");
}

#[tokio::test]
async fn broken_manifest_excludes_only_that_plugin() {
    let h = harness().await;
    let root = plugins_root(&h.dir);
    write_plugin(
        &root,
        "good",
        echo_manifest("good"),
        "#!/bin/sh\necho '{}'\n",
    );
    let bad = root.join("bad");
    std::fs::create_dir_all(&bad).expect("bad dir");
    std::fs::write(bad.join("plugin.json"), "{not json").expect("bad manifest");

    h.registry.scan().await.expect("scan survives");
    assert!(h.registry.get("good").await.is_some());
    assert!(h.registry.get("bad").await.is_none());
}

#[tokio::test]
async fn dependency_env_is_materialized_once_and_reused() {
    let h = harness().await;
    let root = plugins_root(&h.dir);
    let mut manifest = echo_manifest("deps");
    manifest["dependencies"] = serde_json::json!(["left-pad==1.0.0"]);
    write_plugin(&root, "deps", manifest, "#!/bin/sh\necho '{}'\n");
    h.registry.scan().await.expect("scan");

    let record = h.registry.get("deps").await.expect("record");
    let env_root = h
        .registry
        .ensure_deps_env(&record)
        .await
        .expect("materialize")
        .expect("deps root");
    assert!(env_root.join("requirements.txt").is_file());
    let marker = std::fs::read_to_string(env_root.join(".deps-fingerprint")).expect("marker");

    // Second call reuses the same fingerprint without rebuilding.
    let again = h
        .registry
        .ensure_deps_env(&record)
        .await
        .expect("reuse")
        .expect("deps root");
    assert_eq!(env_root, again);
    let marker_again =
        std::fs::read_to_string(env_root.join(".deps-fingerprint")).expect("marker");
    assert_eq!(marker, marker_again);
}
