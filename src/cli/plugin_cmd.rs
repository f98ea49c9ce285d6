use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cli::{flag_value, parse_params};
use crate::core::broker::BrokerGateway;
use crate::core::config::Config;
use crate::core::terminal::{print_info, print_success, print_warn, GuideSection};
use crate::plugins::hot_loader::HotLoader;
use crate::plugins::invoker::{ExecutionStatus, PluginInvoker};
use crate::plugins::PluginRegistry;

async fn open_registry(config: &Config) -> Result<Arc<PluginRegistry>> {
    let registry = Arc::new(PluginRegistry::new(
        config.plugins_dir.clone(),
        config.plugin_envs_dir.clone(),
    ));
    registry.scan().await?;
    Ok(registry)
}

pub async fn list_plugins() -> Result<()> {
    let config = Config::from_env();
    let registry = open_registry(&config).await?;
    let plugins = registry.list().await;
    if plugins.is_empty() {
        print_warn(&format!(
            "no plugins found under {}",
            config.plugins_dir.display()
        ));
        return Ok(());
    }
    for record in plugins {
        let m = &record.manifest;
        let mut section = GuideSection::new(&format!("{} v{}", m.name, m.version))
            .status("enabled", if m.enabled { "yes" } else { "no" })
            .status("entry point", &m.entry_point);
        if !m.description.is_empty() {
            section = section.text(&m.description);
        }
        if !m.dependencies.is_empty() {
            section = section.status("dependencies", &m.dependencies.join(", "));
        }
        if !m.tags.is_empty() {
            section = section.status("tags", &m.tags.join(", "));
        }
        section.print();
    }
    Ok(())
}

/// Execute a plugin in this process and print the structured report. The
/// plugin is reloaded first if its directory changed, so this doubles as
/// the hot-reload smoke check.
pub async fn test_plugin(name: &str, args: &[String]) -> Result<()> {
    let config = Config::from_env();
    let registry = open_registry(&config).await?;
    let loader = Arc::new(HotLoader::new(Arc::clone(&registry)));
    loader.snapshot().await;
    let invoker = PluginInvoker::new(registry, loader);

    let parameters = parse_params(args);
    let timeout = flag_value(args, "--timeout")
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs);

    let report = invoker.execute(name, &parameters, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.status {
        ExecutionStatus::Success => print_success(&format!("plugin {name} succeeded")),
        ExecutionStatus::Error => anyhow::bail!("plugin {name} reported an error"),
    }
    Ok(())
}

pub async fn reload(name: &str) -> Result<()> {
    let config = Config::from_env();
    let registry = open_registry(&config).await?;
    let loader = HotLoader::new(Arc::clone(&registry));
    loader.force_reload(name).await?;
    let record = registry
        .get(name)
        .await
        .ok_or_else(|| anyhow::anyhow!("plugin {name} not found after reload"))?;
    print_success(&format!(
        "reloaded {} v{} ({} tracked file(s))",
        name,
        record.manifest.version,
        record.file_hashes.len()
    ));
    Ok(())
}

/// Submit an invocation to the broker instead of running it here.
pub async fn trigger(name: &str, args: &[String]) -> Result<()> {
    let config = Config::from_env();
    let registry = open_registry(&config).await?;
    if registry.get(name).await.is_none() {
        anyhow::bail!("plugin {name} not found");
    }

    let gateway = BrokerGateway::open(&config.broker_url)?;
    let parameters = parse_params(args);
    let high_priority = flag_value(args, "--priority") == Some("high");
    let submission_id = gateway.trigger_plugin(name, &parameters, high_priority).await?;
    print_info(&format!("triggered {name} as {submission_id}"));
    println!("{submission_id}");
    Ok(())
}
