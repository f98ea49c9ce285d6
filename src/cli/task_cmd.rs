use anyhow::{Context, Result};
use chrono::Utc;

use crate::cli::{flag_value, has_flag, UsageError};
use crate::core::broker::BrokerGateway;
use crate::core::config::Config;
use crate::core::store::{ScheduleType, Task, TaskStore};
use crate::core::terminal::{print_success, print_warn, GuideSection};
use crate::plugins::PluginRegistry;
use crate::scheduler::entry::ScheduleSpec;

/// `add-task --file task.json` or flag-by-flag. Upserts, so it also edits
/// existing tasks.
pub async fn add_task(args: &[String]) -> Result<()> {
    let task = if let Some(path) = flag_value(args, "--file") {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        serde_json::from_str::<Task>(&raw).with_context(|| format!("parsing {path}"))?
    } else {
        task_from_flags(args)?
    };

    // Reject unschedulable configs before they reach the store.
    ScheduleSpec::compile(task.schedule_type, &task.schedule_config)
        .with_context(|| format!("schedule of task {}", task.id))?;

    let config = Config::from_env();
    let store = TaskStore::open(&config.database_url)?;
    store.upsert(&task).await?;
    print_success(&format!(
        "task {} scheduled ({})",
        task.id,
        if task.enabled { "enabled" } else { "disabled" }
    ));
    Ok(())
}

fn task_from_flags(args: &[String]) -> Result<Task> {
    let required = |name: &str| -> Result<String> {
        flag_value(args, name)
            .map(str::to_string)
            .ok_or_else(|| UsageError(format!("add-task requires {name} (or --file)")).into())
    };
    let id = required("--id")?;
    let plugin_name = required("--plugin")?;
    let name = flag_value(args, "--name").unwrap_or(&id).to_string();

    let schedule_type = match flag_value(args, "--schedule-type").unwrap_or("interval") {
        "interval" => ScheduleType::Interval,
        "cron" => ScheduleType::Cron,
        other => {
            return Err(UsageError(format!("unknown schedule type '{other}'")).into());
        }
    };
    let schedule_config = match flag_value(args, "--schedule-config") {
        Some(raw) => serde_json::from_str(raw).context("parsing --schedule-config")?,
        None => serde_json::json!({"interval_seconds": 3600}),
    };
    let parameters = match flag_value(args, "--parameters") {
        Some(raw) => serde_json::from_str(raw).context("parsing --parameters")?,
        None => serde_json::json!({}),
    };
    let tags = match flag_value(args, "--tags") {
        Some(raw) => serde_json::from_str(raw).context("parsing --tags")?,
        None => Vec::new(),
    };

    let now = Utc::now();
    Ok(Task {
        id,
        name,
        description: flag_value(args, "--description").map(str::to_string),
        tags,
        plugin_name,
        parameters,
        schedule_type,
        schedule_config,
        enabled: !has_flag(args, "--disabled"),
        priority: flag_value(args, "--priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5),
        max_retries: flag_value(args, "--max-retries")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3),
        timeout_seconds: flag_value(args, "--timeout").and_then(|v| v.parse().ok()),
        last_run: None,
        next_run: None,
        created_at: now,
        updated_at: now,
    })
}

pub async fn list_tasks() -> Result<()> {
    let config = Config::from_env();
    let store = TaskStore::open(&config.database_url)?;
    let tasks = store.list_all().await?;
    if tasks.is_empty() {
        print_warn("no scheduled tasks");
        return Ok(());
    }
    for task in tasks {
        let schedule = match task.schedule_type {
            ScheduleType::Interval => format!("interval {}", task.schedule_config),
            ScheduleType::Cron => format!("cron {}", task.schedule_config),
        };
        let mut section = GuideSection::new(&format!("{} ({})", task.name, task.id))
            .status("plugin", &task.plugin_name)
            .status("schedule", &schedule)
            .status("enabled", if task.enabled { "yes" } else { "no" })
            .status("priority", &task.priority.to_string());
        if let Some(last_run) = task.last_run {
            section = section.status("last run", &last_run.to_rfc3339());
        }
        if let Some(next_run) = task.next_run {
            section = section.status("next run", &next_run.to_rfc3339());
        }
        section.print();
    }
    Ok(())
}

pub async fn set_enabled(id: &str, enabled: bool) -> Result<()> {
    let config = Config::from_env();
    let store = TaskStore::open(&config.database_url)?;
    if !store.set_enabled(id, enabled).await? {
        anyhow::bail!("task {id} not found");
    }
    print_success(&format!(
        "task {id} {}",
        if enabled { "enabled" } else { "disabled" }
    ));
    Ok(())
}

pub async fn remove_task(id: &str) -> Result<()> {
    let config = Config::from_env();
    let store = TaskStore::open(&config.database_url)?;
    if !store.delete(id).await? {
        anyhow::bail!("task {id} not found");
    }
    print_success(&format!("task {id} removed"));
    Ok(())
}

pub async fn list_active() -> Result<()> {
    let config = Config::from_env();
    let gateway = BrokerGateway::open(&config.broker_url)?;
    let active = gateway.inspect_active().await?;
    if active.is_empty() {
        print_warn("no active submissions");
        return Ok(());
    }
    for sub in active {
        GuideSection::new(&sub.id)
            .status("plugin", &sub.plugin_name)
            .status("state", &format!("{:?}", sub.state).to_lowercase())
            .status("queue", &sub.queue)
            .status("priority", &sub.priority.to_string())
            .status("attempts", &format!("{}/{}", sub.attempts, sub.retries + 1))
            .print();
    }
    Ok(())
}

pub async fn status(id: &str) -> Result<()> {
    let config = Config::from_env();
    let gateway = BrokerGateway::open(&config.broker_url)?;
    let Some(sub) = gateway.status(id).await? else {
        anyhow::bail!("submission {id} not found");
    };
    println!("{}", serde_json::to_string_pretty(&sub)?);
    Ok(())
}

pub async fn cancel(id: &str, terminate: bool) -> Result<()> {
    let config = Config::from_env();
    let gateway = BrokerGateway::open(&config.broker_url)?;
    if !gateway.revoke(id, terminate).await? {
        anyhow::bail!("submission {id} is not revocable");
    }
    print_success(&format!("submission {id} revoked"));
    Ok(())
}

pub async fn cancel_plugin(name: &str, terminate: bool) -> Result<()> {
    let config = Config::from_env();
    let gateway = BrokerGateway::open(&config.broker_url)?;
    let n = gateway.revoke_by_plugin(name, terminate).await?;
    print_success(&format!("revoked {n} submission(s) of plugin {name}"));
    Ok(())
}

pub async fn health() -> Result<()> {
    let config = Config::from_env();
    let store = TaskStore::open(&config.database_url)?;
    let gateway = BrokerGateway::open(&config.broker_url)?;
    let registry = PluginRegistry::new(config.plugins_dir.clone(), config.plugin_envs_dir.clone());
    registry.scan().await?;

    let tasks = store.list_all().await?;
    let enabled_tasks = tasks.iter().filter(|t| t.enabled).count();
    let plugins = registry.list().await;
    let enabled_plugins = plugins.iter().filter(|p| p.manifest.enabled).count();
    let active = gateway.inspect_active().await?;

    GuideSection::new("Health")
        .status("plugins", &format!("{} ({} enabled)", plugins.len(), enabled_plugins))
        .status(
            "scheduled tasks",
            &format!("{} ({} enabled)", tasks.len(), enabled_tasks),
        )
        .status("active submissions", &active.len().to_string())
        .status("timestamp", &Utc::now().to_rfc3339())
        .print();
    Ok(())
}
