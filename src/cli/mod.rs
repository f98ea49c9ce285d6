mod plugin_cmd;
mod serve;
mod task_cmd;

use anyhow::Result;

use crate::core::terminal::{print_error, GuideSection};

fn print_help() {
    GuideSection::new("Processes")
        .command("worker", "Start the plugin worker pool")
        .command("beat", "Start the scheduling loop")
        .command("cdc", "Start the binlog consumer service")
        .print();

    GuideSection::new("Plugins")
        .command("list-plugins", "List discovered plugins")
        .command("test-plugin", "Execute a plugin in-process")
        .command("reload", "Force-reload a plugin from disk")
        .command("trigger", "Submit a plugin invocation to the broker")
        .print();

    GuideSection::new("Tasks")
        .command("add-task", "Create or update a scheduled task")
        .command("list-tasks", "List scheduled tasks")
        .command("enable-task", "Enable a scheduled task")
        .command("disable-task", "Disable a scheduled task")
        .command("remove-task", "Delete a scheduled task")
        .print();

    GuideSection::new("Submissions")
        .command("list-active", "List queued and running submissions")
        .command("status", "Show one submission")
        .command("cancel", "Revoke one submission")
        .command("cancel-plugin", "Revoke all submissions of a plugin")
        .command("health", "System health summary")
        .print();

    println!("\n Usage: taskbeat <command> [options]\n");
}

/// Entry point behind `main`. Returns the process exit code: 0 on
/// success, 1 on usage errors; runtime failures propagate as `Err` and
/// exit 2.
pub async fn run_main() -> Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_help();
        return Ok(1);
    };
    let rest = &args[2..];

    match command.as_str() {
        "worker" => serve::worker(rest).await?,
        "beat" => serve::beat().await?,
        "cdc" => serve::cdc().await?,

        "list-plugins" => plugin_cmd::list_plugins().await?,
        "test-plugin" => {
            let Some(name) = positional(rest) else {
                return usage("test-plugin <name> [--param k=v ...]");
            };
            plugin_cmd::test_plugin(&name, rest).await?;
        }
        "reload" => {
            let Some(name) = positional(rest) else {
                return usage("reload <name>");
            };
            plugin_cmd::reload(&name).await?;
        }
        "trigger" => {
            let Some(name) = positional(rest) else {
                return usage("trigger <name> [--param k=v ...] [--priority high|normal]");
            };
            plugin_cmd::trigger(&name, rest).await?;
        }

        "add-task" => {
            if let Err(e) = task_cmd::add_task(rest).await {
                return match e.downcast::<UsageError>() {
                    Ok(usage_err) => usage(&usage_err.0),
                    Err(e) => Err(e),
                };
            }
        }
        "list-tasks" => task_cmd::list_tasks().await?,
        "enable-task" => {
            let Some(id) = positional(rest) else {
                return usage("enable-task <id>");
            };
            task_cmd::set_enabled(&id, true).await?;
        }
        "disable-task" => {
            let Some(id) = positional(rest) else {
                return usage("disable-task <id>");
            };
            task_cmd::set_enabled(&id, false).await?;
        }
        "remove-task" => {
            let Some(id) = positional(rest) else {
                return usage("remove-task <id>");
            };
            task_cmd::remove_task(&id).await?;
        }

        "list-active" => task_cmd::list_active().await?,
        "status" => {
            let Some(id) = positional(rest) else {
                return usage("status <submission-id>");
            };
            task_cmd::status(&id).await?;
        }
        "cancel" => {
            let Some(id) = positional(rest) else {
                return usage("cancel <submission-id> [--terminate]");
            };
            task_cmd::cancel(&id, has_flag(rest, "--terminate")).await?;
        }
        "cancel-plugin" => {
            let Some(name) = positional(rest) else {
                return usage("cancel-plugin <name> [--terminate]");
            };
            task_cmd::cancel_plugin(&name, has_flag(rest, "--terminate")).await?;
        }
        "health" => task_cmd::health().await?,

        "help" | "--help" | "-h" => {
            print_help();
        }
        unknown => {
            print_error(&format!("unknown command: {unknown}"));
            print_help();
            return Ok(1);
        }
    }
    Ok(0)
}

/// Marker for argument problems discovered inside a command handler.
#[derive(Debug)]
pub(crate) struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

fn usage(expected: &str) -> Result<i32> {
    print_error(&format!("usage: taskbeat {expected}"));
    Ok(1)
}

/// First argument that is not a flag or a flag value.
fn positional(args: &[String]) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg.starts_with("--") {
            i += if flag_takes_value(arg) { 2 } else { 1 };
        } else {
            return Some(arg.clone());
        }
    }
    None
}

fn flag_takes_value(flag: &str) -> bool {
    !matches!(flag, "--terminate" | "--disabled")
}

pub(crate) fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == name {
            return args.get(i + 1).map(String::as_str);
        }
        i += 1;
    }
    None
}

pub(crate) fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

/// Collect repeated `--param key=value` pairs into a JSON object. Values
/// parse as JSON when they can (numbers, booleans, arrays) and fall back
/// to plain strings.
pub(crate) fn parse_params(args: &[String]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--param" {
            if let Some(pair) = args.get(i + 1) {
                if let Some((key, value)) = pair.split_once('=') {
                    let parsed = serde_json::from_str(value)
                        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
                    map.insert(key.to_string(), parsed);
                }
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_skips_flags_and_their_values() {
        let args = strings(&["--priority", "high", "es_indexer", "--terminate"]);
        assert_eq!(positional(&args).as_deref(), Some("es_indexer"));
        assert_eq!(positional(&strings(&["--terminate"])), None);
    }

    #[test]
    fn params_parse_json_with_string_fallback() {
        let args = strings(&[
            "demo",
            "--param",
            "batch=25",
            "--param",
            "mode=full sync",
            "--param",
            "flags=[1,2]",
        ]);
        let params = parse_params(&args);
        assert_eq!(params["batch"], serde_json::json!(25));
        assert_eq!(params["mode"], serde_json::json!("full sync"));
        assert_eq!(params["flags"], serde_json::json!([1, 2]));
    }
}
