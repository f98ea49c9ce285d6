use std::collections::HashMap;
use std::path::Path;

/// Name of the env file looked up at the plugins root and inside each
/// plugin directory.
pub const ENV_FILE_NAME: &str = ".env";

/// Parse a `KEY=VALUE` env file. `#` comments and blank lines are ignored.
/// A single wrapping pair of double quotes is stripped from the value; no
/// other quoting interpretation happens.
pub fn parse(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

fn load(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse(&content),
        Err(_) => HashMap::new(),
    }
}

/// The two-layer overlay for one plugin: the global file at the plugins
/// root first, then the per-plugin file on top of it.
pub fn overlay_for(plugins_root: &Path, plugin_dir: &Path) -> HashMap<String, String> {
    let mut vars = load(&plugins_root.join(ENV_FILE_NAME));
    vars.extend(load(&plugin_dir.join(ENV_FILE_NAME)));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_pairs() {
        let vars = parse("A=1\nB=two\n");
        assert_eq!(vars.get("A").map(String::as_str), Some("1"));
        assert_eq!(vars.get("B").map(String::as_str), Some("two"));
    }

    #[test]
    fn skips_comments_and_blanks() {
        let vars = parse("# comment\n\n  \nKEY=value\n# another\n");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("KEY").map(String::as_str), Some("value"));
    }

    #[test]
    fn strips_one_pair_of_double_quotes() {
        let vars = parse("A=\"hello world\"\nB=\"\"nested\"\"\nC=\"unterminated\n");
        assert_eq!(vars.get("A").map(String::as_str), Some("hello world"));
        assert_eq!(vars.get("B").map(String::as_str), Some("\"nested\""));
        assert_eq!(vars.get("C").map(String::as_str), Some("\"unterminated"));
    }

    #[test]
    fn value_may_contain_equals() {
        let vars = parse("URL=mysql://u:p@host/db?x=1\n");
        assert_eq!(
            vars.get("URL").map(String::as_str),
            Some("mysql://u:p@host/db?x=1")
        );
    }

    #[test]
    fn plugin_layer_overrides_global() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let plugin = root.join("demo");
        std::fs::create_dir(&plugin).expect("plugin dir");
        std::fs::write(root.join(".env"), "SHARED=global\nONLY_GLOBAL=yes\n").expect("root env");
        std::fs::write(plugin.join(".env"), "SHARED=plugin\nONLY_PLUGIN=yes\n")
            .expect("plugin env");

        let vars = overlay_for(root, &plugin);
        assert_eq!(vars.get("SHARED").map(String::as_str), Some("plugin"));
        assert_eq!(vars.get("ONLY_GLOBAL").map(String::as_str), Some("yes"));
        assert_eq!(vars.get("ONLY_PLUGIN").map(String::as_str), Some("yes"));
    }
}
