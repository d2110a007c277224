#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::TaskhubError;

/// Overrides every other way of locating the data directory.
pub const DATA_DIR_ENV: &str = "TASKHUB_DATA_DIR";

const PROJECT_MARKERS: &[&str] = &[".git", "pyproject.toml", "package.json", "Cargo.toml", "go.mod"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub sync: SyncConfig,
    pub mux: MuxConfig,
    pub events: EventsConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Empty means: nearest project root, else the current directory.
    pub dir: String,
    pub tasks_dir: String,
    pub logs_dir: String,
    pub db_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            tasks_dir: "tasks".to_owned(),
            logs_dir: "logs".to_owned(),
            db_file: "db/tasks_db.json".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// File names never treated as tasks.
    pub reserved_names: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reserved_names: vec!["README.md".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MuxConfig {
    pub tmux_command: String,
    pub session_prefix: String,
    pub shell: String,
    /// Keep the session open after the script ends until Enter is pressed.
    pub hold_on_exit: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            tmux_command: "tmux".to_owned(),
            session_prefix: "taskhub".to_owned(),
            shell: "bash".to_owned(),
            hold_on_exit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogsConfig {
    pub retention_days: u64,
    pub auto_cleanup: bool,
    pub default_tail: i64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            auto_cleanup: false,
            default_tail: 100,
        }
    }
}

/// Absolute locations of everything the hub persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub root: PathBuf,
    pub tasks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub db_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    let unix = home_config_path_unix();
    if !cfg!(windows) {
        return Ok(ConfigPaths { config_file: unix });
    }

    // Windows: prefer the Unix-style path if present for portability.
    if unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("com", "taskhub", "taskhub")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("taskhub").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

#[must_use]
pub fn tilde_path(input: &str) -> String {
    let Some(home) = home_dir() else {
        return input.to_owned();
    };
    let home_str = home.to_string_lossy();
    if let Some(rest) = input.strip_prefix(home_str.as_ref()) {
        if rest.is_empty() {
            return "~".to_owned();
        }
        if rest.starts_with(std::path::MAIN_SEPARATOR) {
            return format!("~{rest}");
        }
    }
    input.to_owned()
}

/// Expands `~` and `$VAR`, then anchors relative paths at `base`.
pub fn expand_path_from(input: &str, base: &Path) -> PathBuf {
    let p = PathBuf::from(expand_env_vars(&expand_tilde(input)));
    if p.is_absolute() { p } else { base.join(p) }
}

static ENV_VAR: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").ok());

fn expand_env_vars(input: &str) -> String {
    // Unknown variables are left as written.
    let Some(re) = ENV_VAR.as_ref() else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

/// Walks up from `start` to the first directory holding a project marker.
#[must_use]
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| PROJECT_MARKERS.iter().any(|m| dir.join(m).exists()))
        .map(Path::to_path_buf)
}

impl Config {
    pub fn validate(&self) -> Result<(), TaskhubError> {
        for (key, value) in [
            ("data.tasks_dir", &self.data.tasks_dir),
            ("data.logs_dir", &self.data.logs_dir),
            ("data.db_file", &self.data.db_file),
            ("mux.tmux_command", &self.mux.tmux_command),
            ("mux.session_prefix", &self.mux.session_prefix),
            ("mux.shell", &self.mux.shell),
        ] {
            if value.trim().is_empty() {
                return Err(TaskhubError::Config(format!("{key} must not be empty")));
            }
        }
        if self.mux.session_prefix.contains(['.', ':']) {
            return Err(TaskhubError::Config(
                "mux.session_prefix must not contain '.' or ':'".to_owned(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(TaskhubError::Config(
                "events.channel_capacity must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Resolves the data directory: `TASKHUB_DATA_DIR`, then `data.dir`, then the
    /// nearest project root above the current directory, then the current directory.
    pub fn data_root(&self) -> anyhow::Result<PathBuf> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        if let Ok(dir) = std::env::var(DATA_DIR_ENV)
            && !dir.trim().is_empty()
        {
            return Ok(expand_path_from(dir.trim(), &cwd));
        }
        if !self.data.dir.trim().is_empty() {
            return Ok(expand_path_from(self.data.dir.trim(), &cwd));
        }
        Ok(find_project_root(&cwd).unwrap_or(cwd))
    }

    pub fn layout(&self) -> anyhow::Result<DataLayout> {
        let root = self.data_root()?;
        Ok(self.layout_at(root))
    }

    #[must_use]
    pub fn layout_at(&self, root: PathBuf) -> DataLayout {
        DataLayout {
            tasks_dir: expand_path_from(&self.data.tasks_dir, &root),
            logs_dir: expand_path_from(&self.data.logs_dir, &root),
            db_file: expand_path_from(&self.data.db_file, &root),
            root,
        }
    }
}

pub fn load() -> anyhow::Result<(Config, toml_edit::DocumentMut, ConfigPaths)> {
    let paths = default_paths()?;
    let (doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, doc, paths))
}

pub fn list_resolved_toml() -> anyhow::Result<String> {
    let (cfg, _doc, _paths) = load()?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    let paths = default_paths()?;
    get_value_string_at_path(&paths.config_file, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = default_paths()?;
    set_value_string_at_path(&paths.config_file, key, value)
}

pub fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    if key_type(key).is_none() {
        return Err(TaskhubError::InvalidConfigKey(key.to_owned()).into());
    }
    Ok(lookup_value(&cfg, key).map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let item = parse_value(key, value)?;
    apply_set(&mut doc, key, item)?;

    // Validate by re-parsing the updated doc into a Config.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    String,
    List,
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "data.dir"
        | "data.tasks_dir"
        | "data.logs_dir"
        | "data.db_file"
        | "mux.tmux_command"
        | "mux.session_prefix"
        | "mux.shell" => KeyType::String,

        "mux.hold_on_exit" | "logs.auto_cleanup" => KeyType::Bool,

        "events.channel_capacity" | "logs.retention_days" | "logs.default_tail" => KeyType::Int,

        "sync.reserved_names" => KeyType::List,

        _ => return None,
    })
}

fn parse_value(key: &str, value: &str) -> anyhow::Result<toml_edit::Item> {
    let invalid = |msg: String| TaskhubError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let key_type = key_type(key).ok_or_else(|| TaskhubError::InvalidConfigKey(key.to_owned()))?;
    let item = match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(invalid)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
        KeyType::List => {
            // Comma separated: `README.md, INDEX.md`.
            let array: toml_edit::Array = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            toml_edit::value(array)
        }
    };
    Ok(item)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return Err(TaskhubError::InvalidConfigKey(key.to_owned()).into());
    }

    let mut cur = doc.as_table_mut();
    for seg in &parts[..parts.len().saturating_sub(1)] {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            TaskhubError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }

    let leaf = parts[parts.len() - 1];
    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(format_value_for_stdout)
            .collect::<Vec<_>>()
            .join(","),
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn config_validation_catches_invalid_values() {
        let mut cfg = Config::default();
        cfg.events.channel_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.mux.session_prefix = "task.hub".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        set_value_string_at_path(&path, "mux.hold_on_exit", "true").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "mux.hold_on_exit")
                .unwrap()
                .as_deref(),
            Some("true")
        );

        set_value_string_at_path(&path, "logs.retention_days", "7").unwrap();
        set_value_string_at_path(&path, "sync.reserved_names", "README.md, INDEX.md").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "sync.reserved_names")
                .unwrap()
                .as_deref(),
            Some("README.md,INDEX.md")
        );

        assert!(set_value_string_at_path(&path, "logs.retention_days", "soon").is_err());
        assert!(set_value_string_at_path(&path, "mux.backend", "screen").is_err());
        assert!(get_value_string_at_path(&path, "nope.nothing").is_err());

        let (_doc, cfg) = load_from_file(&path).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.mux.hold_on_exit);
        assert_eq!(cfg.logs.retention_days, 7);
        assert_eq!(cfg.sync.reserved_names, vec!["README.md", "INDEX.md"]);
    }

    #[test]
    fn set_keeps_existing_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# local overrides\n[mux]\nshell = \"zsh\"\n").unwrap();

        set_value_string_at_path(&path, "mux.session_prefix", "work").unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# local overrides"));
        assert!(raw.contains("shell = \"zsh\""));
        assert!(raw.contains("session_prefix = \"work\""));
    }

    #[test]
    fn layout_anchors_relative_paths_at_the_root() {
        let mut cfg = Config::default();
        let layout = cfg.layout_at(PathBuf::from("/srv/hub"));
        assert_eq!(layout.tasks_dir, PathBuf::from("/srv/hub/tasks"));
        assert_eq!(layout.db_file, PathBuf::from("/srv/hub/db/tasks_db.json"));

        cfg.data.logs_dir = "/var/log/taskhub".to_owned();
        assert_eq!(
            cfg.layout_at(PathBuf::from("/srv/hub")).logs_dir,
            PathBuf::from("/var/log/taskhub")
        );
    }

    #[test]
    fn project_root_is_the_nearest_marked_ancestor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("a/Cargo.toml"), "").unwrap();

        assert_eq!(find_project_root(&nested), Some(dir.path().join("a")));
    }
}
