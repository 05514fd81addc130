//! Application configuration loading and validation.
//!
//! Two files feed the process:
//! - an optional YAML settings file (`deskpilot.yaml`) with timeouts, restart
//!   and execution tuning, interpolated with `${VAR}` / `${VAR:-default}`;
//! - the JSON servers file (`mcp-servers.json`) describing every tool server
//!   and the static intent table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::intents::IntentMap;
use crate::mcp_client::types::{IntentTarget, McpServersConfig, ServerConfig};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Session manager tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Bound on spawn + handshake, unless a server overrides it.
    pub connect_timeout_secs: f64,
    /// Default bound on one `tools/call`.
    pub call_timeout_secs: f64,
    /// Connection attempts per `restart`.
    pub max_restart_attempts: u32,
    pub restart_backoff_base_ms: u64,
    pub restart_backoff_cap_ms: u64,
    /// Restarts allowed to run at once, system-wide.
    pub max_concurrent_restarts: usize,
    pub health_interval_secs: f64,
    pub health_probe_timeout_secs: f64,
    /// Ceiling on each text item of a tool result.
    pub max_result_bytes: usize,
    /// Fallback working directory for servers without `cwd`.
    pub working_dir: Option<String>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30.0,
            call_timeout_secs: 120.0,
            max_restart_attempts: 5,
            restart_backoff_base_ms: 500,
            restart_backoff_cap_ms: 10_000,
            max_concurrent_restarts: 4,
            health_interval_secs: 60.0,
            health_probe_timeout_secs: 5.0,
            max_result_bytes: 100 * 1024 * 1024,
            working_dir: None,
        }
    }
}

impl McpSettings {
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        secs(self.call_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_cap_ms)
    }

    pub fn health_interval(&self) -> Duration {
        secs(self.health_interval_secs)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        secs(self.health_probe_timeout_secs)
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Deepest allowed recovery nesting; deeper is fatal.
    pub max_depth: usize,
    /// Attempts per step before recovery escalation.
    pub max_step_attempts: u32,
    /// Base delay before retrying a transient failure (multiplied by the attempt number).
    pub transient_retry_delay_ms: u64,
    /// Bound on one attempt of one step.
    pub step_timeout_secs: f64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_step_attempts: 3,
            transient_retry_delay_ms: 1000,
            step_timeout_secs: 300.0,
        }
    }
}

impl ExecutionSettings {
    pub fn step_timeout(&self) -> Duration {
        secs(self.step_timeout_secs)
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path of the JSON servers file.
    pub servers_file: Option<String>,
    pub mcp: McpSettings,
    pub execution: ExecutionSettings,
}

/// Non-finite or negative second counts fall back to zero rather than panicking.
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Default location of the settings file.
pub fn default_config_path() -> PathBuf {
    crate::data_dir().join("deskpilot.yaml")
}

/// Default location of the servers file.
pub fn default_servers_path() -> PathBuf {
    crate::data_dir().join("mcp-servers.json")
}

/// Load the YAML settings file. A missing file yields the defaults.
pub fn load_app_config(path: &Path) -> Result<AppConfig, McpError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config: no settings file, using defaults");
        return Ok(AppConfig::default());
    }

    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let mut config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    config.servers_file = config.servers_file.map(|p| expand_tilde(&p));
    config.mcp.working_dir = config.mcp.working_dir.map(|p| expand_tilde(&p));
    Ok(config)
}

/// Load, interpolate and validate the JSON servers file.
///
/// Entries whose names start with `_` are comments. Unresolved `${VAR}`
/// placeholders are recorded on the entry rather than rejected, so one
/// server missing a token does not take the others down.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_servers_config(&raw)
}

/// Parse a servers file already in memory.
pub fn parse_servers_config(raw: &str) -> Result<McpServersConfig, McpError> {
    let root: serde_json::Value = serde_json::from_str(raw).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse servers file: {e}"),
    })?;

    let entries = root
        .get("mcpServers")
        .or_else(|| root.get("servers"))
        .and_then(|v| v.as_object())
        .ok_or_else(|| McpError::ConfigError {
            reason: "servers file has no \"mcpServers\" object".into(),
        })?;

    let mut servers = HashMap::new();
    for (name, value) in entries {
        if name.starts_with('_') {
            continue;
        }
        let mut server: ServerConfig =
            serde_json::from_value(value.clone()).map_err(|e| McpError::ConfigError {
                reason: format!("server '{name}': {e}"),
            })?;
        resolve_placeholders(&mut server);

        if !server.disabled && server.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has an empty command"),
            });
        }
        if !server.missing_env.is_empty() {
            tracing::warn!(
                server = %name,
                missing = ?server.missing_env,
                "config: server references unset environment variables"
            );
        }
        servers.insert(name.clone(), server);
    }

    let intents: HashMap<String, IntentTarget> = match root.get("intents") {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| McpError::ConfigError {
            reason: format!("invalid intents table: {e}"),
        })?,
        None => HashMap::new(),
    };

    let config = McpServersConfig { servers, intents };
    IntentMap::from_config(&config)?;
    Ok(config)
}

/// Substitute placeholders in command, args and env values.
fn resolve_placeholders(server: &mut ServerConfig) {
    let mut missing = Vec::new();
    server.command = interpolate_tracking(&server.command, &mut missing);
    for arg in server.args.iter_mut() {
        *arg = interpolate_tracking(arg, &mut missing);
    }
    for value in server.env.values_mut() {
        *value = interpolate_tracking(value, &mut missing);
    }
    if let Some(cwd) = server.cwd.take() {
        server.cwd = Some(expand_tilde(&interpolate_tracking(&cwd, &mut missing)));
    }
    missing.sort();
    missing.dedup();
    server.missing_env = missing;
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut ignored = Vec::new();
    interpolate_tracking(input, &mut ignored)
}

/// Like [`interpolate_env_vars`], recording names that had no value and no default.
fn interpolate_tracking(input: &str, missing: &mut Vec<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            match resolve_var_expr(&var_expr) {
                Some(value) => result.push_str(&value),
                None => missing.push(var_expr),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`; `None` when unset with no default.
fn resolve_var_expr(expr: &str) -> Option<String> {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        Some(std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default)))
    } else {
        std::env::var(expr).ok()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__DESKPILOT_NONEXISTENT_VAR__");
        let input = "${__DESKPILOT_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__DESKPILOT_CONFIG_VAR__", "/custom/path");
        let input = "${__DESKPILOT_CONFIG_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/custom/path");
        std::env::remove_var("__DESKPILOT_CONFIG_VAR__");
    }

    #[test]
    fn test_interpolate_tracks_missing() {
        std::env::remove_var("__DESKPILOT_MISSING_TOKEN__");
        let mut missing = Vec::new();
        let out = interpolate_tracking("token=${__DESKPILOT_MISSING_TOKEN__}", &mut missing);
        assert_eq!(out, "token=");
        assert_eq!(missing, vec!["__DESKPILOT_MISSING_TOKEN__".to_string()]);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/Documents"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = McpSettings::default();
        assert_eq!(settings.connect_timeout(), Duration::from_secs(30));
        assert_eq!(settings.max_restart_attempts, 5);
        assert_eq!(settings.max_concurrent_restarts, 4);
        assert_eq!(settings.backoff_cap(), Duration::from_secs(10));

        let exec = ExecutionSettings::default();
        assert_eq!(exec.max_depth, 5);
        assert_eq!(exec.max_step_attempts, 3);
        assert_eq!(exec.step_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_app_config_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_app_config(&dir.path().join("absent.yaml")).unwrap();
        assert!(config.servers_file.is_none());
        assert_eq!(config.execution.max_step_attempts, 3);
    }

    #[test]
    fn test_load_app_config_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "servers_file: /etc/deskpilot/servers.json\nmcp:\n  max_restart_attempts: 2\nexecution:\n  max_depth: 3\n"
        )
        .unwrap();
        let config = load_app_config(file.path()).unwrap();
        assert_eq!(config.servers_file.as_deref(), Some("/etc/deskpilot/servers.json"));
        assert_eq!(config.mcp.max_restart_attempts, 2);
        assert_eq!(config.mcp.restart_backoff_base_ms, 500);
        assert_eq!(config.execution.max_depth, 3);
    }

    #[test]
    fn test_parse_servers_skips_comment_entries() {
        let raw = r#"{
            "mcpServers": {
                "_comment": "servers below run locally",
                "notes": {"command": "notes-server", "args": ["--stdio"]},
                "old": {"command": "", "disabled": true}
            }
        }"#;
        let config = parse_servers_config(raw).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(!config.servers.contains_key("_comment"));
        assert_eq!(config.servers["notes"].args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn test_parse_servers_rejects_empty_command() {
        let raw = r#"{"mcpServers": {"broken": {"command": "  "}}}"#;
        assert!(matches!(
            parse_servers_config(raw),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_parse_servers_records_missing_env() {
        std::env::remove_var("__DESKPILOT_GH_TOKEN__");
        let raw = r#"{"mcpServers": {"github": {
            "command": "gh-server",
            "env": {"TOKEN": "${__DESKPILOT_GH_TOKEN__}"}
        }}}"#;
        let config = parse_servers_config(raw).unwrap();
        assert_eq!(
            config.servers["github"].missing_env,
            vec!["__DESKPILOT_GH_TOKEN__".to_string()]
        );
    }

    #[test]
    fn test_parse_servers_validates_intents() {
        let raw = r#"{
            "mcpServers": {"browser": {"command": "browser-server"}},
            "intents": {"open_url": {"server": "browser", "tool": "navigate"}}
        }"#;
        let config = parse_servers_config(raw).unwrap();
        assert_eq!(config.intents["open_url"].tool, "navigate");

        let bad = r#"{
            "mcpServers": {"browser": {"command": "browser-server"}},
            "intents": {"send_mail": {"server": "mail", "tool": "send"}}
        }"#;
        assert!(parse_servers_config(bad).is_err());
    }

    #[test]
    fn test_load_servers_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mcpServers": {{"alpha": {{"command": "echo"}}}}}}"#).unwrap();
        let config = load_servers_config(file.path()).unwrap();
        assert_eq!(config.servers["alpha"].command, "echo");
    }
}
