//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default
//! filename. Everything except the listener address and upstream URL has a
//! default, so a minimal config is two lines. Validation runs at load time
//! so a bad upstream URL or zero timeout fails startup instead of the
//! first request.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use claude_accounts::{DEFAULT_ACCOUNTS_PATH, DEFAULT_CLIENT_ID, DEFAULT_TOKEN_ENDPOINT};

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub admin: AdminSettings,
}

/// HTTP proxy settings.
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Deadline for the upstream header exchange and buffered bodies.
    #[serde(default = "default_total_timeout")]
    pub upstream_total_timeout_secs: u64,
    /// Idle-read timeout between chunks of a streaming response.
    #[serde(default = "default_idle_timeout")]
    pub upstream_idle_timeout_secs: u64,
    /// Failover attempt cap per dispatch, including the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Account pool settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub accounts_path: String,
    /// With rotation disabled the pool pins the first document entry and
    /// the dispatcher never fails over.
    pub rotation_enabled: bool,
    pub hot_reload: bool,
    pub refresh_buffer_seconds: u64,
    pub minimum_cooldown_seconds: u64,
    pub refresh_interval_seconds: u64,
    pub watch_debounce_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            accounts_path: DEFAULT_ACCOUNTS_PATH.to_string(),
            rotation_enabled: true,
            hot_reload: true,
            refresh_buffer_seconds: 600,
            minimum_cooldown_seconds: 60,
            refresh_interval_seconds: 60,
            watch_debounce_ms: 250,
        }
    }
}

/// OAuth token endpoint settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub token_endpoint_url: String,
    pub client_id: String,
    pub refresh_timeout_secs: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            token_endpoint_url: DEFAULT_TOKEN_ENDPOINT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            refresh_timeout_secs: 30,
        }
    }
}

/// Admin listener settings. The status/control surface binds its own
/// loopback port, kept off the proxy listener.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    pub listen_addr: SocketAddr,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9190".parse().expect("valid default addr"),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_total_timeout() -> u64 {
    120
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

impl Config {
    /// Load configuration from a TOML file, then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let url = reqwest::Url::parse(&self.proxy.upstream_url)
            .map_err(|e| common::Error::Config(format!("upstream_url is not a valid URL: {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(common::Error::Config(format!(
                    "upstream_url must use http or https scheme, got: {scheme}"
                )));
            }
        }

        reqwest::Url::parse(&self.oauth.token_endpoint_url).map_err(|e| {
            common::Error::Config(format!("token_endpoint_url is not a valid URL: {e}"))
        })?;

        for (name, value) in [
            (
                "upstream_total_timeout_secs",
                self.proxy.upstream_total_timeout_secs,
            ),
            (
                "upstream_idle_timeout_secs",
                self.proxy.upstream_idle_timeout_secs,
            ),
            ("max_attempts", self.proxy.max_attempts as u64),
            ("max_connections", self.proxy.max_connections as u64),
            ("refresh_timeout_secs", self.oauth.refresh_timeout_secs),
            (
                "refresh_interval_seconds",
                self.pool.refresh_interval_seconds,
            ),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.pool.accounts_path.trim().is_empty() {
            return Err(common::Error::Config(
                "accounts_path must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Resolve the config file path from CLI arg or `CONFIG_PATH` env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("claude-rotation-proxy.toml")
    }

    /// The credentials document path with `~` expanded.
    pub fn accounts_path(&self) -> PathBuf {
        expand_tilde(&self.pool.accounts_path)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.upstream_total_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.upstream_idle_timeout_secs)
    }

    pub fn minimum_cooldown(&self) -> Duration {
        Duration::from_secs(self.pool.minimum_cooldown_seconds)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.pool.refresh_buffer_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pool.refresh_interval_seconds)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.pool.watch_debounce_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.refresh_timeout_secs)
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn minimal_toml() -> &'static str {
        r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.anthropic.com"
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, minimal_toml())).unwrap();

        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.proxy.upstream_total_timeout_secs, 120);
        assert_eq!(config.proxy.upstream_idle_timeout_secs, 30);
        assert_eq!(config.proxy.max_attempts, 3);
        assert!(config.pool.rotation_enabled);
        assert!(config.pool.hot_reload);
        assert_eq!(config.pool.refresh_buffer_seconds, 600);
        assert_eq!(config.pool.minimum_cooldown_seconds, 60);
        assert_eq!(config.pool.watch_debounce_ms, 250);
        assert_eq!(config.oauth.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.oauth.token_endpoint_url, DEFAULT_TOKEN_ENDPOINT);
        assert_eq!(config.admin.listen_addr.port(), 9190);
    }

    #[test]
    fn full_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "0.0.0.0:8787"
upstream_url = "https://api.anthropic.com"
max_attempts = 5
upstream_total_timeout_secs = 300
upstream_idle_timeout_secs = 60

[pool]
accounts_path = "/etc/rotation/accounts.json"
rotation_enabled = false
hot_reload = false
refresh_buffer_seconds = 900
minimum_cooldown_seconds = 120

[oauth]
token_endpoint_url = "https://token.example.com/oauth/token"
client_id = "custom-client"
refresh_timeout_secs = 10

[admin]
listen_addr = "127.0.0.1:9999"
"#;
        let config = Config::load(&write_config(&dir, toml)).unwrap();

        assert_eq!(config.proxy.max_attempts, 5);
        assert!(!config.pool.rotation_enabled);
        assert!(!config.pool.hot_reload);
        assert_eq!(config.accounts_path(), PathBuf::from("/etc/rotation/accounts.json"));
        assert_eq!(config.minimum_cooldown(), Duration::from_secs(120));
        assert_eq!(config.oauth.client_id, "custom-client");
        assert_eq!(config.admin.listen_addr.port(), 9999);
    }

    #[test]
    fn missing_file_errors() {
        assert!(Config::load(Path::new("/nonexistent/config.toml")).is_err());
    }

    #[test]
    fn invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&write_config(&dir, "not {{ toml")).is_err());
    }

    #[test]
    fn upstream_url_without_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "api.anthropic.com"
"#;
        let err = Config::load(&write_config(&dir, toml)).unwrap_err();
        assert!(err.to_string().contains("upstream_url"), "got: {err}");
    }

    #[test]
    fn non_http_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "ftp://files.example.com"
"#;
        let err = Config::load(&write_config(&dir, toml)).unwrap_err();
        assert!(err.to_string().contains("http or https"), "got: {err}");
    }

    #[test]
    fn zero_max_attempts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.anthropic.com"
max_attempts = 0
"#;
        let err = Config::load(&write_config(&dir, toml)).unwrap_err();
        assert!(err.to_string().contains("max_attempts"), "got: {err}");
    }

    #[test]
    fn zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.anthropic.com"
upstream_total_timeout_secs = 0
"#;
        assert!(Config::load(&write_config(&dir, toml)).is_err());
    }

    #[test]
    fn empty_accounts_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.anthropic.com"

[pool]
accounts_path = "  "
"#;
        let err = Config::load(&write_config(&dir, toml)).unwrap_err();
        assert!(err.to_string().contains("accounts_path"), "got: {err}");
    }

    #[test]
    fn bad_token_endpoint_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.anthropic.com"

[oauth]
token_endpoint_url = "not a url"
"#;
        let err = Config::load(&write_config(&dir, toml)).unwrap_err();
        assert!(err.to_string().contains("token_endpoint_url"), "got: {err}");
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { std::env::set_var("CONFIG_PATH", "/env/should-lose.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml")
        );
        unsafe { std::env::remove_var("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { std::env::set_var("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        unsafe { std::env::remove_var("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { std::env::remove_var("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("claude-rotation-proxy.toml")
        );
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde("~/.claude/accounts.json");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".claude/accounts.json"));
        }
        assert_eq!(expand_tilde("/abs/path.json"), PathBuf::from("/abs/path.json"));
    }
}
