use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;
use crate::security::secret_store::{
    DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_UPLOAD_BYTES, UploadPolicy,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The application being installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application root; whitelisted commands run here.
    #[serde(default = "default_app_root")]
    pub root: String,

    /// Env file holding APP_KEY, relative to `root` unless absolute.
    #[serde(default = "default_env_file")]
    pub env_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateConfig {
    /// Failed attempts from one IP that trigger a lockout.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Trailing window in which failures are counted.
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: u64,

    /// Failures older than this are pruned on every write.
    #[serde(default = "default_attempt_retention_hours")]
    pub attempt_retention_hours: u64,

    /// Hard cap on the attempt log; oldest entries go first.
    #[serde(default = "default_max_logged_attempts")]
    pub max_logged_attempts: usize,

    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: u64,

    /// Honor X-Forwarded-For / X-Real-IP / CF-Connecting-IP.
    #[serde(default = "default_true")]
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Storage directory (default: data_dir/secrets)
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Kill whitelisted commands after this many seconds (0 or unset = never)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_app_root() -> String {
    ".".to_string()
}
fn default_env_file() -> String {
    ".env".to_string()
}
fn default_max_attempts() -> usize {
    5
}
fn default_lockout_minutes() -> u64 {
    15
}
fn default_attempt_retention_hours() -> u64 {
    24
}
fn default_max_logged_attempts() -> usize {
    1000
}
fn default_session_timeout_minutes() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_max_upload_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}
fn default_allowed_extensions() -> Vec<String> {
    DEFAULT_ALLOWED_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect()
}
fn default_port() -> u16 {
    8471
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: default_app_root(),
            env_file: default_env_file(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_minutes: default_lockout_minutes(),
            attempt_retention_hours: default_attempt_retention_hours(),
            max_logged_attempts: default_max_logged_attempts(),
            session_timeout_minutes: default_session_timeout_minutes(),
            trust_proxy_headers: default_true(),
        }
    }
}

impl GateConfig {
    pub fn lockout_secs(&self) -> i64 {
        (self.lockout_minutes * 60) as i64
    }

    pub fn retention_secs(&self) -> i64 {
        (self.attempt_retention_hours * 3600) as i64
    }

    pub fn session_timeout_secs(&self) -> i64 {
        (self.session_timeout_minutes * 60) as i64
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_upload_bytes: default_max_upload_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl SecretsConfig {
    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_bytes: self.max_upload_bytes,
            allowed_extensions: self.allowed_extensions.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Paths::resolve()?)
    }

    /// Load (or create) the config file under explicitly resolved paths.
    pub fn load_from(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;
        config.expand_env_vars();

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        tracing::info!(path = %path.display(), "Created default config");

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    fn expand_env_vars(&mut self) {
        self.app.root = expand_env(&self.app.root);
        if let Some(ref mut dir) = self.secrets.dir {
            *dir = expand_env(dir);
        }
    }

    /// Absolute application root.
    pub fn app_root(&self) -> PathBuf {
        absolutize(&self.app.root)
    }

    /// The env file holding APP_KEY.
    pub fn env_file(&self) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.app.env_file).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            self.app_root().join(expanded)
        }
    }

    /// Directory holding the encrypted secrets.
    pub fn secrets_dir(&self) -> PathBuf {
        match self.secrets.dir {
            Some(ref dir) if !dir.is_empty() => absolutize(dir),
            _ => self.paths.secrets_dir(),
        }
    }

    /// Command timeout, if one is configured.
    pub fn command_timeout(&self) -> Option<std::time::Duration> {
        self.commands
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["app", "root"] => Ok(self.app.root.clone()),
            ["app", "env_file"] => Ok(self.app.env_file.clone()),
            ["gate", "max_attempts"] => Ok(self.gate.max_attempts.to_string()),
            ["gate", "lockout_minutes"] => Ok(self.gate.lockout_minutes.to_string()),
            ["gate", "attempt_retention_hours"] => {
                Ok(self.gate.attempt_retention_hours.to_string())
            }
            ["gate", "max_logged_attempts"] => Ok(self.gate.max_logged_attempts.to_string()),
            ["gate", "session_timeout_minutes"] => {
                Ok(self.gate.session_timeout_minutes.to_string())
            }
            ["gate", "trust_proxy_headers"] => Ok(self.gate.trust_proxy_headers.to_string()),
            ["secrets", "dir"] => Ok(self.secrets.dir.clone().unwrap_or_default()),
            ["secrets", "max_upload_bytes"] => Ok(self.secrets.max_upload_bytes.to_string()),
            ["secrets", "allowed_extensions"] => Ok(self.secrets.allowed_extensions.join(",")),
            ["commands", "timeout_secs"] => {
                Ok(self.commands.timeout_secs.unwrap_or(0).to_string())
            }
            ["server", "port"] => Ok(self.server.port.to_string()),
            ["server", "bind"] => Ok(self.server.bind.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["app", "root"] => self.app.root = value.to_string(),
            ["app", "env_file"] => self.app.env_file = value.to_string(),
            ["gate", "max_attempts"] => self.gate.max_attempts = value.parse()?,
            ["gate", "lockout_minutes"] => self.gate.lockout_minutes = value.parse()?,
            ["gate", "attempt_retention_hours"] => {
                self.gate.attempt_retention_hours = value.parse()?
            }
            ["gate", "max_logged_attempts"] => self.gate.max_logged_attempts = value.parse()?,
            ["gate", "session_timeout_minutes"] => {
                self.gate.session_timeout_minutes = value.parse()?
            }
            ["gate", "trust_proxy_headers"] => self.gate.trust_proxy_headers = value.parse()?,
            ["secrets", "dir"] => {
                self.secrets.dir = Some(value.to_string()).filter(|v| !v.is_empty())
            }
            ["secrets", "max_upload_bytes"] => self.secrets.max_upload_bytes = value.parse()?,
            ["secrets", "allowed_extensions"] => {
                self.secrets.allowed_extensions = value
                    .split(',')
                    .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            }
            ["commands", "timeout_secs"] => {
                self.commands.timeout_secs = Some(value.parse::<u64>()?).filter(|s| *s > 0)
            }
            ["server", "port"] => self.server.port = value.parse()?,
            ["server", "bind"] => self.server.bind = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => match value {
                "pretty" | "json" => self.logging.format = value.to_string(),
                _ => anyhow::bail!("logging.format must be pretty or json"),
            },
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn absolutize(raw: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(raw).to_string());
    if expanded.is_absolute() {
        return expanded;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&expanded))
        .unwrap_or(expanded)
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# install-guard configuration
# Auto-created on first run. Edit as needed.

[app]
# Root of the Laravel application being installed. Whitelisted commands
# run here. Supports ~ and ${VAR}.
root = "."
# Env file holding APP_KEY (relative to root unless absolute)
env_file = ".env"

[gate]
max_attempts = 5               # failures per IP before lockout
lockout_minutes = 15           # trailing window for counting failures
attempt_retention_hours = 24   # failures older than this are pruned
max_logged_attempts = 1000     # hard cap on the attempt log
session_timeout_minutes = 60   # wizard idle timeout
# Set to false when the installer is exposed without a reverse proxy,
# otherwise clients can spoof X-Forwarded-For.
trust_proxy_headers = true

[secrets]
# dir = "/var/lib/install-guard/secrets"   # default: data dir/secrets
max_upload_bytes = 10485760
allowed_extensions = ["p12", "pfx", "pem", "cer", "crt"]

[commands]
# timeout_secs = 600           # default: no timeout

[server]
port = 8471
bind = "127.0.0.1"

[logging]
level = "info"
format = "pretty"              # or "json" for log shippers
"#;
