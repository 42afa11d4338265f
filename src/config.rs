//! Configuration: a YAML file with environment overrides.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, info};

use crate::engine::LoopSettings;
use crate::error::ConfigError;
use crate::proxy::ProxySettings;
use crate::rules::{RuleDef, RuleTable, SearchCapabilities, build_rule_table};

/// Directory name under `$HOME` when no cache directory is configured.
const DEFAULT_CACHE_DIR: &str = ".mailbot_cache";
const DEFAULT_USER_AGENT: &str = concat!("mailbot/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    /// Folder watched for new mail.
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Login name. Empty means the IMAP user.
    #[serde(default)]
    pub user: String,
}

fn default_smtp_port() -> u16 {
    465
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub backoff_floor_secs: u64,
    pub backoff_ceiling_secs: u64,
    pub idle_timeout_secs: u64,
    /// Whether the server's SEARCH understands `OR`.
    pub native_or: bool,
    /// Whether the server's SEARCH understands `NOT`.
    pub native_not: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff_floor_secs: 60,
            backoff_ceiling_secs: 3600,
            idle_timeout_secs: 1739,
            native_or: true,
            native_not: true,
        }
    }
}

impl EngineConfig {
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            backoff_floor: Duration::from_secs(self.backoff_floor_secs),
            backoff_ceiling: Duration::from_secs(self.backoff_ceiling_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    pub fn capabilities(&self) -> SearchCapabilities {
        SearchCapabilities {
            or: self.native_or,
            not: self.native_not,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// From address of proxy replies.
    pub send_from: String,
    #[serde(default)]
    pub kindle_send_from: Option<String>,
    #[serde(default)]
    pub kindle_send_to: Option<String>,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_download")]
    pub max_download_size: usize,
    #[serde(default = "default_image_timeout")]
    pub image_timeout_secs: u64,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_download() -> usize {
    100 * 1024 * 1024
}

fn default_image_timeout() -> u64 {
    10
}

fn default_max_images() -> usize {
    100
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl ProxyConfig {
    pub fn settings(&self) -> ProxySettings {
        ProxySettings {
            send_from: self.send_from.clone(),
            kindle_send_from: self.kindle_send_from.clone(),
            kindle_send_to: self.kindle_send_to.clone(),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_download_size: self.max_download_size,
            image_timeout: Duration::from_secs(self.image_timeout_secs),
            max_images: self.max_images,
        }
    }
}

/// Everything read from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

impl AppConfig {
    /// Read and parse a YAML config file, then apply process environment
    /// overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        info!(path = %path.display(), rules = config.rules.len(), "config loaded");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if config.smtp.user.is_empty() {
            config.smtp.user = config.imap.user.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Host overrides: `MAILBOT_IMAP_HOST`, `MAILBOT_SMTP_HOST`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MAILBOT_IMAP_HOST").filter(|h| !h.is_empty()) {
            debug!(host = %host, "IMAP host overridden from environment");
            self.imap.host = host;
        }
        if let Some(host) = lookup("MAILBOT_SMTP_HOST").filter(|h| !h.is_empty()) {
            debug!(host = %host, "SMTP host overridden from environment");
            self.smtp.host = host;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("imap.host", &self.imap.host),
            ("imap.user", &self.imap.user),
            ("smtp.host", &self.smtp.host),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: key.to_string(),
                    hint: "set it in the config file".to_string(),
                });
            }
        }
        if self.engine.backoff_floor_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "engine.backoff_floor_secs".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.engine.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "engine.idle_timeout_secs".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Build the rule table. Content-proxy rules require a `proxy` section.
    pub fn rule_table(&self) -> Result<RuleTable, ConfigError> {
        let table = build_rule_table(&self.rules, self.engine.capabilities())?;
        if self.proxy.is_none()
            && let Some(rule) = table
                .rules()
                .iter()
                .find(|r| r.handler.kind() == crate::handlers::HandlerKind::ContentProxy)
        {
            return Err(ConfigError::MissingRequired {
                key: "proxy".into(),
                hint: format!("rule '{}' uses the content proxy", rule.name),
            });
        }
        Ok(table)
    }
}

/// Cache directory: `CACHE_PREFIX`, else the configured path, else
/// `~/.mailbot_cache`. A leading `~` expands to `home`.
pub fn resolve_cache_dir(
    env_prefix: Option<String>,
    configured: Option<&str>,
    home: Option<PathBuf>,
) -> PathBuf {
    let raw = env_prefix
        .filter(|p| !p.is_empty())
        .or_else(|| configured.map(str::to_string));
    let home = home.unwrap_or_else(|| PathBuf::from("."));
    match raw {
        Some(path) if path == "~" => home,
        Some(path) => match path.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => home.join(DEFAULT_CACHE_DIR),
    }
}

/// The account password: `EMAIL_PASSWORD`, else `--password`, else the
/// prompt. Empty answers are rejected.
pub fn resolve_password<P>(
    env: Option<String>,
    flag: Option<String>,
    prompt: P,
) -> Result<SecretString, ConfigError>
where
    P: FnOnce() -> io::Result<String>,
{
    let password = match env.filter(|p| !p.is_empty()) {
        Some(p) => p,
        None => match flag.filter(|p| !p.is_empty()) {
            Some(p) => p,
            None => prompt()?,
        },
    };
    if password.is_empty() {
        return Err(ConfigError::EmptyCredentials("password".into()));
    }
    Ok(SecretString::from(password))
}

/// Ask for the password on the terminal without echoing it.
pub fn prompt_password(user: &str) -> io::Result<String> {
    rpassword::prompt_password(format!("Password for {user}: "))
}
