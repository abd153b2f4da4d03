use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compliance::SendWindow;
use crate::dispatch::DispatchConfig;
use crate::domain::message::Channel;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub compliance: ComplianceConfig,
    pub crm: CrmConfig,
    pub notifications: NotificationsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Score at which a lead is handed to a human.
    pub handoff_threshold: u8,
    /// Unanswered sends before a conversation moves to nurture.
    pub max_unanswered_sends: u32,
    /// Minimum spacing between sends to one lead.
    pub cooldown_minutes: u32,
    /// How long a nurtured lead rests before re-engagement.
    pub nurture_interval_days: u32,
    /// Age at which an `initial` lead with no scheduled message is
    /// re-driven through creation (crash recovery).
    pub initial_grace_minutes: u32,
    /// Hours without human follow-up before a handoff is flagged stale.
    pub stale_handoff_hours: u32,
    /// Hours a sent touch may sit unanswered before the scanner raises a
    /// no-response timeout.
    pub response_timeout_hours: u32,
    pub scanner_interval_secs: u64,
    pub dispatch_batch_size: u32,
    pub lease_seconds: u32,
    pub max_send_attempts: u32,
    pub retry_base_delay_seconds: u32,
    pub retry_max_delay_seconds: u32,
    /// Bounded retries for losing conditional updates.
    pub cas_retry_limit: u32,
    pub default_channel: String,
}

#[derive(Clone, Debug)]
pub struct ComplianceConfig {
    pub send_window_start_hour: u8,
    pub send_window_end_hour: u8,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub webhook_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub crm_webhook_secret: Option<String>,
    pub notifications_webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            orchestrator: OrchestratorConfig {
                handoff_threshold: 70,
                max_unanswered_sends: 3,
                cooldown_minutes: 90,
                nurture_interval_days: 14,
                initial_grace_minutes: 10,
                stale_handoff_hours: 24,
                response_timeout_hours: 72,
                scanner_interval_secs: 60,
                dispatch_batch_size: 32,
                lease_seconds: 120,
                max_send_attempts: 3,
                retry_base_delay_seconds: 60,
                retry_max_delay_seconds: 480,
                cas_retry_limit: 5,
                default_channel: "sms".to_string(),
            },
            compliance: ComplianceConfig { send_window_start_hour: 9, send_window_end_hour: 20 },
            crm: CrmConfig { webhook_secret: None },
            notifications: NotificationsConfig { webhook_url: None },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            lease_seconds: i64::from(self.lease_seconds),
            max_attempts: self.max_send_attempts,
            retry_base_delay_seconds: i64::from(self.retry_base_delay_seconds),
            retry_backoff_multiplier: 2,
            retry_max_delay_seconds: i64::from(self.retry_max_delay_seconds),
            cooldown_seconds: i64::from(self.cooldown_minutes) * 60,
        }
    }
}

impl ComplianceConfig {
    pub fn send_window(&self) -> SendWindow {
        SendWindow { start_hour: self.send_window_start_hour, end_hour: self.send_window_end_hour }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(handoff_threshold) = orchestrator.handoff_threshold {
                self.orchestrator.handoff_threshold = handoff_threshold;
            }
            if let Some(max_unanswered_sends) = orchestrator.max_unanswered_sends {
                self.orchestrator.max_unanswered_sends = max_unanswered_sends;
            }
            if let Some(cooldown_minutes) = orchestrator.cooldown_minutes {
                self.orchestrator.cooldown_minutes = cooldown_minutes;
            }
            if let Some(nurture_interval_days) = orchestrator.nurture_interval_days {
                self.orchestrator.nurture_interval_days = nurture_interval_days;
            }
            if let Some(initial_grace_minutes) = orchestrator.initial_grace_minutes {
                self.orchestrator.initial_grace_minutes = initial_grace_minutes;
            }
            if let Some(stale_handoff_hours) = orchestrator.stale_handoff_hours {
                self.orchestrator.stale_handoff_hours = stale_handoff_hours;
            }
            if let Some(response_timeout_hours) = orchestrator.response_timeout_hours {
                self.orchestrator.response_timeout_hours = response_timeout_hours;
            }
            if let Some(scanner_interval_secs) = orchestrator.scanner_interval_secs {
                self.orchestrator.scanner_interval_secs = scanner_interval_secs;
            }
            if let Some(dispatch_batch_size) = orchestrator.dispatch_batch_size {
                self.orchestrator.dispatch_batch_size = dispatch_batch_size;
            }
            if let Some(lease_seconds) = orchestrator.lease_seconds {
                self.orchestrator.lease_seconds = lease_seconds;
            }
            if let Some(max_send_attempts) = orchestrator.max_send_attempts {
                self.orchestrator.max_send_attempts = max_send_attempts;
            }
            if let Some(retry_base_delay_seconds) = orchestrator.retry_base_delay_seconds {
                self.orchestrator.retry_base_delay_seconds = retry_base_delay_seconds;
            }
            if let Some(retry_max_delay_seconds) = orchestrator.retry_max_delay_seconds {
                self.orchestrator.retry_max_delay_seconds = retry_max_delay_seconds;
            }
            if let Some(cas_retry_limit) = orchestrator.cas_retry_limit {
                self.orchestrator.cas_retry_limit = cas_retry_limit;
            }
            if let Some(default_channel) = orchestrator.default_channel {
                self.orchestrator.default_channel = default_channel;
            }
        }

        if let Some(compliance) = patch.compliance {
            if let Some(start_hour) = compliance.send_window_start_hour {
                self.compliance.send_window_start_hour = start_hour;
            }
            if let Some(end_hour) = compliance.send_window_end_hour {
                self.compliance.send_window_end_hour = end_hour;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(webhook_secret_value) = crm.webhook_secret {
                self.crm.webhook_secret = Some(webhook_secret_value.into());
            }
        }

        if let Some(notifications) = patch.notifications {
            if let Some(webhook_url) = notifications.webhook_url {
                self.notifications.webhook_url = Some(webhook_url);
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEADFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEADFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_ORCHESTRATOR_HANDOFF_THRESHOLD") {
            self.orchestrator.handoff_threshold =
                parse_u8("LEADFLOW_ORCHESTRATOR_HANDOFF_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_ORCHESTRATOR_COOLDOWN_MINUTES") {
            self.orchestrator.cooldown_minutes =
                parse_u32("LEADFLOW_ORCHESTRATOR_COOLDOWN_MINUTES", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_ORCHESTRATOR_SCANNER_INTERVAL_SECS") {
            self.orchestrator.scanner_interval_secs =
                parse_u64("LEADFLOW_ORCHESTRATOR_SCANNER_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_ORCHESTRATOR_LEASE_SECONDS") {
            self.orchestrator.lease_seconds =
                parse_u32("LEADFLOW_ORCHESTRATOR_LEASE_SECONDS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_ORCHESTRATOR_MAX_SEND_ATTEMPTS") {
            self.orchestrator.max_send_attempts =
                parse_u32("LEADFLOW_ORCHESTRATOR_MAX_SEND_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_COMPLIANCE_SEND_WINDOW_START_HOUR") {
            self.compliance.send_window_start_hour =
                parse_u8("LEADFLOW_COMPLIANCE_SEND_WINDOW_START_HOUR", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_COMPLIANCE_SEND_WINDOW_END_HOUR") {
            self.compliance.send_window_end_hour =
                parse_u8("LEADFLOW_COMPLIANCE_SEND_WINDOW_END_HOUR", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_CRM_WEBHOOK_SECRET") {
            self.crm.webhook_secret = Some(value.into());
        }

        if let Some(value) = read_env("LEADFLOW_NOTIFICATIONS_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(value);
        }

        if let Some(value) = read_env("LEADFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_PORT") {
            self.server.port = parse_u16("LEADFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("LEADFLOW_LOGGING_LEVEL").or_else(|| read_env("LEADFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADFLOW_LOGGING_FORMAT").or_else(|| read_env("LEADFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(webhook_secret) = overrides.crm_webhook_secret {
            self.crm.webhook_secret = Some(webhook_secret.into());
        }
        if let Some(webhook_url) = overrides.notifications_webhook_url {
            self.notifications.webhook_url = Some(webhook_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_orchestrator(&self.orchestrator)?;
        validate_compliance(&self.compliance)?;
        validate_crm(&self.crm)?;
        validate_notifications(&self.notifications)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadflow.toml"), PathBuf::from("config/leadflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_orchestrator(orchestrator: &OrchestratorConfig) -> Result<(), ConfigError> {
    if orchestrator.handoff_threshold == 0 || orchestrator.handoff_threshold > 100 {
        return Err(ConfigError::Validation(
            "orchestrator.handoff_threshold must be in range 1..=100".to_string(),
        ));
    }
    if orchestrator.max_unanswered_sends == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.max_unanswered_sends must be greater than zero".to_string(),
        ));
    }
    if orchestrator.cooldown_minutes == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.cooldown_minutes must be greater than zero".to_string(),
        ));
    }
    if orchestrator.nurture_interval_days == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.nurture_interval_days must be greater than zero".to_string(),
        ));
    }
    if orchestrator.response_timeout_hours == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.response_timeout_hours must be greater than zero".to_string(),
        ));
    }
    if orchestrator.scanner_interval_secs < 5 {
        return Err(ConfigError::Validation(
            "orchestrator.scanner_interval_secs must be at least 5".to_string(),
        ));
    }
    if orchestrator.dispatch_batch_size == 0 || orchestrator.dispatch_batch_size > 500 {
        return Err(ConfigError::Validation(
            "orchestrator.dispatch_batch_size must be in range 1..=500".to_string(),
        ));
    }
    if orchestrator.lease_seconds < 30 {
        return Err(ConfigError::Validation(
            "orchestrator.lease_seconds must be at least 30".to_string(),
        ));
    }
    if orchestrator.max_send_attempts == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.max_send_attempts must be greater than zero".to_string(),
        ));
    }
    if orchestrator.retry_base_delay_seconds == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.retry_base_delay_seconds must be greater than zero".to_string(),
        ));
    }
    if orchestrator.retry_max_delay_seconds < orchestrator.retry_base_delay_seconds {
        return Err(ConfigError::Validation(
            "orchestrator.retry_max_delay_seconds must not be below the base delay".to_string(),
        ));
    }
    if orchestrator.cas_retry_limit == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.cas_retry_limit must be greater than zero".to_string(),
        ));
    }
    if Channel::parse(&orchestrator.default_channel).is_none() {
        return Err(ConfigError::Validation(format!(
            "orchestrator.default_channel must be one of sms|email, got `{}`",
            orchestrator.default_channel
        )));
    }

    Ok(())
}

fn validate_compliance(compliance: &ComplianceConfig) -> Result<(), ConfigError> {
    if compliance.send_window_start_hour > 23 || compliance.send_window_end_hour > 23 {
        return Err(ConfigError::Validation(
            "compliance send window hours must be in range 0..=23".to_string(),
        ));
    }
    if compliance.send_window_start_hour >= compliance.send_window_end_hour {
        return Err(ConfigError::Validation(
            "compliance.send_window_start_hour must be before send_window_end_hour".to_string(),
        ));
    }
    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if let Some(secret) = &crm.webhook_secret {
        if secret.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "crm.webhook_secret must not be empty when set".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_notifications(notifications: &NotificationsConfig) -> Result<(), ConfigError> {
    if let Some(url) = &notifications.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "notifications.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u8(key: &str, value: &str) -> Result<u8, ConfigError> {
    value.parse::<u8>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    orchestrator: Option<OrchestratorPatch>,
    compliance: Option<CompliancePatch>,
    crm: Option<CrmPatch>,
    notifications: Option<NotificationsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    handoff_threshold: Option<u8>,
    max_unanswered_sends: Option<u32>,
    cooldown_minutes: Option<u32>,
    nurture_interval_days: Option<u32>,
    initial_grace_minutes: Option<u32>,
    stale_handoff_hours: Option<u32>,
    response_timeout_hours: Option<u32>,
    scanner_interval_secs: Option<u64>,
    dispatch_batch_size: Option<u32>,
    lease_seconds: Option<u32>,
    max_send_attempts: Option<u32>,
    retry_base_delay_seconds: Option<u32>,
    retry_max_delay_seconds: Option<u32>,
    cas_retry_limit: Option<u32>,
    default_channel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompliancePatch {
    send_window_start_hour: Option<u8>,
    send_window_end_hour: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    webhook_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsPatch {
    webhook_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator.handoff_threshold, 70);
        assert_eq!(config.compliance.send_window_start_hour, 9);
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_LEADFLOW_WEBHOOK_SECRET", "whsec-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadflow.toml");
            fs::write(
                &path,
                r#"
[crm]
webhook_secret = "${TEST_LEADFLOW_WEBHOOK_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let secret = config
                .crm
                .webhook_secret
                .as_ref()
                .map(|value| value.expose_secret().to_string())
                .unwrap_or_default();
            ensure(secret == "whsec-from-env", "webhook secret should come from environment")?;
            Ok(())
        })();

        clear_vars(&["TEST_LEADFLOW_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_LOG_LEVEL", "warn");
        env::set_var("LEADFLOW_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warn log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["LEADFLOW_LOG_LEVEL", "LEADFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("LEADFLOW_ORCHESTRATOR_HANDOFF_THRESHOLD", "80");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[orchestrator]
handoff_threshold = 60
cooldown_minutes = 45

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.orchestrator.handoff_threshold == 80,
                "env handoff threshold should win over file and defaults",
            )?;
            ensure(
                config.orchestrator.cooldown_minutes == 45,
                "file cooldown should win over defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["LEADFLOW_DATABASE_URL", "LEADFLOW_ORCHESTRATOR_HANDOFF_THRESHOLD"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_COMPLIANCE_SEND_WINDOW_START_HOUR", "21");
        env::set_var("LEADFLOW_COMPLIANCE_SEND_WINDOW_END_HOUR", "9");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("send_window_start_hour")
            );
            ensure(has_message, "validation failure should mention the send window")
        })();

        clear_vars(&[
            "LEADFLOW_COMPLIANCE_SEND_WINDOW_START_HOUR",
            "LEADFLOW_COMPLIANCE_SEND_WINDOW_END_HOUR",
        ]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_CRM_WEBHOOK_SECRET", "whsec-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("whsec-secret-value"),
                "debug output should not contain the webhook secret",
            )?;
            Ok(())
        })();

        clear_vars(&["LEADFLOW_CRM_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn dispatch_config_mirrors_orchestrator_settings() {
        let config = AppConfig::default();
        let dispatch = config.orchestrator.dispatch_config();

        assert_eq!(dispatch.lease_seconds, 120);
        assert_eq!(dispatch.max_attempts, 3);
        assert_eq!(dispatch.cooldown_seconds, 90 * 60);
    }
}
