//! Server configuration loaded from `KAIROS_*` environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development. Unparseable values fall back to the default with a
//! warning.

use std::path::PathBuf;

use chrono_tz::Tz;

use crate::calendar::GOOGLE_CALENDAR_API_BASE;
use crate::ics::InviteConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("KAIROS_TLS_CERT and KAIROS_TLS_KEY must be set together")]
    TlsPair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// WAL and session file directory.
    pub data_dir: PathBuf,
    /// Shared pgwire password.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub log_format: LogFormat,
    /// Zone for e-mail rendering, calendar payloads and "today".
    pub timezone: Tz,
    pub email_api_url: String,
    /// Unset means e-mail is not configured.
    pub email_api_key: Option<String>,
    pub email_from: String,
    pub organizer_email: String,
    pub uid_domain: String,
    pub calendar_api_url: String,
    /// Skip notifications for bookings created by privileged roles.
    pub skip_privileged_emails: bool,
    /// Lowercased; seeded with the admin role on first sign-in.
    pub admin_emails: Vec<String>,
    pub dispatch_queue: usize,
    /// Interval of the completion sweep. Unset disables it.
    pub auto_complete_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "kairos".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            log_format: LogFormat::Text,
            timezone: chrono_tz::UTC,
            email_api_url: "https://api.resend.com".into(),
            email_api_key: None,
            email_from: "Booking System <onboarding@resend.dev>".into(),
            organizer_email: "bookings@kairos.local".into(),
            uid_domain: "kairos.local".into(),
            calendar_api_url: GOOGLE_CALENDAR_API_BASE.into(),
            skip_privileged_emails: false,
            admin_emails: Vec::new(),
            dispatch_queue: 1024,
            auto_complete_secs: None,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(key, value = %v, "invalid value, using default");
                default
            }
        },
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();

        let tls_cert = non_empty(get("KAIROS_TLS_CERT"));
        let tls_key = non_empty(get("KAIROS_TLS_KEY"));
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        let log_format = match get("KAIROS_LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) if v == "text" => LogFormat::Text,
            None => LogFormat::Text,
            Some(v) => {
                tracing::warn!(value = %v, "invalid KAIROS_LOG_FORMAT, using text");
                LogFormat::Text
            }
        };

        let timezone = match get("KAIROS_TIMEZONE") {
            None => d.timezone,
            Some(name) => name.trim().parse::<Tz>().unwrap_or_else(|_| {
                tracing::warn!(value = %name, "unknown KAIROS_TIMEZONE, using UTC");
                d.timezone
            }),
        };

        let admin_emails = get("KAIROS_ADMIN_EMAILS")
            .map(|list| {
                list.split(',')
                    .map(|e| e.trim().to_ascii_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind: get("KAIROS_BIND").unwrap_or(d.bind),
            port: parse_or("KAIROS_PORT", get("KAIROS_PORT"), d.port),
            data_dir: get("KAIROS_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("KAIROS_PASSWORD").unwrap_or(d.password),
            max_connections: parse_or("KAIROS_MAX_CONNECTIONS", get("KAIROS_MAX_CONNECTIONS"), d.max_connections),
            compact_threshold: parse_or(
                "KAIROS_COMPACT_THRESHOLD",
                get("KAIROS_COMPACT_THRESHOLD"),
                d.compact_threshold,
            ),
            tls_cert,
            tls_key,
            metrics_port: non_empty(get("KAIROS_METRICS_PORT"))
                .map(|v| parse_or("KAIROS_METRICS_PORT", Some(v), 0))
                .filter(|p| *p != 0),
            log_format,
            timezone,
            email_api_url: non_empty(get("KAIROS_EMAIL_API_URL")).unwrap_or(d.email_api_url),
            email_api_key: non_empty(get("KAIROS_EMAIL_API_KEY")),
            email_from: non_empty(get("KAIROS_EMAIL_FROM")).unwrap_or(d.email_from),
            organizer_email: non_empty(get("KAIROS_ORGANIZER_EMAIL")).unwrap_or(d.organizer_email),
            uid_domain: non_empty(get("KAIROS_UID_DOMAIN")).unwrap_or(d.uid_domain),
            calendar_api_url: non_empty(get("KAIROS_CALENDAR_API_URL")).unwrap_or(d.calendar_api_url),
            skip_privileged_emails: get("KAIROS_SKIP_PRIVILEGED_EMAILS")
                .map(|v| parse_bool(&v))
                .unwrap_or(d.skip_privileged_emails),
            admin_emails,
            dispatch_queue: parse_or("KAIROS_DISPATCH_QUEUE", get("KAIROS_DISPATCH_QUEUE"), d.dispatch_queue),
            auto_complete_secs: non_empty(get("KAIROS_AUTO_COMPLETE_SECS"))
                .map(|v| parse_or("KAIROS_AUTO_COMPLETE_SECS", Some(v), 0))
                .filter(|s| *s > 0),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kairos.wal")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    pub fn invite(&self) -> InviteConfig {
        InviteConfig {
            uid_domain: self.uid_domain.clone(),
            organizer_email: self.organizer_email.clone(),
            ..InviteConfig::default()
        }
    }
}
