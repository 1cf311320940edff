use serde::Deserialize;

/// Ceiling for retry delays: 30 days.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 30 * 86_400;

/// Root application configuration. Loaded from environment variables
/// with the prefix `STUDIO__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub app: PublicAppConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub sequences: SequencesConfig,
    #[serde(default)]
    pub tax: TaxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Public-facing URLs used when rendering links into emails.
#[derive(Debug, Clone, Deserialize)]
pub struct PublicAppConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_unsubscribe_path")]
    pub unsubscribe_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// `resend` posts to the Resend HTTP API, `log` only logs the message.
    #[serde(default = "default_email_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_email_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_email_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequencesConfig {
    #[serde(default = "default_sequences_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Failed sends tolerated per step before the enrollment is parked
    /// in `needs_attention`. 0 disables the limit.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before retrying a failed send. 0 retries on the next tick.
    #[serde(default)]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaxConfig {
    #[serde(default = "default_tax_activity")]
    pub activity: String,
    #[serde(default = "default_apply_taxpayer_credit")]
    pub apply_taxpayer_credit: bool,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_unsubscribe_path() -> String {
    "/unsubscribe".to_string()
}
fn default_email_provider() -> String {
    "log".to_string()
}
fn default_email_api_base_url() -> String {
    "https://api.resend.com".to_string()
}
fn default_from_email() -> String {
    "noreply@example.com".to_string()
}
fn default_from_name() -> String {
    "Studio".to_string()
}
fn default_email_timeout_ms() -> u64 {
    10_000
}
fn default_sequences_enabled() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    10
}
fn default_max_backoff_secs() -> u64 {
    86_400
}
fn default_tax_activity() -> String {
    "professional_services".to_string()
}
fn default_apply_taxpayer_credit() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for PublicAppConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            unsubscribe_path: default_unsubscribe_path(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: default_email_provider(),
            api_key: String::new(),
            api_base_url: default_email_api_base_url(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            timeout_ms: default_email_timeout_ms(),
        }
    }
}

impl Default for SequencesConfig {
    fn default() -> Self {
        Self {
            enabled: default_sequences_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: 0,
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            activity: default_tax_activity(),
            apply_taxpayer_credit: default_apply_taxpayer_credit(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            app: PublicAppConfig::default(),
            email: EmailConfig::default(),
            sequences: SequencesConfig::default(),
            tax: TaxConfig::default(),
        }
    }
}

impl SequencesConfig {
    /// Reject values the scheduler and retry policy cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_secs == 0 {
            return Err("sequences.poll_interval_secs must be greater than 0".to_string());
        }
        if self.retry_backoff_secs > MAX_RETRY_BACKOFF_SECS {
            return Err(format!(
                "sequences.retry_backoff_secs must be at most {MAX_RETRY_BACKOFF_SECS}"
            ));
        }
        if self.max_backoff_secs > MAX_RETRY_BACKOFF_SECS {
            return Err(format!(
                "sequences.max_backoff_secs must be at most {MAX_RETRY_BACKOFF_SECS}"
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("STUDIO")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;
        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        self.sequences.validate().map_err(config::ConfigError::Message)
    }
}
