use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_TOKEN_TTL_DAYS: i64 = 30;
const DEFAULT_TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// PayPal Orders v2 credentials and redirect targets.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PayPalConfig {
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(length(min = 1))]
    pub client_secret: String,
    /// Selects `api-m.sandbox.paypal.com` over the live host.
    #[serde(default = "default_true_bool")]
    pub sandbox: bool,
    /// Overrides the host picked by `sandbox` (used by tests and proxies).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Webhook id registered in the PayPal dashboard, needed for signature verification.
    #[serde(default)]
    pub webhook_id: Option<String>,
    pub return_url: String,
    pub cancel_url: String,
    #[serde(default = "default_brand_name")]
    pub brand_name: String,
}

impl PayPalConfig {
    pub fn api_base(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => "https://api-m.sandbox.paypal.com".to_string(),
            None => "https://api-m.paypal.com".to_string(),
        }
    }

    pub fn environment(&self) -> &'static str {
        if self.sandbox {
            "sandbox"
        } else {
            "live"
        }
    }
}

/// Regional card gateway that settles in a single fixed currency.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(length(min = 1))]
    pub client_secret: String,
    #[serde(default = "default_true_bool")]
    pub sandbox: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Shared secret for the `X-Gateway-Signature` HMAC on webhooks.
    #[validate(length(min = 16))]
    pub webhook_secret: String,
    #[validate(custom = "validate_currency_code")]
    #[serde(default = "default_settlement_currency")]
    pub settlement_currency: String,
    /// Units of settlement currency per one unit of the keyed currency.
    #[serde(default = "default_conversion_rates")]
    pub conversion_rates: HashMap<String, Decimal>,
    /// Prefix for generated merchant order ids.
    #[serde(default = "default_merchant_prefix")]
    pub merchant_order_prefix: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl GatewayConfig {
    pub fn api_base(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => "https://sandbox.gateway-payments.eu".to_string(),
            None => "https://api.gateway-payments.eu".to_string(),
        }
    }

    pub fn environment(&self) -> &'static str {
        if self.sandbox {
            "sandbox"
        } else {
            "live"
        }
    }
}

/// Direct wallet (Apple Pay / Google Pay) processor.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WalletConfig {
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(length(min = 1))]
    pub client_secret: String,
    #[serde(default = "default_true_bool")]
    pub sandbox: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Reject wallet webhooks outright instead of accepting them unverified.
    #[serde(default)]
    pub reject_unverified_webhooks: bool,
}

impl WalletConfig {
    pub fn api_base(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => "https://sandbox.wallet-processor.com".to_string(),
            None => "https://api.wallet-processor.com".to_string(),
        }
    }

    pub fn environment(&self) -> &'static str {
        if self.sandbox {
            "sandbox"
        } else {
            "live"
        }
    }
}

/// Outbound e-mail delivery.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    /// "log" writes the message to the log, "http" posts it to `api_url`.
    #[serde(default = "default_email_backend")]
    #[validate(custom = "validate_email_backend")]
    pub backend: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[validate(email)]
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            backend: default_email_backend(),
            api_url: None,
            api_key: None,
            from_address: default_from_address(),
        }
    }
}

/// Template delivery settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[validate(range(min = 1, max = 365))]
    #[serde(default = "default_token_ttl_days")]
    pub token_ttl_days: i64,
    /// Public origin used to build download links in e-mails.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            token_ttl_days: default_token_ttl_days(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Timeout applied to every payment provider HTTP call
    #[validate(range(min = 1, max = 120))]
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Seconds before bearer expiry at which provider tokens are refreshed
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: i64,

    /// Key required in `x-admin-key` for refunds, revocations and invoice updates
    #[serde(default)]
    pub admin_api_key: Option<String>,

    #[validate]
    #[serde(default)]
    pub paypal: Option<PayPalConfig>,

    #[validate]
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,

    #[validate]
    #[serde(default)]
    pub wallet: Option<WalletConfig>,

    #[validate]
    #[serde(default)]
    pub email: EmailConfig,

    #[validate]
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    /// Creates a configuration with every provider disabled.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            cors_allowed_origins: None,
            http_timeout_secs: default_http_timeout_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            admin_api_key: None,
            paypal: None,
            gateway: None,
            wallet: None,
            email: EmailConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() {
            if self.admin_api_key.as_deref().map_or(true, str::is_empty) {
                let mut err = ValidationError::new("admin_api_key_required");
                err.message = Some("Set APP__ADMIN_API_KEY outside development".into());
                errors.add("admin_api_key", err);
            }
            let sandbox_in_prod = self.paypal.as_ref().map_or(false, |p| p.sandbox)
                || self.gateway.as_ref().map_or(false, |g| g.sandbox)
                || self.wallet.as_ref().map_or(false, |w| w.sandbox);
            if sandbox_in_prod {
                let mut err = ValidationError::new("sandbox_provider_in_production");
                err.message = Some("Payment providers must use live credentials in production".into());
                errors.add("environment", err);
            }
        }

        if self.email.backend == "http" && self.email.api_url.is_none() {
            let mut err = ValidationError::new("email_api_url_required");
            err.message = Some("email.api_url is required for the http backend".into());
            errors.add("email", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true_bool() -> bool {
    true
}
fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_http_timeout_secs() -> u64 {
    15
}
fn default_token_refresh_margin_secs() -> i64 {
    DEFAULT_TOKEN_REFRESH_MARGIN_SECS
}
fn default_token_ttl_days() -> i64 {
    DEFAULT_TOKEN_TTL_DAYS
}
fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_email_backend() -> String {
    "log".to_string()
}
fn default_from_address() -> String {
    "orders@agents.market".to_string()
}
fn default_brand_name() -> String {
    "Agent Marketplace".to_string()
}
fn default_settlement_currency() -> String {
    "EUR".to_string()
}
fn default_merchant_prefix() -> String {
    "AM".to_string()
}

fn default_conversion_rates() -> HashMap<String, Decimal> {
    use rust_decimal_macros::dec;
    HashMap::from([
        ("EUR".to_string(), dec!(1)),
        ("USD".to_string(), dec!(0.92)),
        ("GBP".to_string(), dec!(1.17)),
        ("CHF".to_string(), dec!(1.04)),
        ("SEK".to_string(), dec!(0.087)),
        ("PLN".to_string(), dec!(0.23)),
    ])
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_currency_code(code: &str) -> Result<(), ValidationError> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

fn validate_email_backend(value: &str) -> Result<(), ValidationError> {
    match value {
        "log" | "http" => Ok(()),
        _ => {
            let mut err = ValidationError::new("email_backend");
            err.message = Some("Must be one of: log, http".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("marketplace_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. `config/default.toml`
/// 3. `config/{RUN_ENV}.toml`
/// 4. Environment variables (`APP__*`, nested with `__`, e.g. `APP__PAYPAL__CLIENT_ID`)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://marketplace.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!(
        paypal = app_config.paypal.is_some(),
        gateway = app_config.gateway.is_some(),
        wallet = app_config.wallet.is_some(),
        "Configuration loaded successfully"
    );
    Ok(app_config)
}
