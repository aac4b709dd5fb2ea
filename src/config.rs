use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::Secret;
use serde::Deserialize;

pub const DEFAULT_FORA_API_URL: &str = "https://api.mob.fora.ua/api/2.0/exec/FZGlobal/";
pub const DEFAULT_SMSHUB_API_URL: &str = "https://smshub.org/stubs/handler_api.php";
/// Every hour, on the hour.
pub const DEFAULT_MAINTENANCE_SCHEDULE: &str = "0 0 * * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    // Fora mobile API
    pub fora_api_url: String,

    // SmsHub number leasing
    pub smshub_api_url: String,
    pub smshub_api_key: Secret<String>,

    // Scheduling
    pub maintenance_schedule: String,
    pub run_once: bool,

    // Grafana Loki (optional log shipping)
    pub loki_url: Option<String>,
    pub loki_user: Option<String>,
    pub loki_password: Option<Secret<String>>,

    pub maintenance: MaintenanceSettings,
}

/// Business constants and timings of a maintenance run
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    /// Minimum receipt value (total + discount) that triggers a referral reward
    pub referral_minimum_spend: Decimal,
    /// Bonus accrued to an account once its referral coupon is triggered
    pub referral_reward_amount: Decimal,
    /// Unused discount above which a non-referral coupon is cancelled instead of applied
    pub coupon_remainder_threshold: Decimal,
    pub otp_timeout: Duration,
    pub otp_interval: Duration,
    pub retry_interval: Duration,
    pub retry_attempts: u32,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            referral_minimum_spend: Decimal::new(100, 0),
            referral_reward_amount: Decimal::new(50, 0),
            coupon_remainder_threshold: Decimal::new(10, 0),
            otp_timeout: Duration::from_millis(40_000),
            otp_interval: Duration::from_millis(5_000),
            retry_interval: Duration::from_millis(5_000),
            retry_attempts: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let defaults = MaintenanceSettings::default();
        let maintenance = MaintenanceSettings {
            referral_minimum_spend: get_decimal(&config, "referral_minimum_spend")?
                .unwrap_or(defaults.referral_minimum_spend),
            referral_reward_amount: get_decimal(&config, "referral_reward_amount")?
                .unwrap_or(defaults.referral_reward_amount),
            coupon_remainder_threshold: get_decimal(&config, "coupon_remainder_threshold")?
                .unwrap_or(defaults.coupon_remainder_threshold),
            otp_timeout: get_millis(&config, "otp_timeout_ms")?.unwrap_or(defaults.otp_timeout),
            otp_interval: get_millis(&config, "otp_interval_ms")?.unwrap_or(defaults.otp_interval),
            retry_interval: get_millis(&config, "retry_interval_ms")?
                .unwrap_or(defaults.retry_interval),
            retry_attempts: config
                .get("retry_attempts")
                .unwrap_or(defaults.retry_attempts),
        };

        Ok(Self {
            database_url: config.get("database_url")?,

            fora_api_url: config
                .get("fora_api_url")
                .unwrap_or_else(|_| DEFAULT_FORA_API_URL.to_string()),

            smshub_api_url: config
                .get("smshub_api_url")
                .unwrap_or_else(|_| DEFAULT_SMSHUB_API_URL.to_string()),
            smshub_api_key: Secret::new(config.get("smshub_api_key")?),

            maintenance_schedule: config
                .get("maintenance_schedule")
                .unwrap_or_else(|_| DEFAULT_MAINTENANCE_SCHEDULE.to_string()),
            run_once: config.get("run_once").unwrap_or(false),

            loki_url: config.get("loki_url").ok(),
            loki_user: config.get("loki_user").ok(),
            loki_password: config
                .get::<String>("loki_password")
                .ok()
                .map(Secret::new),

            maintenance,
        })
    }
}

fn get_decimal(
    config: &config::Config,
    key: &str,
) -> Result<Option<Decimal>, config::ConfigError> {
    match config.get::<String>(key) {
        Ok(raw) => Decimal::from_str(raw.trim())
            .map(Some)
            .map_err(|e| config::ConfigError::Message(format!("{key}: {e}"))),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn get_millis(
    config: &config::Config,
    key: &str,
) -> Result<Option<Duration>, config::ConfigError> {
    match config.get::<u64>(key) {
        Ok(ms) => Ok(Some(Duration::from_millis(ms))),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
