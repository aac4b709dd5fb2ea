use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Transient failure; `retry` sleeps and tries again.
    #[error("Retryable error: {0}")]
    Retryable(String),

    #[error("Data integrity violation: {0}")]
    Integrity(String),

    #[error("Unexpected response schema: {0}")]
    Schema(String),

    #[error("Out of retries after {attempts} attempts: {last}")]
    OutOfRetries { attempts: u32, last: String },

    #[error("CAPTCHA required to send an OTP")]
    CaptchaRequired,

    #[error("Referral program is disabled")]
    ReferralDisabled,

    #[error("SMS service error: {0}")]
    Sms(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Maintenance run failed: {failed} unit(s) aborted")]
    RunFailed { failed: usize },
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Retryable(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Schema(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
