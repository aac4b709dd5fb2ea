use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};

use crate::error::{AppError, Result};

/// SmsHub service code of the Fora app
const SERVICE_FORA: &str = "gu";
const COUNTRY_UKRAINE: &str = "1";
const STATUS_ACCESS_CANCEL: &str = "8";

/// Error codes SmsHub answers with instead of a payload
const ERRORS: [(&str, &str); 12] = [
    ("SERVER_ERROR", "Server error"),
    ("BANNED", "Account banned"),
    ("NO_KEY", "Key is empty"),
    ("BAD_KEY", "Invalid API key"),
    ("ERROR_SQL", "Server database error"),
    ("BAD_ACTION", "General query malformed"),
    ("WRONG_SERVICE", "Wrong service identifier"),
    ("BAD_SERVICE", "Wrong service name"),
    ("NO_ACTIVATION", "Activation not found."),
    ("NO_BALANCE", "No balance"),
    ("NO_NUMBERS", "No numbers"),
    ("API_KEY_NOT_VALID", "Invalid API key status"),
];

const RETRYABLE_ERRORS: [&str; 3] = ["NO_NUMBERS", "SERVER_ERROR", "ERROR_SQL"];

/// A leased phone number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNumber {
    pub id: String,
    pub number: String,
}

impl PhoneNumber {
    /// `+380...`
    pub fn e164(&self) -> String {
        format!("+{}", self.number)
    }

    /// Stored without the leading `+`
    pub fn database_string(&self) -> &str {
        &self.number
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsStatus {
    Ok(String),
    WaitCode,
    WaitRetry,
    Cancel,
    Other(String),
}

impl SmsStatus {
    fn parse(text: &str) -> Self {
        let mut parts = text.trim().splitn(2, ':');
        match (parts.next().unwrap_or_default(), parts.next()) {
            ("STATUS_OK", Some(code)) => SmsStatus::Ok(code.to_string()),
            ("STATUS_WAIT_CODE", _) => SmsStatus::WaitCode,
            ("STATUS_WAIT_RETRY", _) => SmsStatus::WaitRetry,
            ("STATUS_CANCEL", _) => SmsStatus::Cancel,
            _ => SmsStatus::Other(text.trim().to_string()),
        }
    }
}

/// Number leasing for OTP verification
#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn get_phone_number(&self) -> Result<PhoneNumber>;

    async fn get_status(&self, id: &str) -> Result<SmsStatus>;

    async fn cancel(&self, id: &str) -> Result<()>;
}

/// Polls for the OTP code every `interval` until `timeout`
///
/// On timeout the number is cancelled and a retryable error is returned.
pub async fn wait_for_code(
    sms: &dyn SmsProvider,
    number: &PhoneNumber,
    timeout: Duration,
    interval: Duration,
) -> Result<String> {
    let step = interval.as_millis().max(1);
    let polls = timeout.as_millis().div_ceil(step);

    for _ in 0..polls {
        match sms.get_status(&number.id).await? {
            SmsStatus::Ok(code) => return Ok(code),
            SmsStatus::WaitCode | SmsStatus::WaitRetry => tokio::time::sleep(interval).await,
            SmsStatus::Cancel => return Err(AppError::Sms("STATUS_CANCEL".to_string())),
            SmsStatus::Other(status) => {
                return Err(AppError::Sms(format!("Unexpected status: {status}")))
            }
        }
    }

    tracing::warn!(id = %number.id, "Timed out waiting for the OTP code");
    sms.cancel(&number.id).await?;
    Err(AppError::Retryable("getCode timed out".to_string()))
}

/// Maps SmsHub error answers to errors
fn check_response(text: &str) -> Result<()> {
    let first = text.split(':').next().unwrap_or_default().trim();
    match ERRORS.iter().find(|(code, _)| *code == first) {
        Some((code, message)) if RETRYABLE_ERRORS.contains(code) => {
            Err(AppError::Retryable(message.to_string()))
        }
        Some((_, message)) => Err(AppError::Sms(message.to_string())),
        None => Ok(()),
    }
}

/// reqwest implementation of [`SmsProvider`]
#[derive(Debug, Clone)]
pub struct SmsHubClient {
    http: Client,
    api_url: String,
    api_key: Secret<String>,
}

impl SmsHubClient {
    pub fn new(api_url: impl Into<String>, api_key: Secret<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key,
        })
    }

    async fn request(&self, query: &[(&str, &str)]) -> Result<String> {
        let text = self
            .http
            .get(&self.api_url)
            .query(query)
            .query(&[("api_key", self.api_key.expose_secret().as_str())])
            .send()
            .await?
            .text()
            .await?;

        check_response(&text)?;
        Ok(text)
    }
}

#[async_trait]
impl SmsProvider for SmsHubClient {
    #[tracing::instrument(skip_all)]
    async fn get_phone_number(&self) -> Result<PhoneNumber> {
        let text = self
            .request(&[
                ("action", "getNumber"),
                ("service", SERVICE_FORA),
                ("country", COUNTRY_UKRAINE),
            ])
            .await?;

        match text.trim().split(':').collect::<Vec<_>>().as_slice() {
            ["ACCESS_NUMBER", id, number] => {
                tracing::info!(id = %id, "Leased phone number");
                Ok(PhoneNumber {
                    id: id.to_string(),
                    number: number.to_string(),
                })
            }
            _ => Err(AppError::Sms(format!("Unexpected getNumber response: {text}"))),
        }
    }

    async fn get_status(&self, id: &str) -> Result<SmsStatus> {
        let text = self.request(&[("action", "getStatus"), ("id", id)]).await?;
        Ok(SmsStatus::parse(&text))
    }

    #[tracing::instrument(skip(self))]
    async fn cancel(&self, id: &str) -> Result<()> {
        self.request(&[
            ("action", "setStatus"),
            ("id", id),
            ("status", STATUS_ACCESS_CANCEL),
        ])
        .await?;
        Ok(())
    }
}
