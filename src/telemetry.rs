//! Run-scoped log buffering and shipping to Grafana Loki.
//!
//! Every event also goes to the regular `fmt` layer; the buffer only exists
//! so that a maintenance run can push its logs in one request when it ends.

use std::fmt::{self, Write as _};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::config::Config;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Shared buffer filled by [`BufferLayer`] and drained by [`LogShipper`]
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<LogRecord>>>);

impl LogBuffer {
    fn push(&self, record: LogRecord) {
        if let Ok(mut records) = self.0.lock() {
            records.push(record);
        }
    }

    /// Removes and returns everything buffered so far
    pub fn take(&self) -> Vec<LogRecord> {
        self.0
            .lock()
            .map(|mut records| std::mem::take(&mut *records))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|records| records.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `tracing` layer that copies every event into a [`LogBuffer`]
#[derive(Debug, Clone)]
pub struct BufferLayer {
    buffer: LogBuffer,
}

impl BufferLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogRecord {
            timestamp: Utc::now(),
            level: event.metadata().level().as_str().to_lowercase(),
            message: visitor.finish(),
        });
    }
}

/// Renders `message key=value ...`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Where buffered logs are pushed
#[derive(Debug, Clone)]
pub struct LokiConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<Secret<String>>,
}

impl LokiConfig {
    /// `None` unless `LOKI_URL` is set
    pub fn from_config(config: &Config) -> Option<Self> {
        config.loki_url.as_ref().map(|url| Self {
            url: url.trim_end_matches('/').to_string(),
            user: config.loki_user.clone(),
            password: config.loki_password.clone(),
        })
    }
}

/// Flushes the log buffer once per maintenance run
#[derive(Debug, Clone)]
pub struct LogShipper {
    buffer: LogBuffer,
    loki: Option<LokiConfig>,
    http: Client,
}

impl LogShipper {
    pub fn new(buffer: LogBuffer, loki: Option<LokiConfig>) -> Self {
        Self {
            buffer,
            loki,
            http: Client::new(),
        }
    }

    /// A shipper with a private buffer and no destination
    pub fn disabled() -> Self {
        Self::new(LogBuffer::default(), None)
    }

    /// Drains the buffer, pushing it to Loki when configured
    ///
    /// Returns the number of records drained.
    pub async fn flush(&self) -> Result<usize> {
        let records = self.buffer.take();
        if records.is_empty() {
            return Ok(0);
        }
        let Some(loki) = &self.loki else {
            return Ok(records.len());
        };

        let streams: Vec<_> = records
            .iter()
            .map(|record| {
                json!({
                    "stream": { "level": record.level },
                    "values": [[
                        record.timestamp.timestamp_nanos_opt().unwrap_or_default().to_string(),
                        record.message,
                    ]],
                })
            })
            .collect();

        let mut request = self
            .http
            .post(format!("{}/loki/api/v1/push", loki.url))
            .timeout(Duration::from_secs(10))
            .json(&json!({ "streams": streams }));
        if let Some(user) = &loki.user {
            request = request.basic_auth(
                user,
                loki.password.as_ref().map(|p| p.expose_secret().as_str()),
            );
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Config(format!(
                "Loki rejected {} log records: {status} {body}",
                records.len()
            )));
        }

        Ok(records.len())
    }

    /// Runs `future`, then flushes whatever it logged, whatever its outcome
    pub async fn scoped<F, T>(&self, future: F) -> T
    where
        F: Future<Output = T>,
    {
        let output = future.await;
        // before the drain, so it ships with this run
        tracing::debug!(records = self.buffer.len(), "Shipping run logs");
        if let Err(e) = self.flush().await {
            tracing::error!(error = %e, "Failed to ship run logs");
        }
        output
    }
}
