//! Alert notification transport

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::AlertConfig;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("no alert transport configured")]
    NotConfigured,

    #[error("alert relay rejected the request with status {0}")]
    Rejected(u16),

    #[error("alert transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("alert timed out")]
    Timeout,
}

/// Subject and plain-text body of an alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &AlertMessage) -> Result<(), NotifyError>;
}

/// Used when no alert transport is configured; every send fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredNotifier;

#[async_trait]
impl Notifier for UnconfiguredNotifier {
    async fn send(&self, _message: &AlertMessage) -> Result<(), NotifyError> {
        Err(NotifyError::NotConfigured)
    }
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    body: &'a str,
}

/// Posts alerts to an HTTP mail relay
pub struct HttpNotifier {
    client: reqwest::Client,
    config: AlertConfig,
}

impl HttpNotifier {
    pub fn new(config: AlertConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn request(&self, message: &AlertMessage) -> reqwest::RequestBuilder {
        let body = RelayRequest {
            from: &self.config.from,
            to: &self.config.recipients,
            subject: &message.subject,
            body: &message.body,
        };
        let request = self.client.post(&self.config.endpoint).json(&body);
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, message: &AlertMessage) -> Result<(), NotifyError> {
        let response = self.request(message).send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::Timeout
            } else {
                NotifyError::Transport(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        info!(
            "Alert '{}' sent to {} recipients",
            message.subject,
            self.config.recipients.len()
        );
        Ok(())
    }
}
