use async_trait::async_trait;
use marquee_core::{ContactValidator, OutboundMailRequest};
use marquee_store::app_config::MailConfig;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Either text or html is required")]
    MissingBody,

    #[error("Text and html are mutually exclusive")]
    AmbiguousBody,

    #[error("{0} contains non-printable characters")]
    NonPrintable(&'static str),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Provider returned {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider rejected the message: {0}")]
    Rejected(String),
}

/// Outbound mail provider.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, request: &OutboundMailRequest) -> Result<(), MailError>;
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct SendPayload<'a> {
    from: Address<'a>,
    to: Vec<Address<'a>>,
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    category: &'a str,
}

/// Mailtrap send API client.
#[derive(Clone)]
pub struct MailtrapMailer {
    client: Client,
    api_url: String,
    api_token: String,
    sender_email: String,
    sender_name: String,
    validator: ContactValidator,
}

impl MailtrapMailer {
    pub fn from_config(config: &MailConfig) -> Result<Self, MailError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| MailError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_token: config.api_token.clone(),
            sender_email: config.sender_email.clone(),
            sender_name: config.sender_name.clone(),
            validator: ContactValidator::default(),
        })
    }

    fn validate(&self, request: &OutboundMailRequest) -> Result<(), MailError> {
        if !self.validator.is_valid_email(&request.to) {
            return Err(MailError::InvalidRecipient(request.to.clone()));
        }
        match (request.text_body(), request.html_body()) {
            (None, None) => return Err(MailError::MissingBody),
            (Some(_), Some(_)) => return Err(MailError::AmbiguousBody),
            (Some(text), None) if !is_printable(text) => return Err(MailError::NonPrintable("text")),
            (None, Some(html)) if !is_printable(html) => return Err(MailError::NonPrintable("html")),
            _ => {}
        }
        if !is_printable(&request.subject) {
            return Err(MailError::NonPrintable("subject"));
        }
        Ok(())
    }
}

fn is_printable(value: &str) -> bool {
    value
        .chars()
        .all(|c| matches!(c, ' '..='~' | '\n' | '\r' | '\t'))
}

#[async_trait]
impl Mailer for MailtrapMailer {
    async fn send(&self, request: &OutboundMailRequest) -> Result<(), MailError> {
        self.validate(request)?;

        let name = if request.name.is_empty() { &self.sender_name } else { &request.name };
        let payload = SendPayload {
            from: Address {
                email: &self.sender_email,
                name: Some(name.as_str()).filter(|n| !n.is_empty()),
            },
            to: vec![Address {
                email: &request.to,
                name: None,
            }],
            subject: &request.subject,
            text: request.text_body(),
            html: request.html_body(),
            category: &request.category,
        };

        debug!("Sending {} mail via {}", request.category, self.api_url);
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MailError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            error!("Mail provider returned {}", status);
            return Err(MailError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }
        if body.trim().is_empty() {
            return Err(MailError::InvalidResponse("empty response".to_string()));
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| MailError::InvalidResponse(e.to_string()))?;
        let Some(object) = parsed.as_object() else {
            return Err(MailError::InvalidResponse("response is not a JSON object".to_string()));
        };
        if object.get("success") == Some(&serde_json::Value::Bool(false)) {
            let errors = object
                .get("errors")
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(MailError::Rejected(errors));
        }

        info!("Mail sent ({})", request.category);
        Ok(())
    }
}
