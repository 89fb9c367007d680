use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header carrying the number of failed delivery attempts so far.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// An outbound mail request as it travels through the broker.
///
/// Producers written against the older service emit capitalised keys, so both spellings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMailRequest {
    #[serde(alias = "To")]
    pub to: String,
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Subject")]
    pub subject: String,
    #[serde(default, alias = "Text", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, alias = "Html", skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, alias = "Category")]
    pub category: String,
}

impl OutboundMailRequest {
    pub fn text(to: &str, subject: &str, body: &str, category: &str) -> Self {
        Self {
            to: to.to_string(),
            name: String::new(),
            subject: subject.to_string(),
            text: Some(body.to_string()),
            html: None,
            category: category.to_string(),
        }
    }

    /// Text body, ignoring an empty string.
    pub fn text_body(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }

    /// HTML body, ignoring an empty string.
    pub fn html_body(&self) -> Option<&str> {
        self.html.as_deref().filter(|h| !h.is_empty())
    }
}

/// How the delivery pipeline settles a message whose body cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Negative-ack with requeue, leaving the message on the work queue.
    #[default]
    Requeue,
    /// Publish straight to the dead-letter queue.
    DeadLetter,
}

/// Message metadata carried alongside a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders(BTreeMap<String, Vec<u8>>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Failed attempts recorded so far; 0 when the header is absent or unreadable.
    pub fn retry_count(&self) -> u32 {
        match self.get(RETRY_COUNT_HEADER) {
            None => 0,
            Some(raw) => decode_retry_count(raw).unwrap_or_else(|| {
                tracing::warn!("Unreadable {} header ({} bytes), treating as 0", RETRY_COUNT_HEADER, raw.len());
                0
            }),
        }
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.insert(RETRY_COUNT_HEADER, count.to_string());
        self
    }
}

// Accepts ASCII decimal as well as 4 and 8 byte big-endian integers.
fn decode_retry_count(raw: &[u8]) -> Option<u32> {
    if let Ok(text) = std::str::from_utf8(raw) {
        if let Ok(count) = text.trim().parse::<u32>() {
            return Some(count);
        }
    }
    match raw.len() {
        4 => {
            let bytes: [u8; 4] = raw.try_into().ok()?;
            u32::try_from(i32::from_be_bytes(bytes)).ok()
        }
        8 => {
            let bytes: [u8; 8] = raw.try_into().ok()?;
            u32::try_from(i64::from_be_bytes(bytes)).ok()
        }
        _ => None,
    }
}

/// Broker position of a received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub queue: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.queue, self.partition, self.offset)
    }
}

/// A message handed to a consumer, to be settled exactly once with ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}
