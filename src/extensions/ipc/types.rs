//! Wire types exchanged between the sandbox and the host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extensions::error::ExtensionError;

/// Request to fetch a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: FetchMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub response_type: ResponseType,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
            headers: HashMap::new(),
            body: None,
            response_type: ResponseType::Text,
        }
    }
}

/// HTTP method for fetch requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

/// How the response body is carried back over the text channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Text,
    Base64,
}

/// Response from a fetch request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResponse {
    /// Structured refusal for a target outside the allowed domains.
    pub fn rejected(url: &str, err: &ExtensionError) -> Self {
        Self {
            ok: false,
            status: 403,
            status_text: "Forbidden".to_string(),
            url: url.to_string(),
            error: Some(err.to_string()),
            ..Default::default()
        }
    }

    /// Structured failure when no HTTP response was obtained.
    pub fn failed(url: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            url: url.to_string(),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One increment of a progressively delivered result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamBatch {
    #[serde(default)]
    pub pages: Vec<Value>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Severity of a log line emitted by extension code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A message on the sandbox's outbound channel.
///
/// The channel is one-directional: requests carry a `requestId` and their
/// responses are delivered into the correlation table, never pushed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    ServerFetch {
        request_id: String,
        request: FetchRequest,
    },
    BrowserFetch {
        request_id: String,
        request: FetchRequest,
    },
    #[serde(rename = "requestCloudflareSession")]
    ChallengeSession { request_id: String, url: String },
    StreamBatch { batch: StreamBatch },
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
}

impl OutboundMessage {
    /// Request id for messages that expect a response.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ServerFetch { request_id, .. }
            | Self::BrowserFetch { request_id, .. }
            | Self::ChallengeSession { request_id, .. } => Some(request_id),
            Self::StreamBatch { .. } | Self::Log { .. } => None,
        }
    }
}

/// Result of an explicit or transparent challenge solve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeReply {
    pub success: bool,
    /// Mirrors `success`, so a reply reads like a fetch response.
    #[serde(default)]
    pub ok: bool,
    /// Set when the request was refused before any solve, e.g. 403 for a
    /// host outside the allowed domains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An invocation waiting for the runtime to pick it up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCall {
    pub call_id: u32,
    pub function: String,
    pub args: Vec<Value>,
}

/// How an invocation inside the isolate settled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledCall {
    pub ok: bool,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub not_found: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}
