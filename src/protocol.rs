use crate::types::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryParam {
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self { stream: true }
    }
}

/// One inbound frame on `/ws/query`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    pub prompt: String,
    #[serde(default)]
    pub param: QueryParam,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, prompt: impl Into<String>, stream: bool) -> Self {
        Self {
            query: query.into(),
            prompt: prompt.into(),
            param: QueryParam { stream },
        }
    }

    pub fn parse_text(text: &str) -> Result<Self> {
        let request: QueryRequest = serde_json::from_str(text)
            .map_err(|e| RelayError::Validation(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let request: QueryRequest = serde_json::from_slice(bytes)
            .map_err(|e| RelayError::Validation(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(RelayError::Validation("field `query` must not be empty".to_string()).into());
        }
        if self.prompt.trim().is_empty() {
            return Err(
                RelayError::Validation("field `prompt` must not be empty".to_string()).into(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Token {
        value: String,
    },
    Metadata {
        execution_time: f64,
        image_urls: Vec<String>,
        full_response: String,
    },
    FullResult {
        value: String,
        image_urls: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl OutboundFrame {
    pub fn token(value: impl Into<String>) -> Self {
        OutboundFrame::Token {
            value: value.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            message: message.into(),
        }
    }

    /// Every frame other than `token` ends the request it belongs to.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboundFrame::Token { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundFrame::Token { .. } => "token",
            OutboundFrame::Metadata { .. } => "metadata",
            OutboundFrame::FullResult { .. } => "full_result",
            OutboundFrame::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Wall-clock seconds rounded to 4 decimal places.
pub fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 10_000.0).round() / 10_000.0
}
