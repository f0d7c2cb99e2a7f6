use serde::{Deserialize, Serialize};

/// --- OPENAI CHAT COMPLETIONS SCHEMA (streaming subset) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAiMessage {
    System { content: String },
    User { content: String },
}

impl OpenAiRequest {
    /// System prompt first, then the user's query.
    pub fn streaming(model: &str, prompt: &str, query: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                OpenAiMessage::System {
                    content: prompt.to_string(),
                },
                OpenAiMessage::User {
                    content: query.to_string(),
                },
            ],
            stream: Some(true),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatChunk {
    /// Text carried by the first choice, if any.
    pub fn fragment(&self) -> Option<&str> {
        let content = self.choices.first()?.delta.content.as_deref()?;
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ProviderErrorDetails {
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug)]
pub enum LineEvent {
    Chunk(ChatChunk),
    Error(ProviderError),
    /// A `data:` payload that is not valid JSON.
    Malformed(String),
    Done,
    Skip,
}

const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Decodes one server-sent-event line from a chat completions stream.
pub fn parse_provider_line(line: &str) -> LineEvent {
    let line = line.trim_end_matches('\r');
    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim_start(),
        None => {
            if !line.is_empty() && !line.starts_with(':') {
                tracing::trace!("[STREAM] Ignoring non-data line: {}", line);
            }
            return LineEvent::Skip;
        }
    };

    if data == "[DONE]" {
        return LineEvent::Done;
    }
    if data.len() > MAX_CHUNK_BYTES {
        return LineEvent::Error(ProviderError {
            error: ProviderErrorDetails {
                message: format!("JSON chunk too large: {} bytes", data.len()),
                code: None,
                kind: None,
            },
        });
    }
    // Try Error first as it's more specific (requires "error" key)
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(chunk) = serde_json::from_str::<ChatChunk>(data) {
        return LineEvent::Chunk(chunk);
    }

    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(_) => {
            tracing::debug!(
                "[STREAM] Unknown payload shape: {}",
                crate::str_utils::first_n_chars_lossy(data, 200)
            );
            LineEvent::Skip
        }
        Err(e) => LineEvent::Malformed(format!(
            "malformed chunk ({}): {}",
            e,
            crate::str_utils::first_n_chars_lossy(data, 80)
        )),
    }
}
