/// WebSocket route served by the gateway
pub const QUERY_WS_PATH: &str = "/ws/query";

/// OpenAI API defaults
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Upper bound for a single server-sent-event line from the provider
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Generic client-facing messages; the underlying cause is only logged
pub const STREAMING_FAILED_MESSAGE: &str = "Streaming failed";
pub const BUFFERED_FAILED_MESSAGE: &str = "Failed to fetch response";

/// Artifact storage defaults
pub const DEFAULT_BUCKET: &str = "demo-bucket";
pub const DEFAULT_ARTIFACT_FOLDER: &str = "generated_images";

/// Environment variables read at startup
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_BUCKET_NAME: &str = "AWS_S3_BUCKET_NAME";
pub const ENV_SIGNING_SECRET: &str = "ARTIFACT_SIGNING_SECRET";
