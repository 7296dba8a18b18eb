pub const FAL_QUEUE_URL: &str = "https://queue.fal.run";

pub const FAL_SYNC_URL: &str = "https://fal.run";

pub const REPLICATE_API_URL: &str = "https://api.replicate.com/v1";

pub const OPENAI_MODERATION_URL: &str = "https://api.openai.com/v1/moderations";

pub const DEFAULT_PORT: u16 = 10000;

/// Image uploads are capped at the axum layer before the per-profile ceiling applies
pub const MAX_MULTIPART_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Encoded payload ceiling used when a profile does not state its own
pub const DEFAULT_UPLOAD_LIMIT_BYTES: u64 = 5 * 1024 * 1024;

/// Follow-up links fetched per normalization, across all nesting levels
pub const MAX_FOLLOW_UP_LINKS: usize = 4;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "m4v"];

pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";
