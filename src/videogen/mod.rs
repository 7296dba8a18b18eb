pub mod handlers;
pub mod job_store;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod profiles;
pub mod prompt_moderation;
pub mod router;
pub mod shaper;
pub mod types;
pub mod upstream;
pub mod webhook;
pub mod webhook_signature;

pub use router::build_router;
