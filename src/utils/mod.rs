pub mod gcs;
pub mod retry;
