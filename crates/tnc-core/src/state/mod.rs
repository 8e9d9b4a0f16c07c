//! State machine module.

pub mod machine;

pub use machine::{BlockProgress, UploadContext, UploadState};
