//! Controller API communication

pub mod client;
pub mod errors;
pub mod types;

pub use client::ControllerClient;
pub use errors::{ApiError, ApiResult};
