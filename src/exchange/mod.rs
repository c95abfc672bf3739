pub mod client;
pub mod rate_limit;
pub mod retry;

pub use client::BybitClient;
pub use retry::retry_with_backoff;
