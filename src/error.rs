//! Error handling for the Somnia Rust client

use std::fmt;
use thiserror::Error;

/// Unified error type for the Somnia Rust client
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] somnia_rust_auth::AuthError),

    /// Document store errors
    #[error("Store error: {0}")]
    Store(#[from] somnia_rust_store::StoreError),

    /// Billing gateway errors
    #[error("Billing error: {0}")]
    Billing(#[from] somnia_rust_billing::BillingError),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl Error {
    /// Create a new general error
    pub fn general<T: fmt::Display>(msg: T) -> Self {
        Error::General(msg.to_string())
    }
}
