//! Somnia Rust Client Library
//!
//! A Rust client library for Somnia, the dream journal. It bundles the
//! identity provider client, the profile and dream document stores, the
//! session synchronizer, and the billing gateway behind one entry point.

pub mod config;
pub mod error;
pub mod form;

pub use somnia_rust_auth as auth;
pub use somnia_rust_billing as billing;
pub use somnia_rust_session as session;
pub use somnia_rust_store as store;

use std::sync::Arc;

use reqwest::Client;

use crate::auth::{AuthClient, AuthOptions};
use crate::billing::BillingClient;
use crate::config::ClientOptions;
use crate::form::AuthForm;
use crate::session::SessionSynchronizer;
use crate::store::{DreamClient, ProfileClient};

/// The main entry point for the Somnia Rust client
pub struct Somnia {
    /// The base URL for the Somnia backend
    pub url: String,
    /// The anonymous API key for the Somnia backend
    pub key: String,
    /// HTTP client used for requests
    pub http_client: Client,
    /// Auth client for identity management and authentication
    pub auth: Arc<AuthClient>,
    /// Client options
    pub options: ClientOptions,
}

impl Somnia {
    /// Create a new Somnia client
    ///
    /// # Arguments
    ///
    /// * `url` - The base URL for your Somnia backend
    /// * `key` - The anonymous API key for your Somnia backend
    ///
    /// # Example
    ///
    /// ```
    /// use somnia_rust::Somnia;
    ///
    /// let somnia = Somnia::new("https://api.somnia.example", "your-anon-key");
    /// ```
    pub fn new(url: &str, key: &str) -> Self {
        Self::new_with_options(url, key, ClientOptions::default())
    }

    /// Create a new Somnia client with custom options
    pub fn new_with_options(url: &str, key: &str, options: ClientOptions) -> Self {
        let mut builder = Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build().unwrap_or_else(|_| Client::new());

        let auth_options = AuthOptions {
            auto_refresh_token: options.auto_refresh_token,
            persist_session: options.persist_session,
        };
        let auth = Arc::new(AuthClient::new(url, key, http_client.clone(), auth_options));

        Self {
            url: url.to_string(),
            key: key.to_string(),
            http_client,
            auth,
            options,
        }
    }

    /// Get a reference to the auth client for identity management
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Create a client for the profile collection
    pub fn profiles(&self) -> ProfileClient {
        ProfileClient::new(&self.url, &self.key, self.http_client.clone())
    }

    /// Create a client for the dream collection
    pub fn dreams(&self) -> DreamClient {
        DreamClient::new(&self.url, &self.key, self.http_client.clone())
    }

    /// Create a client for the billing gateway
    pub fn billing(&self) -> BillingClient {
        BillingClient::new(&self.url, &self.key, self.http_client.clone())
    }

    /// Build a session synchronizer wired to this client's auth handle and
    /// profile store
    ///
    /// Must be called within a Tokio runtime. Each call builds an
    /// independent synchronizer; one per application is the expected shape.
    pub fn session_synchronizer(&self) -> SessionSynchronizer {
        SessionSynchronizer::new(self.auth.as_ref(), Arc::new(self.profiles()))
    }

    /// Build an auth form controller bound to this client's auth handle
    pub fn auth_form(&self) -> AuthForm {
        AuthForm::new(self.auth.clone())
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::config::ClientOptions;
    pub use crate::error::Error;
    pub use crate::form::{AuthForm, AuthFormMode};
    pub use crate::session::{SessionEvent, SessionSynchronizer};
    pub use crate::Somnia;
}
