//! Auth form controller.
//!
//! A UI-toolkit-free state machine for the sign-in / sign-up screen. It
//! collects credentials, invokes the auth client, and maps provider error
//! codes to user-facing messages. It never decides the resulting session:
//! the session synchronizer, independently subscribed to the auth client,
//! produces that.

use crate::auth::{AuthClient, AuthError, AuthErrorCode};
use log::debug;
use std::sync::Arc;

/// Message shown when submit is attempted with an empty field. Checked
/// before any provider call is made.
const EMPTY_FIELDS_MESSAGE: &str = "Please fill in all fields.";

const GENERIC_MESSAGE: &str = "Something went wrong. Please try again.";

/// Which provider call submit() performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFormMode {
    SignIn,
    SignUp,
}

/// Auth form state
pub struct AuthForm {
    auth: Arc<AuthClient>,
    mode: AuthFormMode,
    email: String,
    password: String,
    error: Option<String>,
    loading: bool,
}

impl AuthForm {
    /// Create a form bound to an auth client, starting in sign-in mode
    pub fn new(auth: Arc<AuthClient>) -> Self {
        Self {
            auth,
            mode: AuthFormMode::SignIn,
            email: String::new(),
            password: String::new(),
            error: None,
            loading: false,
        }
    }

    pub fn mode(&self) -> AuthFormMode {
        self.mode
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// The current user-facing error message, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_email(&mut self, value: &str) {
        self.email = value.to_string();
    }

    pub fn set_password(&mut self, value: &str) {
        self.password = value.to_string();
    }

    /// Switch between sign-in and sign-up
    ///
    /// A full reset: email, password and error are all cleared.
    pub fn toggle_mode(&mut self) {
        self.mode = match self.mode {
            AuthFormMode::SignIn => AuthFormMode::SignUp,
            AuthFormMode::SignUp => AuthFormMode::SignIn,
        };
        self.email.clear();
        self.password.clear();
        self.error = None;
    }

    /// Submit the form in its current mode
    ///
    /// Returns whether the provider call succeeded. On success no local
    /// session state changes here; on failure the mapped message is set and
    /// the loading flag is cleared.
    pub async fn submit(&mut self) -> bool {
        if self.email.trim().is_empty() || self.password.is_empty() {
            self.error = Some(EMPTY_FIELDS_MESSAGE.to_string());
            return false;
        }

        self.loading = true;
        self.error = None;

        debug!("submitting auth form (mode: {:?})", self.mode);
        let result = match self.mode {
            AuthFormMode::SignUp => self.auth.sign_up(&self.email, &self.password).await,
            AuthFormMode::SignIn => {
                self.auth
                    .sign_in_with_password(&self.email, &self.password)
                    .await
            }
        };

        self.loading = false;
        match result {
            Ok(_) => true,
            Err(error) => {
                self.error = Some(message_for(&error).to_string());
                false
            }
        }
    }
}

fn message_for(error: &AuthError) -> &'static str {
    match error.code() {
        Some(code) => error_message(code),
        None => GENERIC_MESSAGE,
    }
}

/// Map a provider error code to its user-facing message
///
/// Total over the known vocabulary; anything else falls back to a generic
/// message.
pub fn error_message(code: &AuthErrorCode) -> &'static str {
    match code {
        AuthErrorCode::CredentialNotFound => "No account found with this email.",
        AuthErrorCode::WrongCredential => "Invalid email or password.",
        AuthErrorCode::EmailInUse => "An account with this email already exists.",
        AuthErrorCode::WeakPassword => "Password should be at least 6 characters.",
        AuthErrorCode::Other(_) => GENERIC_MESSAGE,
    }
}
