//! Somnia session synchronizer
//!
//! This crate maintains the application's single belief about "who is
//! logged in right now". It subscribes to identity changes from the auth
//! client, resolves each change against the profile store (creating the
//! profile lazily on first sign-in), and broadcasts the result to its own
//! subscribers.

// Declare modules
mod event;
mod synchronizer;

// Re-export key public types
pub use event::SessionEvent;
pub use synchronizer::{SessionCallback, SessionSubscription, SessionSynchronizer};
