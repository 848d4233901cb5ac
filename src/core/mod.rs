//! Core types shared by every upgrade component.
//!
//! Currently this is the error taxonomy and its user-facing rendering; see
//! [`error`] for the propagation policy.

pub mod error;

pub use error::{ErrorContext, UpgradeError, user_friendly_error};
