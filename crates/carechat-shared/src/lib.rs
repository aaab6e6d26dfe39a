//! Types, wire protocol and error taxonomy shared by every carechat crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ChatError, ValidationError};
