//! Common crate
//!
//! Shared error handling for Igloo.
//!
//! # Example
//! ```rust
//! use igloo_common::Error;
//! let err = Error::new("example error");
//! assert_eq!(err.to_string(), "An unknown error occurred: example error");
//! ```

pub mod error;

pub use error::{Error, Result};
