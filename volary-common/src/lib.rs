//! # Volary Common
//!
//! Shared utilities for the Volary agent components.
//!
//! ## Logging
//!
//! ```rust
//! use volary_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(component = "agent", "agent starting");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, TimedOperation};
