//! # virtlab Common
//!
//! Shared utilities for the virtlab tools.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use virtlab_common::{init_logging_with_format, LogFormat};
//!
//! init_logging_with_format("info", LogFormat::Pretty).unwrap();
//! tracing::info!(kind = "network", name = "lab", "Network created");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_format, LogFormat};
