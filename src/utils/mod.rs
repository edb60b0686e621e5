//! # Utility Modules
//!
//! Supporting utilities used throughout the multiplexer.
//!
//! ## Components
//! - **Logging**: Structured logging initialization driven by [`crate::config::LoggingConfig`]

pub mod logging;
