//! Observability for the session engine
//!
//! Structured logging through `tracing`, configured from the environment or
//! explicitly by the embedding application.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingConfig};

// Span macros for structured logging
pub use logging::{auth_span, mqtt_span};
