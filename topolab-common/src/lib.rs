//! # topolab Common
//!
//! Shared utilities for the topolab components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use topolab_common::{init_logging, LogFormat};
//!
//! init_logging("info")?;
//! // or, for log shippers:
//! topolab_common::init(LogFormat::Json, "debug")?;
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
