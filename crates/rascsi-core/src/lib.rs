//! Shared foundations for the RaSCSI control plane.
//!
//! This crate provides:
//! - The error taxonomy and result envelopes with stable return codes
//! - Logging setup
//! - Path safety checks and well-known directories
//! - The reservation memo store
//! - Connection settings

pub mod constants;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod paths;
pub mod reservations;
pub mod settings;

pub use envelope::{Envelope, ReturnCode};
pub use error::{Error, ErrorKind, Result};
pub use logging::{LogFormat, init_logging, init_test_logging};
pub use paths::{default_cfg_dir, validate_relative_path};
pub use reservations::ReservationStore;
pub use settings::ControlSettings;
