//! Core types shared by the MariaDB client crates.
//!
//! - [`Error`] and its variants, the error taxonomy every layer reports in
//! - [`Value`] for statement parameters and default column mapping
//! - [`Geometry`] shapes decoded from spatial columns
//! - [`IsolationLevel`] for session state

pub mod error;
pub mod geometry;
pub mod isolation;
pub mod value;

pub use error::{
    BatchError, BatchOutcome, ConfigError, ConnectionError, ConnectionErrorKind, DecodeError,
    DecodeErrorKind, Error, ProtocolError, Result, ServerError, StateError, TransactionLostError,
};
pub use geometry::{Geometry, LineString, Point, Polygon};
pub use isolation::IsolationLevel;
pub use value::Value;
