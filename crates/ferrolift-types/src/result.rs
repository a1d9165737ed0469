//! Result type alias for FerroLift operations

use crate::Error;

/// Result type alias for FerroLift operations
pub type Result<T> = std::result::Result<T, Error>;
