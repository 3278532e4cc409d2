pub mod error;
pub mod logger;

pub use error::{Result, WeaveError};
pub use logger::setup_logging;
