pub mod error;
pub mod types;
pub mod value;

pub use error::{LiveQueryError, Result};
pub use types::{Fingerprint, Row};
pub use value::Value;
