pub mod config;
pub mod error;

pub use config::DigestConfig;
pub use error::{DigestError, Result};
