#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod pkg;
pub mod telemetry;
pub mod txn;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
