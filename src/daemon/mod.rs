//! Daemon module - the groom agent service.
//!
//! Provides:
//! - Minimal HTTP/1.1 handling over TCP
//! - Pool and installed-directory operations
//! - Request routing and the transaction control surface

pub mod http;
pub mod ops;
pub mod server;

pub use http::HttpError;
pub use ops::OpError;
pub use server::{run, Server, ServerHandle};
