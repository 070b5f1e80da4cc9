//! Configuration management
//!
//! Handles tenant credentials and proxy settings.

pub mod connections;
pub mod settings;

pub use connections::{ConnectionConfig, SslMode, decode_credential_token, resolve_credentials};
pub use settings::{Settings, load_settings};
