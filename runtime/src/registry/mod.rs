//! Registry client (OCI distribution v2).
//!
//! - `manifest`: manifest, index and config documents
//! - `transport`: wire operations and the in-process registry
//! - `http`: HTTP transport with token/basic authentication
//! - `credentials`: persisted registry credentials
//! - `client`: push, pull and retry

mod client;
mod credentials;
mod http;
pub mod manifest;
mod transport;

pub use client::{PullReport, PushReport, RegistryClient, RetryPolicy};
pub use credentials::{Credential, CredentialStore, PASSWORD_ENV, USERNAME_ENV};
pub use http::HttpTransport;
pub use transport::{ManifestResponse, MemoryRegistry, RegistryTransport};
