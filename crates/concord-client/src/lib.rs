//! Concord Client - HTTP access to the remote CRM API
//!
//! This crate provides:
//!
//! - [`remote`] - the authenticated transport and error-envelope handling
//! - [`retry`] - the bounded retry policy for transient failures
//! - [`pagination`] - offset and cursor paging behind one strategy type
//! - [`records`] - the `RemoteApi` implementation used by `concord-core`
//!
//! # Overview
//!
//! The client holds no mutable state between calls: credentials, region
//! endpoint and tunables are fixed at construction.

pub mod pagination;
pub mod records;
pub mod remote;
pub mod retry;

// Re-export main client types
pub use pagination::{Page, PageStrategy};
pub use remote::{extract_error_message, ApiVersion, RemoteClient};
pub use retry::with_retry;
