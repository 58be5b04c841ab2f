//! # Data Retrieval Module
//!
//! One-shot request/response access to the query endpoint, for data that is
//! fetched periodically rather than streamed.
//!
//! ## Contained Modules:
//!
//! - **`query_http`**: `QueryClient`, a `reqwest` + `reqwest-middleware`
//!   client posting `{query, variables}` with automatic retries and
//!   exponential backoff.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Query client with retry middleware.
pub mod query_http;

pub use query_http::{decode_envelope, QueryClient};
