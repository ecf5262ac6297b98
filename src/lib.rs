//! Cody library crate
//!
//! Two halves share one crate: the editor-side [`client`] (request
//! orchestration, caching, automatic reindex) and the HTTP [`server`]
//! (retrieval-augmented prompting and code-edit extraction). Both speak the
//! wire types in [`protocol`].

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod sanitize;
pub mod server;
pub mod util;
