//! `ChatSync` backend harness library.
//!
//! An in-memory implementation of the backend boundary the synchronization
//! engine talks to: the WebSocket event channel plus the HTTP
//! request/response routes. Built for the integration test suite and for
//! running standalone during development; it deliberately has no durable
//! storage.

pub mod config;
pub mod server;
pub mod state;
