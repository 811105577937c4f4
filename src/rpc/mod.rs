//! JSON-RPC codec spoken with web pages.

pub mod envelope;
pub mod error;
pub mod property;
