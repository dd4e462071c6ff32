//! JSON-RPC over `Content-Length` framed streams.

pub mod codec;
mod server;

pub use server::{serve, serve_connection};
