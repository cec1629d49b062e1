//! Fork channel wire layer between the controller and a worker process.
//!
//! # Architecture
//!
//! - **protocol**: Command and event types, opcodes and segment layouts
//! - **codec**: Frame encoder and incremental decoder for AsyncRead/AsyncWrite
//! - **transport**: Pipe and loopback-socket channels, connection descriptors

pub mod codec;
pub mod protocol;
pub mod transport;
