//! Network Module Implementation
//!
//! This module owns the byte stream under an AMQP connection and turns it
//! into whole frames.
//!
//! # Components
//!
//! - `Transport`: TCP/TLS connection, exact-length frame reads with partial
//!   read recovery, frame writes and protocol header exchange
//! - `SocketSettings`: TCP socket options layered on defaults
//! - `TlsConfig` / `TlsOptions`: plain, pre-built or option-built TLS contexts
//!
//! # Features
//!
//! - Bytes of an interrupted frame read are kept and replayed on the next read
//! - Concurrent readers are serialized, writers never wait for a reader
//! - Failed connects never leak the half open socket

pub use socket::SocketSettings;
pub use tls::{TlsConfig, TlsOptions};
pub use transport::Transport;

mod socket;
mod tls;
mod transport;
