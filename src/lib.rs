pub mod connection;
pub mod link;
pub mod network;
pub mod protocol;
mod service;
pub mod session;

pub use connection::{Connection, ConnectionIo, ConnectionState, FrameSink};
pub use link::DeliveryOutcome;
pub use network::{SocketSettings, TlsConfig, TlsOptions, Transport};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, ConnectionConfig,
    LinkConfig, SessionConfig, Shutdown, TransportConfig,
};
pub use session::{Session, SessionState, TransferResult, TransferState, WaitMode, WaitOutcome};
