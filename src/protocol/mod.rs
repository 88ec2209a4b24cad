//! AMQP 1.0 Protocol Implementation
//!
//! This module holds everything needed to turn AMQP frames into typed values
//! and back. It performs no I/O.
//!
//! # Components
//!
//! - `Value`: the primitive and compound AMQP type system
//! - `Performative`: typed open/begin/attach/flow/transfer/disposition/detach/end/close
//! - `Source` / `Target`: link terminus descriptors
//! - `FrameHeader`, `encode_frame`, `decode_frame`: the frame codec used by the transport

pub use constants::{
    condition, descriptor, AMQP_HEADER_FRAME, DEFAULT_DATA_OFFSET, DEFAULT_INCOMING_WINDOW,
    DEFAULT_OUTGOING_WINDOW, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP, FRAME_TYPE_SASL,
    MAX_FRAME_SIZE_BYTES, MIN_MAX_FRAME_SIZE, SIGNED_INT_MAX, TLS_HEADER_FRAME,
};
pub use endpoints::{Source, Target};
pub use fields::FieldMap;
pub use frame::{
    decode_empty_frame, decode_frame, encode_frame, encoded_frame_size, Frame, FrameHeader,
};
pub use performatives::{
    AmqpError, Attach, Begin, Close, DeliveryState, Detach, Disposition, End, Flow, Open,
    Performative, ReceiverSettleMode, Role, SenderSettleMode, Transfer,
};
pub use types::Value;

mod constants;
mod endpoints;
mod fields;
mod frame;
mod performatives;
mod types;
