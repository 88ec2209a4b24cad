// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// `AMQP` 0 1 0 0, sent before the first frame of a plain AMQP connection.
pub const AMQP_HEADER_FRAME: [u8; 8] = *b"AMQP\x00\x01\x00\x00";
/// `AMQP` 2 1 0 0, the TLS negotiation token.
pub const TLS_HEADER_FRAME: [u8; 8] = *b"AMQP\x02\x01\x00\x00";

pub const FRAME_HEADER_SIZE: usize = 8;
/// data offset in 4-byte words of a frame without extended header
pub const DEFAULT_DATA_OFFSET: u8 = 2;
pub const FRAME_TYPE_AMQP: u8 = 0x00;
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Largest single read issued against the socket.
pub const SIGNED_INT_MAX: usize = i32::MAX as usize;

pub const MAX_FRAME_SIZE_BYTES: u32 = 1024 * 1024;
/// smallest max-frame-size a peer may advertise
pub const MIN_MAX_FRAME_SIZE: u32 = 512;
pub const DEFAULT_INCOMING_WINDOW: u32 = 64 * 1024;
pub const DEFAULT_OUTGOING_WINDOW: u32 = 64 * 1024;

/// performative descriptor codes
pub mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;
    pub const ERROR: u64 = 0x1d;
    pub const RECEIVED: u64 = 0x23;
    pub const ACCEPTED: u64 = 0x24;
    pub const REJECTED: u64 = 0x25;
    pub const RELEASED: u64 = 0x26;
    pub const MODIFIED: u64 = 0x27;
    pub const SOURCE: u64 = 0x28;
    pub const TARGET: u64 = 0x29;
}

/// error condition symbols
pub mod condition {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
}
