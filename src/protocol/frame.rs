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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::{DEFAULT_DATA_OFFSET, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP};
use super::Performative;
use crate::{AppError, AppResult};

/// The fixed 8 byte prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// total frame size including this header
    pub size: u32,
    /// start of the frame body in 4 byte words
    pub data_offset: u8,
    pub frame_type: u8,
    pub channel: u16,
}

impl FrameHeader {
    pub fn parse(header: &[u8]) -> AppResult<FrameHeader> {
        if header.len() < FRAME_HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame header needs {} bytes, got {}",
                FRAME_HEADER_SIZE,
                header.len()
            )));
        }
        let mut buf = &header[..FRAME_HEADER_SIZE];
        Ok(FrameHeader {
            size: buf.get_u32(),
            data_offset: buf.get_u8(),
            frame_type: buf.get_u8(),
            channel: buf.get_u16(),
        })
    }

    /// A frame that carries nothing past its header.
    pub fn is_empty_frame(&self) -> bool {
        self.size == 0 || self.size as usize == FRAME_HEADER_SIZE
    }

    /// Bytes between the fixed header and the frame body.
    pub fn extended_header_len(&self) -> AppResult<usize> {
        let offset = self.data_offset as usize * 4;
        if offset < FRAME_HEADER_SIZE || offset > self.size as usize {
            return Err(AppError::MalformedProtocol(format!(
                "invalid data offset {} for frame of size {}",
                self.data_offset, self.size
            )));
        }
        Ok(offset - FRAME_HEADER_SIZE)
    }

    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(FRAME_HEADER_SIZE)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// empty frame, used as a heartbeat
    Heartbeat,
    Performative(Performative),
}

/// Encodes a frame. With no performative the returned header is the whole
/// wire form of the empty frame. Otherwise the header is the 6 byte
/// `size | doff | type` prefix; the caller appends the 2 byte channel and
/// then the body.
pub fn encode_frame(performative: Option<&Performative>) -> (Bytes, Option<Bytes>) {
    match performative {
        None => {
            let mut header = BytesMut::with_capacity(FRAME_HEADER_SIZE);
            header.put_u32(FRAME_HEADER_SIZE as u32);
            header.put_u8(DEFAULT_DATA_OFFSET);
            header.put_u8(FRAME_TYPE_AMQP);
            header.put_u16(0);
            (header.freeze(), None)
        }
        Some(performative) => {
            let mut body = BytesMut::new();
            performative.encode(&mut body);
            let mut header = BytesMut::with_capacity(FRAME_HEADER_SIZE - 2);
            header.put_u32((body.len() + FRAME_HEADER_SIZE) as u32);
            header.put_u8(DEFAULT_DATA_OFFSET);
            header.put_u8(FRAME_TYPE_AMQP);
            (header.freeze(), Some(body.freeze()))
        }
    }
}

/// Size of the frame `performative` would occupy on the wire.
pub fn encoded_frame_size(performative: &Performative) -> usize {
    let mut body = BytesMut::new();
    performative.encode(&mut body);
    body.len() + FRAME_HEADER_SIZE
}

pub fn decode_frame(payload: Bytes) -> AppResult<Performative> {
    Performative::decode(payload)
}

pub fn decode_empty_frame(header: &[u8]) -> AppResult<Frame> {
    let header = FrameHeader::parse(header)?;
    if !header.is_empty_frame() {
        return Err(AppError::MalformedProtocol(format!(
            "frame of size {} on channel {} is not empty",
            header.size, header.channel
        )));
    }
    Ok(Frame::Heartbeat)
}
