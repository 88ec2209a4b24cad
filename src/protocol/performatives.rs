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

//! Typed AMQP performatives and the composite types they carry.
//!
//! Every performative is a described list on the wire. `Performative::encode`
//! writes the list (and, for transfers, the message payload right after it);
//! `Performative::decode` reverses that from a frame body.

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::constants::descriptor;
use super::fields::{FieldMap, FieldReader, FieldWriter};
use super::{Source, Target, Value};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    fn to_value(self) -> Value {
        Value::Bool(self == Role::Receiver)
    }
    fn from_flag(receiver: bool) -> Role {
        if receiver {
            Role::Receiver
        } else {
            Role::Sender
        }
    }
    /// the role the peer plays on the same link
    pub fn mirrored(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    Unsettled = 0,
    Settled = 1,
    Mixed = 2,
}

impl TryFrom<u8> for SenderSettleMode {
    type Error = AppError;
    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            other => Err(AppError::InvalidValue(format!(
                "sender settle mode {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    First = 0,
    Second = 1,
}

impl TryFrom<u8> for ReceiverSettleMode {
    type Error = AppError;
    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            other => Err(AppError::InvalidValue(format!(
                "receiver settle mode {}",
                other
            ))),
        }
    }
}

/// An error carried by detach, end and close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpError {
    pub condition: String,
    pub description: Option<String>,
    pub info: Option<FieldMap>,
}

impl AmqpError {
    pub fn new<C: Into<String>, D: Into<String>>(condition: C, description: D) -> AmqpError {
        AmqpError {
            condition: condition.into(),
            description: Some(description.into()),
            info: None,
        }
    }

    pub fn to_value(&self) -> Value {
        FieldWriter::new()
            .push(Value::Symbol(self.condition.clone()))
            .push_opt(self.description.clone(), Value::String)
            .push_opt(self.info.clone(), Value::Map)
            .finish(descriptor::ERROR)
    }

    pub fn from_value(value: Value) -> AppResult<AmqpError> {
        let mut fields = FieldReader::new(value, descriptor::ERROR, "error")?;
        Ok(AmqpError {
            condition: fields.req_string("condition")?,
            description: fields.opt_string("description")?,
            info: fields.opt_map("info")?,
        })
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

fn opt_error(fields: &mut FieldReader) -> AppResult<Option<AmqpError>> {
    fields.opt_value().map(AmqpError::from_value).transpose()
}

/// Delivery states and outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Received {
        section_number: u32,
        section_offset: u64,
    },
    Accepted,
    Rejected {
        error: Option<AmqpError>,
    },
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: Option<FieldMap>,
    },
}

impl DeliveryState {
    /// Everything but `Received` settles the fate of a delivery.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Received { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            DeliveryState::Received {
                section_number,
                section_offset,
            } => FieldWriter::new()
                .push(Value::Uint(*section_number))
                .push(Value::Ulong(*section_offset))
                .finish(descriptor::RECEIVED),
            DeliveryState::Accepted => FieldWriter::new().finish(descriptor::ACCEPTED),
            DeliveryState::Rejected { error } => FieldWriter::new()
                .push_opt(error.as_ref(), AmqpError::to_value)
                .finish(descriptor::REJECTED),
            DeliveryState::Released => FieldWriter::new().finish(descriptor::RELEASED),
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => FieldWriter::new()
                .push_flag(*delivery_failed)
                .push_flag(*undeliverable_here)
                .push_opt(message_annotations.clone(), Value::Map)
                .finish(descriptor::MODIFIED),
        }
    }

    pub fn from_value(value: Value) -> AppResult<DeliveryState> {
        let code = value.descriptor_code().ok_or_else(|| {
            AppError::MalformedProtocol(format!("delivery state is not described: {:?}", value))
        })?;
        let state = match code {
            descriptor::RECEIVED => {
                let mut fields = FieldReader::new(value, code, "received")?;
                DeliveryState::Received {
                    section_number: fields.req_u32("section_number")?,
                    section_offset: fields.opt_u64("section_offset")?.unwrap_or_default(),
                }
            }
            descriptor::ACCEPTED => {
                FieldReader::new(value, code, "accepted")?;
                DeliveryState::Accepted
            }
            descriptor::REJECTED => {
                let mut fields = FieldReader::new(value, code, "rejected")?;
                DeliveryState::Rejected {
                    error: opt_error(&mut fields)?,
                }
            }
            descriptor::RELEASED => {
                FieldReader::new(value, code, "released")?;
                DeliveryState::Released
            }
            descriptor::MODIFIED => {
                let mut fields = FieldReader::new(value, code, "modified")?;
                DeliveryState::Modified {
                    delivery_failed: fields.bool_or("delivery_failed", false)?,
                    undeliverable_here: fields.bool_or("undeliverable_here", false)?,
                    message_annotations: fields.opt_map("message_annotations")?,
                }
            }
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown delivery state {:#x}",
                    other
                )))
            }
        };
        Ok(state)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: Option<u32>,
    pub channel_max: Option<u16>,
    /// milliseconds
    pub idle_timeout: Option<u32>,
    pub outgoing_locales: Option<Vec<String>>,
    pub incoming_locales: Option<Vec<String>>,
    pub offered_capabilities: Option<Vec<String>>,
    pub desired_capabilities: Option<Vec<String>>,
    pub properties: Option<FieldMap>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
    pub offered_capabilities: Option<Vec<String>>,
    pub desired_capabilities: Option<Vec<String>>,
    pub properties: Option<FieldMap>,
}

impl Default for Begin {
    fn default() -> Self {
        Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 0,
            outgoing_window: 0,
            handle_max: u32::MAX,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: Option<SenderSettleMode>,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub unsettled: Option<FieldMap>,
    pub incomplete_unsettled: bool,
    pub initial_delivery_count: Option<u32>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Option<Vec<String>>,
    pub desired_capabilities: Option<Vec<String>>,
    pub properties: Option<FieldMap>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<FieldMap>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub state: Option<DeliveryState>,
    pub resume: bool,
    pub aborted: bool,
    pub batchable: bool,
    /// message bytes following the performative in the frame body
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
    pub batchable: bool,
}

impl Disposition {
    /// whether `delivery_id` falls inside [first, last]
    pub fn covers(&self, delivery_id: u32) -> bool {
        let last = self.last.unwrap_or(self.first);
        delivery_id.wrapping_sub(self.first) <= last.wrapping_sub(self.first)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct End {
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Close {
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(open) => FieldWriter::new()
                .push(Value::String(open.container_id.clone()))
                .push_opt(open.hostname.clone(), Value::String)
                .push_opt(open.max_frame_size, Value::Uint)
                .push_opt(open.channel_max, Value::Ushort)
                .push_opt(open.idle_timeout, Value::Uint)
                .push_symbols(open.outgoing_locales.as_ref())
                .push_symbols(open.incoming_locales.as_ref())
                .push_symbols(open.offered_capabilities.as_ref())
                .push_symbols(open.desired_capabilities.as_ref())
                .push_opt(open.properties.clone(), Value::Map)
                .finish(descriptor::OPEN),
            Performative::Begin(begin) => FieldWriter::new()
                .push_opt(begin.remote_channel, Value::Ushort)
                .push(Value::Uint(begin.next_outgoing_id))
                .push(Value::Uint(begin.incoming_window))
                .push(Value::Uint(begin.outgoing_window))
                .push(Value::Uint(begin.handle_max))
                .push_symbols(begin.offered_capabilities.as_ref())
                .push_symbols(begin.desired_capabilities.as_ref())
                .push_opt(begin.properties.clone(), Value::Map)
                .finish(descriptor::BEGIN),
            Performative::Attach(attach) => FieldWriter::new()
                .push(Value::String(attach.name.clone()))
                .push(Value::Uint(attach.handle))
                .push(attach.role.to_value())
                .push_opt(attach.snd_settle_mode, |m| Value::Ubyte(m as u8))
                .push_opt(attach.rcv_settle_mode, |m| Value::Ubyte(m as u8))
                .push_opt(attach.source.as_ref(), Source::to_value)
                .push_opt(attach.target.as_ref(), Target::to_value)
                .push_opt(attach.unsettled.clone(), Value::Map)
                .push_flag(attach.incomplete_unsettled)
                .push_opt(attach.initial_delivery_count, Value::Uint)
                .push_opt(attach.max_message_size, Value::Ulong)
                .push_symbols(attach.offered_capabilities.as_ref())
                .push_symbols(attach.desired_capabilities.as_ref())
                .push_opt(attach.properties.clone(), Value::Map)
                .finish(descriptor::ATTACH),
            Performative::Flow(flow) => FieldWriter::new()
                .push_opt(flow.next_incoming_id, Value::Uint)
                .push(Value::Uint(flow.incoming_window))
                .push(Value::Uint(flow.next_outgoing_id))
                .push(Value::Uint(flow.outgoing_window))
                .push_opt(flow.handle, Value::Uint)
                .push_opt(flow.delivery_count, Value::Uint)
                .push_opt(flow.link_credit, Value::Uint)
                .push_opt(flow.available, Value::Uint)
                .push_flag(flow.drain)
                .push_flag(flow.echo)
                .push_opt(flow.properties.clone(), Value::Map)
                .finish(descriptor::FLOW),
            Performative::Transfer(transfer) => FieldWriter::new()
                .push(Value::Uint(transfer.handle))
                .push_opt(transfer.delivery_id, Value::Uint)
                .push_opt(transfer.delivery_tag.clone(), Value::Binary)
                .push_opt(transfer.message_format, Value::Uint)
                .push_opt(transfer.settled, Value::Bool)
                .push_flag(transfer.more)
                .push_opt(transfer.rcv_settle_mode, |m| Value::Ubyte(m as u8))
                .push_opt(transfer.state.as_ref(), DeliveryState::to_value)
                .push_flag(transfer.resume)
                .push_flag(transfer.aborted)
                .push_flag(transfer.batchable)
                .finish(descriptor::TRANSFER),
            Performative::Disposition(disposition) => FieldWriter::new()
                .push(disposition.role.to_value())
                .push(Value::Uint(disposition.first))
                .push_opt(disposition.last, Value::Uint)
                .push_flag(disposition.settled)
                .push_opt(disposition.state.as_ref(), DeliveryState::to_value)
                .push_flag(disposition.batchable)
                .finish(descriptor::DISPOSITION),
            Performative::Detach(detach) => FieldWriter::new()
                .push(Value::Uint(detach.handle))
                .push_flag(detach.closed)
                .push_opt(detach.error.as_ref(), AmqpError::to_value)
                .finish(descriptor::DETACH),
            Performative::End(end) => FieldWriter::new()
                .push_opt(end.error.as_ref(), AmqpError::to_value)
                .finish(descriptor::END),
            Performative::Close(close) => FieldWriter::new()
                .push_opt(close.error.as_ref(), AmqpError::to_value)
                .finish(descriptor::CLOSE),
        }
    }

    /// Writes the performative followed by the transfer payload, if any.
    pub fn encode(&self, writer: &mut BytesMut) {
        self.to_value().encode(writer);
        if let Performative::Transfer(transfer) = self {
            writer.extend_from_slice(&transfer.payload);
        }
    }

    /// Decodes a frame body. Bytes left after the performative are the
    /// payload of a transfer and are rejected for anything else.
    pub fn decode(mut body: Bytes) -> AppResult<Performative> {
        let value = Value::decode(&mut body)?;
        let code = value.descriptor_code().ok_or_else(|| {
            AppError::MalformedProtocol("frame body is not a described performative".into())
        })?;
        let performative = match code {
            descriptor::OPEN => {
                let mut fields = FieldReader::new(value, code, "open")?;
                Performative::Open(Open {
                    container_id: fields.req_string("container_id")?,
                    hostname: fields.opt_string("hostname")?,
                    max_frame_size: fields.opt_u32("max_frame_size")?,
                    channel_max: fields.opt_u16("channel_max")?,
                    idle_timeout: fields.opt_u32("idle_timeout")?,
                    outgoing_locales: fields.opt_symbols("outgoing_locales")?,
                    incoming_locales: fields.opt_symbols("incoming_locales")?,
                    offered_capabilities: fields.opt_symbols("offered_capabilities")?,
                    desired_capabilities: fields.opt_symbols("desired_capabilities")?,
                    properties: fields.opt_map("properties")?,
                })
            }
            descriptor::BEGIN => {
                let mut fields = FieldReader::new(value, code, "begin")?;
                Performative::Begin(Begin {
                    remote_channel: fields.opt_u16("remote_channel")?,
                    next_outgoing_id: fields.req_u32("next_outgoing_id")?,
                    incoming_window: fields.req_u32("incoming_window")?,
                    outgoing_window: fields.req_u32("outgoing_window")?,
                    handle_max: fields.opt_u32("handle_max")?.unwrap_or(u32::MAX),
                    offered_capabilities: fields.opt_symbols("offered_capabilities")?,
                    desired_capabilities: fields.opt_symbols("desired_capabilities")?,
                    properties: fields.opt_map("properties")?,
                })
            }
            descriptor::ATTACH => {
                let mut fields = FieldReader::new(value, code, "attach")?;
                Performative::Attach(Attach {
                    name: fields.req_string("name")?,
                    handle: fields.req_u32("handle")?,
                    role: Role::from_flag(fields.bool_or("role", false)?),
                    snd_settle_mode: fields
                        .opt_u8("snd_settle_mode")?
                        .map(SenderSettleMode::try_from)
                        .transpose()?,
                    rcv_settle_mode: fields
                        .opt_u8("rcv_settle_mode")?
                        .map(ReceiverSettleMode::try_from)
                        .transpose()?,
                    source: fields.opt_value().map(Source::from_value).transpose()?,
                    target: fields.opt_value().map(Target::from_value).transpose()?,
                    unsettled: fields.opt_map("unsettled")?,
                    incomplete_unsettled: fields.bool_or("incomplete_unsettled", false)?,
                    initial_delivery_count: fields.opt_u32("initial_delivery_count")?,
                    max_message_size: fields.opt_u64("max_message_size")?,
                    offered_capabilities: fields.opt_symbols("offered_capabilities")?,
                    desired_capabilities: fields.opt_symbols("desired_capabilities")?,
                    properties: fields.opt_map("properties")?,
                })
            }
            descriptor::FLOW => {
                let mut fields = FieldReader::new(value, code, "flow")?;
                Performative::Flow(Flow {
                    next_incoming_id: fields.opt_u32("next_incoming_id")?,
                    incoming_window: fields.req_u32("incoming_window")?,
                    next_outgoing_id: fields.req_u32("next_outgoing_id")?,
                    outgoing_window: fields.req_u32("outgoing_window")?,
                    handle: fields.opt_u32("handle")?,
                    delivery_count: fields.opt_u32("delivery_count")?,
                    link_credit: fields.opt_u32("link_credit")?,
                    available: fields.opt_u32("available")?,
                    drain: fields.bool_or("drain", false)?,
                    echo: fields.bool_or("echo", false)?,
                    properties: fields.opt_map("properties")?,
                })
            }
            descriptor::TRANSFER => {
                let mut fields = FieldReader::new(value, code, "transfer")?;
                Performative::Transfer(Transfer {
                    handle: fields.req_u32("handle")?,
                    delivery_id: fields.opt_u32("delivery_id")?,
                    delivery_tag: fields.opt_binary("delivery_tag")?,
                    message_format: fields.opt_u32("message_format")?,
                    settled: fields.opt_bool("settled")?,
                    more: fields.bool_or("more", false)?,
                    rcv_settle_mode: fields
                        .opt_u8("rcv_settle_mode")?
                        .map(ReceiverSettleMode::try_from)
                        .transpose()?,
                    state: fields.opt_value().map(DeliveryState::from_value).transpose()?,
                    resume: fields.bool_or("resume", false)?,
                    aborted: fields.bool_or("aborted", false)?,
                    batchable: fields.bool_or("batchable", false)?,
                    payload: std::mem::take(&mut body),
                })
            }
            descriptor::DISPOSITION => {
                let mut fields = FieldReader::new(value, code, "disposition")?;
                Performative::Disposition(Disposition {
                    role: Role::from_flag(fields.bool_or("role", false)?),
                    first: fields.req_u32("first")?,
                    last: fields.opt_u32("last")?,
                    settled: fields.bool_or("settled", false)?,
                    state: fields.opt_value().map(DeliveryState::from_value).transpose()?,
                    batchable: fields.bool_or("batchable", false)?,
                })
            }
            descriptor::DETACH => {
                let mut fields = FieldReader::new(value, code, "detach")?;
                Performative::Detach(Detach {
                    handle: fields.req_u32("handle")?,
                    closed: fields.bool_or("closed", false)?,
                    error: opt_error(&mut fields)?,
                })
            }
            descriptor::END => {
                let mut fields = FieldReader::new(value, code, "end")?;
                Performative::End(End {
                    error: opt_error(&mut fields)?,
                })
            }
            descriptor::CLOSE => {
                let mut fields = FieldReader::new(value, code, "close")?;
                Performative::Close(Close {
                    error: opt_error(&mut fields)?,
                })
            }
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown performative {:#x}",
                    other
                )))
            }
        };
        if !body.is_empty() {
            return Err(AppError::MalformedProtocol(format!(
                "{} trailing bytes after {}",
                body.len(),
                performative.name()
            )));
        }
        Ok(performative)
    }
}
