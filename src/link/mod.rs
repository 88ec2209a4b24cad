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

//! Sending and receiving links.
//!
//! Links never touch the transport. Every event handler returns the frames
//! the link wants to send as [`LinkOutput`]s and the owning session sends
//! them, adding the session level fields where needed.

use std::time::Instant;

use tracing::{debug, info};

use crate::protocol::{
    AmqpError, Attach, Detach, Disposition, Flow, ReceiverSettleMode, Role, SenderSettleMode,
    Source, Target, Transfer,
};
use crate::service::LinkConfig;
use crate::session::SessionState;
use crate::AppResult;

pub use receiver::{ReceivedMessage, ReceiverLink};
pub use sender::{DeliveryOutcome, SenderLink};

mod receiver;
mod sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Detached,
    AttachSent,
    AttachRcvd,
    Attached,
    DetachSent,
    DetachRcvd,
    Error,
}

/// A frame a link asks its session to send.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutput {
    Attach(Attach),
    /// link fields only, the session fills in its own
    Flow(Flow),
    Disposition(Disposition),
    Detach(Detach),
}

/// State shared by both link roles.
#[derive(Debug)]
pub struct LinkCore {
    pub name: String,
    pub handle: u32,
    pub remote_handle: Option<u32>,
    pub role: Role,
    pub state: LinkState,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub max_message_size: Option<u64>,
    pub remote_max_message_size: Option<u64>,
    pub delivery_count: u32,
    pub link_credit: u32,
    pub is_closed: bool,
    /// error carried by the peer's detach
    pub remote_error: Option<AmqpError>,
}

impl LinkCore {
    pub fn new(
        name: String,
        handle: u32,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
        config: &LinkConfig,
    ) -> AppResult<LinkCore> {
        Ok(LinkCore {
            name,
            handle,
            remote_handle: None,
            role,
            state: LinkState::Detached,
            source,
            target,
            snd_settle_mode: SenderSettleMode::try_from(config.snd_settle_mode)?,
            rcv_settle_mode: ReceiverSettleMode::try_from(config.rcv_settle_mode)?,
            max_message_size: config.max_message_size,
            remote_max_message_size: None,
            delivery_count: 0,
            link_credit: 0,
            is_closed: false,
            remote_error: None,
        })
    }

    pub fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!(
                "Link '{}' state changed: {:?} -> {:?}",
                self.name, self.state, state
            );
            self.state = state;
        }
    }

    pub fn attach_frame(&self) -> Attach {
        Attach {
            name: self.name.clone(),
            handle: self.handle,
            role: self.role,
            snd_settle_mode: Some(self.snd_settle_mode),
            rcv_settle_mode: Some(self.rcv_settle_mode),
            source: self.source.clone(),
            target: self.target.clone(),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: match self.role {
                Role::Sender => Some(self.delivery_count),
                Role::Receiver => None,
            },
            max_message_size: self.max_message_size,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    /// Link level flow fields.
    pub fn flow_frame(&self) -> Flow {
        Flow {
            handle: Some(self.handle),
            delivery_count: Some(self.delivery_count),
            link_credit: Some(self.link_credit),
            ..Default::default()
        }
    }

    fn detach_frame(&self, closed: bool, error: Option<AmqpError>) -> Detach {
        Detach {
            handle: self.handle,
            closed,
            error,
        }
    }

    /// Session state changes every link reacts to the same way.
    pub fn on_session_state_change(&mut self, state: SessionState) -> Vec<LinkOutput> {
        match state {
            SessionState::Mapped if !self.is_closed && self.state == LinkState::Detached => {
                self.set_state(LinkState::AttachSent);
                vec![LinkOutput::Attach(self.attach_frame())]
            }
            SessionState::Discarding | SessionState::Unmapped => {
                self.set_state(LinkState::Detached);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Sends our attach, or answers the peer's. Returns whether the link is
    /// now attached.
    pub fn incoming_attach(&mut self, attach: &Attach, outputs: &mut Vec<LinkOutput>) -> bool {
        self.remote_handle = Some(attach.handle);
        self.remote_max_message_size = attach.max_message_size;
        match self.state {
            LinkState::Detached => {
                self.set_state(LinkState::AttachRcvd);
                outputs.push(LinkOutput::Attach(self.attach_frame()));
                self.set_state(LinkState::Attached);
                true
            }
            LinkState::AttachSent => {
                self.set_state(LinkState::Attached);
                true
            }
            other => {
                debug!(
                    "Link '{}' ignores attach in state {:?}",
                    self.name, other
                );
                false
            }
        }
    }

    /// Starts a locally initiated detach.
    pub fn detach(&mut self, close: bool, error: Option<AmqpError>) -> Vec<LinkOutput> {
        match self.state {
            LinkState::Detached | LinkState::DetachSent => Vec::new(),
            _ => {
                self.is_closed = close;
                let errored = error.is_some();
                let frame = self.detach_frame(close, error);
                self.set_state(if errored {
                    LinkState::Error
                } else {
                    LinkState::DetachSent
                });
                vec![LinkOutput::Detach(frame)]
            }
        }
    }

    pub fn incoming_detach(&mut self, detach: &Detach) -> Vec<LinkOutput> {
        self.remote_error = detach.error.clone();
        if detach.closed {
            self.is_closed = true;
        }
        match self.state {
            LinkState::DetachSent | LinkState::Error => {
                self.set_state(LinkState::Detached);
                Vec::new()
            }
            LinkState::Detached => Vec::new(),
            _ => {
                self.set_state(LinkState::DetachRcvd);
                let reply = self.detach_frame(detach.closed, None);
                self.set_state(LinkState::Detached);
                vec![LinkOutput::Detach(reply)]
            }
        }
    }
}

/// What a session needs from a link.
pub trait LinkEndpoint {
    fn core(&self) -> &LinkCore;
    fn core_mut(&mut self) -> &mut LinkCore;

    fn name(&self) -> &str {
        &self.core().name
    }
    fn handle(&self) -> u32 {
        self.core().handle
    }
    fn remote_handle(&self) -> Option<u32> {
        self.core().remote_handle
    }
    fn is_closed(&self) -> bool {
        self.core().is_closed
    }
    fn state(&self) -> LinkState {
        self.core().state
    }

    fn on_session_state_change(&mut self, state: SessionState) -> Vec<LinkOutput>;
    fn evaluate_status(&mut self, now: Instant) -> Vec<LinkOutput>;
    fn incoming_attach(&mut self, attach: &Attach) -> Vec<LinkOutput>;
    fn incoming_flow(&mut self, flow: &Flow) -> Vec<LinkOutput>;
    fn incoming_transfer(&mut self, transfer: Transfer) -> AppResult<Vec<LinkOutput>>;
    fn incoming_disposition(&mut self, disposition: &Disposition) -> Vec<LinkOutput>;
    fn incoming_detach(&mut self, detach: &Detach) -> Vec<LinkOutput>;
}

#[derive(Debug)]
pub enum Link {
    Sender(SenderLink),
    Receiver(ReceiverLink),
}

impl Link {
    /// The local end of a link the peer attached. Roles mirror the peer's.
    pub fn from_incoming_attach(
        attach: &Attach,
        handle: u32,
        config: &LinkConfig,
    ) -> AppResult<Link> {
        let source = attach.source.clone();
        let target = attach.target.clone();
        match attach.role.mirrored() {
            Role::Sender => Ok(Link::Sender(SenderLink::new(
                attach.name.clone(),
                handle,
                source,
                target,
                config,
            )?)),
            Role::Receiver => Ok(Link::Receiver(ReceiverLink::new(
                attach.name.clone(),
                handle,
                source,
                target,
                config,
            )?)),
        }
    }

    pub fn role(&self) -> Role {
        self.core().role
    }

    pub fn as_sender_mut(&mut self) -> Option<&mut SenderLink> {
        match self {
            Link::Sender(sender) => Some(sender),
            Link::Receiver(_) => None,
        }
    }

    pub fn as_receiver_mut(&mut self) -> Option<&mut ReceiverLink> {
        match self {
            Link::Receiver(receiver) => Some(receiver),
            Link::Sender(_) => None,
        }
    }

    pub fn as_sender(&self) -> Option<&SenderLink> {
        match self {
            Link::Sender(sender) => Some(sender),
            Link::Receiver(_) => None,
        }
    }

    pub fn as_receiver(&self) -> Option<&ReceiverLink> {
        match self {
            Link::Receiver(receiver) => Some(receiver),
            Link::Sender(_) => None,
        }
    }

    pub fn detach(&mut self, close: bool, error: Option<AmqpError>) -> Vec<LinkOutput> {
        self.core_mut().detach(close, error)
    }

    /// Attach a link that is detached but not closed. The session only calls
    /// this while mapped.
    pub fn attach(&mut self) -> Vec<LinkOutput> {
        let core = self.core_mut();
        core.is_closed = false;
        core.on_session_state_change(SessionState::Mapped)
    }
}

macro_rules! dispatch {
    ($link:expr, $inner:ident => $body:expr) => {
        match $link {
            Link::Sender($inner) => $body,
            Link::Receiver($inner) => $body,
        }
    };
}

impl LinkEndpoint for Link {
    fn core(&self) -> &LinkCore {
        dispatch!(self, link => link.core())
    }
    fn core_mut(&mut self) -> &mut LinkCore {
        dispatch!(self, link => link.core_mut())
    }
    fn on_session_state_change(&mut self, state: SessionState) -> Vec<LinkOutput> {
        dispatch!(self, link => link.on_session_state_change(state))
    }
    fn evaluate_status(&mut self, now: Instant) -> Vec<LinkOutput> {
        dispatch!(self, link => link.evaluate_status(now))
    }
    fn incoming_attach(&mut self, attach: &Attach) -> Vec<LinkOutput> {
        dispatch!(self, link => link.incoming_attach(attach))
    }
    fn incoming_flow(&mut self, flow: &Flow) -> Vec<LinkOutput> {
        dispatch!(self, link => link.incoming_flow(flow))
    }
    fn incoming_transfer(&mut self, transfer: Transfer) -> AppResult<Vec<LinkOutput>> {
        dispatch!(self, link => link.incoming_transfer(transfer))
    }
    fn incoming_disposition(&mut self, disposition: &Disposition) -> Vec<LinkOutput> {
        dispatch!(self, link => link.incoming_disposition(disposition))
    }
    fn incoming_detach(&mut self, detach: &Detach) -> Vec<LinkOutput> {
        dispatch!(self, link => link.incoming_detach(detach))
    }
}
