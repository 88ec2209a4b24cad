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

//! Session Implementation
//!
//! A session multiplexes links over one channel of a connection and runs the
//! session level flow control: transfer ids, incoming and outgoing windows,
//! and the begin/end handshake.
//!
//! The session never owns the transport. Every operation that may emit a
//! frame takes the connection's [`FrameSink`], so frames of one connection
//! are always produced by the single task driving it.
//!
//! Link events are fanned out with a plain loop: every link has reacted
//! before the triggering call returns.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::{ConnectionState, FrameSink};
use crate::link::{
    DeliveryOutcome, Link, LinkEndpoint, LinkOutput, LinkState, ReceivedMessage, ReceiverLink,
    SenderLink,
};
use crate::protocol::{
    condition, encoded_frame_size, AmqpError, Attach, Begin, DeliveryState, Detach, Disposition,
    End, FieldMap, Flow, Performative, Source, Target, Transfer,
};
use crate::service::{LinkConfig, SessionConfig};
use crate::{AppError, AppResult};

pub use state::{SessionState, TransferResult, TransferState, WaitMode, WaitOutcome};

mod state;
#[cfg(test)]
mod tests;

#[derive(Debug)]
pub struct Session {
    name: String,
    channel: u16,
    remote_channel: Option<u16>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,

    next_outgoing_id: u32,
    next_incoming_id: Option<u32>,
    incoming_window: u32,
    outgoing_window: u32,
    target_incoming_window: u32,
    remote_incoming_window: i64,
    remote_outgoing_window: i64,
    handle_max: u32,

    offered_capabilities: Option<Vec<String>>,
    desired_capabilities: Option<Vec<String>>,
    properties: Option<FieldMap>,
    allow_pipelined_open: bool,
    link_config: LinkConfig,

    links: HashMap<String, Link>,
    /// local handle -> link name
    output_handles: BTreeMap<u32, String>,
    /// peer handle -> link name
    input_handles: HashMap<u32, String>,
}

impl Session {
    pub fn new(channel: u16, config: &SessionConfig, link_config: LinkConfig) -> Session {
        let (state_tx, _) = watch::channel(SessionState::Unmapped);
        Session {
            name: Uuid::new_v4().to_string(),
            channel,
            remote_channel: None,
            state: SessionState::Unmapped,
            state_tx,
            next_outgoing_id: config.next_outgoing_id,
            next_incoming_id: None,
            incoming_window: config.incoming_window,
            outgoing_window: config.outgoing_window,
            target_incoming_window: config.incoming_window,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            handle_max: config.handle_max,
            offered_capabilities: config.offered_capabilities.clone(),
            desired_capabilities: config.desired_capabilities.clone(),
            properties: None,
            allow_pipelined_open: config.allow_pipelined_open,
            link_config,
            links: HashMap::new(),
            output_handles: BTreeMap::new(),
            input_handles: HashMap::new(),
        }
    }

    pub fn with_name<N: Into<String>>(mut self, name: N) -> Session {
        self.name = name.into();
        self
    }

    pub fn with_properties(mut self, properties: FieldMap) -> Session {
        self.properties = Some(properties);
        self
    }

    /// A session the peer began. `remote_channel` is the channel the Begin
    /// arrived on; the reply goes out on `channel`.
    pub async fn from_incoming_frame<S: FrameSink>(
        sink: &mut S,
        channel: u16,
        remote_channel: u16,
        begin: Begin,
        config: &SessionConfig,
        link_config: LinkConfig,
    ) -> AppResult<Session> {
        let mut session = Session::new(channel, config, link_config);
        session.incoming_begin(sink, remote_channel, begin).await?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn channel(&self) -> u16 {
        self.channel
    }
    pub fn remote_channel(&self) -> Option<u16> {
        self.remote_channel
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn next_outgoing_id(&self) -> u32 {
        self.next_outgoing_id
    }
    pub fn next_incoming_id(&self) -> Option<u32> {
        self.next_incoming_id
    }
    pub fn incoming_window(&self) -> u32 {
        self.incoming_window
    }
    pub fn outgoing_window(&self) -> u32 {
        self.outgoing_window
    }
    pub fn target_incoming_window(&self) -> u32 {
        self.target_incoming_window
    }
    pub fn remote_incoming_window(&self) -> i64 {
        self.remote_incoming_window
    }
    pub fn remote_outgoing_window(&self) -> i64 {
        self.remote_outgoing_window
    }
    pub fn handle_max(&self) -> u32 {
        self.handle_max
    }

    /// Follow the session state without borrowing the session.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn link(&self, name: &str) -> Option<&Link> {
        self.links.get(name)
    }

    pub fn link_names(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    /// Name of the link bound to a local handle.
    pub fn output_handle(&self, handle: u32) -> Option<&str> {
        self.output_handles.get(&handle).map(String::as_str)
    }

    /// Name of the link bound to a peer handle.
    pub fn input_handle(&self, handle: u32) -> Option<&str> {
        self.input_handles.get(&handle).map(String::as_str)
    }

    fn link_mut(&mut self, name: &str) -> AppResult<&mut Link> {
        self.links
            .get_mut(name)
            .ok_or_else(|| AppError::UnknownLink(name.to_string()))
    }

    async fn emit<S: FrameSink>(&self, sink: &mut S, frame: Performative) -> AppResult<()> {
        sink.process_outgoing_frame(self.channel, frame).await
    }

    async fn set_state<S: FrameSink>(&mut self, sink: &mut S, state: SessionState) -> AppResult<()> {
        let previous = self.state;
        self.state = state;
        info!(
            "Session '{}' state changed: {:?} -> {:?}",
            self.name, previous, state
        );
        self.state_tx.send_replace(state);
        let mut outputs = Vec::new();
        for link in self.links.values_mut() {
            outputs.extend(link.on_session_state_change(state));
        }
        self.send_link_outputs(sink, outputs).await
    }

    async fn send_link_outputs<S: FrameSink>(
        &mut self,
        sink: &mut S,
        outputs: Vec<LinkOutput>,
    ) -> AppResult<()> {
        for output in outputs {
            match output {
                LinkOutput::Attach(attach) => self.emit(sink, Performative::Attach(attach)).await?,
                LinkOutput::Flow(flow) => self.outgoing_flow(sink, Some(flow)).await?,
                LinkOutput::Disposition(disposition) => {
                    self.emit(sink, Performative::Disposition(disposition)).await?
                }
                LinkOutput::Detach(detach) => self.emit(sink, Performative::Detach(detach)).await?,
            }
        }
        Ok(())
    }

    /// Lets every link check its timers.
    pub async fn evaluate_status<S: FrameSink>(&mut self, sink: &mut S) -> AppResult<()> {
        let now = Instant::now();
        let mut outputs = Vec::new();
        for link in self.links.values_mut() {
            outputs.extend(link.evaluate_status(now));
        }
        self.send_link_outputs(sink, outputs).await
    }

    pub async fn on_connection_state_change<S: FrameSink>(&mut self, sink: &mut S) -> AppResult<()> {
        if matches!(sink.state(), ConnectionState::CloseRcvd | ConnectionState::End)
            && !matches!(
                self.state,
                SessionState::Discarding | SessionState::Unmapped
            )
        {
            self.set_state(sink, SessionState::Discarding).await?;
        }
        Ok(())
    }

    /// Smallest free handle in `[1, handle_max)`.
    fn next_output_handle(&self) -> AppResult<u32> {
        if self.output_handles.len() as u64 >= self.handle_max as u64 {
            return Err(AppError::HandleExhausted(self.handle_max));
        }
        let mut candidate: u64 = 1;
        for handle in self.output_handles.keys() {
            let handle = *handle as u64;
            if handle == candidate {
                candidate += 1;
            } else if handle > candidate {
                break;
            }
        }
        if candidate >= self.handle_max as u64 {
            return Err(AppError::HandleExhausted(self.handle_max));
        }
        Ok(candidate as u32)
    }

    fn register_link(&mut self, link: Link) {
        self.output_handles
            .insert(link.handle(), link.name().to_string());
        if let Some(remote_handle) = link.remote_handle() {
            self.input_handles
                .insert(remote_handle, link.name().to_string());
        }
        self.links.insert(link.name().to_string(), link);
    }

    fn remove_link(&mut self, name: &str) -> Option<Link> {
        let link = self.links.remove(name)?;
        self.output_handles.remove(&link.handle());
        if let Some(remote_handle) = link.remote_handle() {
            self.input_handles.remove(&remote_handle);
        }
        debug!("Session '{}' released link '{}'", self.name, name);
        Some(link)
    }

    fn release_links(&mut self) {
        if !self.links.is_empty() {
            debug!(
                "Session '{}' releasing {} links",
                self.name,
                self.links.len()
            );
        }
        self.links.clear();
        self.output_handles.clear();
        self.input_handles.clear();
    }

    async fn outgoing_begin<S: FrameSink>(&mut self, sink: &mut S) -> AppResult<()> {
        let responding = self.state == SessionState::BeginRcvd;
        let begin = Begin {
            remote_channel: if responding { self.remote_channel } else { None },
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max,
            offered_capabilities: if responding {
                self.offered_capabilities.clone()
            } else {
                None
            },
            desired_capabilities: if self.state == SessionState::Unmapped {
                self.desired_capabilities.clone()
            } else {
                None
            },
            properties: self.properties.clone(),
        };
        self.emit(sink, Performative::Begin(begin)).await
    }

    async fn incoming_begin<S: FrameSink>(
        &mut self,
        sink: &mut S,
        remote_channel: u16,
        begin: Begin,
    ) -> AppResult<()> {
        self.handle_max = self.handle_max.min(begin.handle_max);
        self.next_incoming_id = Some(begin.next_outgoing_id);
        self.remote_incoming_window = begin.incoming_window as i64;
        self.remote_outgoing_window = begin.outgoing_window as i64;
        match self.state {
            SessionState::BeginSent => {
                self.remote_channel = Some(remote_channel);
                self.set_state(sink, SessionState::Mapped).await
            }
            SessionState::Unmapped => {
                self.remote_channel = Some(remote_channel);
                self.set_state(sink, SessionState::BeginRcvd).await?;
                self.outgoing_begin(sink).await?;
                self.set_state(sink, SessionState::Mapped).await
            }
            other => {
                warn!(
                    "Session '{}' ignores begin in state {:?}",
                    self.name, other
                );
                Ok(())
            }
        }
    }

    async fn outgoing_end<S: FrameSink>(
        &mut self,
        sink: &mut S,
        error: Option<AmqpError>,
    ) -> AppResult<()> {
        self.emit(sink, Performative::End(End { error })).await
    }

    async fn incoming_end<S: FrameSink>(&mut self, sink: &mut S, end: End) -> AppResult<()> {
        if let Some(error) = &end.error {
            warn!("Session '{}' ended by peer: {}", self.name, error);
        }
        if !self.state.is_ending() {
            self.set_state(sink, SessionState::EndRcvd).await?;
            self.outgoing_end(sink, None).await?;
        }
        self.set_state(sink, SessionState::Unmapped).await?;
        self.release_links();
        Ok(())
    }

    async fn incoming_attach<S: FrameSink>(&mut self, sink: &mut S, attach: Attach) -> AppResult<()> {
        if let Some(holder) = self.input_handles.get(&attach.handle) {
            if *holder != attach.name {
                let holder = holder.clone();
                return self.handle_in_use(sink, attach.handle, &holder, &attach.name).await;
            }
        }
        let outputs = if let Some(link) = self.links.get_mut(&attach.name) {
            let previous = link.remote_handle();
            let outputs = link.incoming_attach(&attach);
            if let Some(stale) = previous.filter(|handle| *handle != attach.handle) {
                self.input_handles.remove(&stale);
            }
            self.input_handles.insert(attach.handle, attach.name.clone());
            outputs
        } else {
            let handle = match self.next_output_handle() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        "Session '{}' rejects link '{}': {}",
                        self.name, attach.name, e
                    );
                    return Err(e);
                }
            };
            let mut link = Link::from_incoming_attach(&attach, handle, &self.link_config)?;
            let outputs = link.incoming_attach(&attach);
            debug!(
                "Session '{}' created {:?} link '{}' on handle {}",
                self.name,
                link.role(),
                link.name(),
                handle
            );
            self.register_link(link);
            outputs
        };
        self.send_link_outputs(sink, outputs).await
    }

    /// Sends a flow carrying the session's current windows, on top of the
    /// link fields of `link_flow` if given.
    pub async fn outgoing_flow<S: FrameSink>(
        &mut self,
        sink: &mut S,
        link_flow: Option<Flow>,
    ) -> AppResult<()> {
        let flow = Flow {
            next_incoming_id: self.next_incoming_id,
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            ..link_flow.unwrap_or_default()
        };
        self.emit(sink, Performative::Flow(flow)).await
    }

    async fn incoming_flow<S: FrameSink>(&mut self, sink: &mut S, flow: Flow) -> AppResult<()> {
        self.next_incoming_id = Some(flow.next_outgoing_id);
        // the peer may omit next_incoming_id before it has seen a begin of ours
        let remote_incoming_id = flow.next_incoming_id.unwrap_or(self.next_outgoing_id);
        self.remote_incoming_window = remote_incoming_id.wrapping_sub(self.next_outgoing_id) as i32
            as i64
            + flow.incoming_window as i64;
        self.remote_outgoing_window = flow.outgoing_window as i64;

        let outputs = match flow.handle {
            Some(handle) => {
                let Some(name) = self.input_handles.get(&handle).cloned() else {
                    return self.unattached_handle(sink, handle).await;
                };
                self.link_mut(&name)?.incoming_flow(&flow)
            }
            None => {
                let mut outputs = Vec::new();
                if self.remote_incoming_window > 0 {
                    for name in self.output_handles.values() {
                        if let Some(link) = self.links.get_mut(name) {
                            if !link.is_closed() {
                                outputs.extend(link.incoming_flow(&flow));
                            }
                        }
                    }
                }
                outputs
            }
        };
        self.send_link_outputs(sink, outputs).await
    }

    /// Splits a transfer whose frame would exceed `max_frame_size`. Only the
    /// first frame carries the delivery id and tag; all but the last have
    /// `more` set.
    fn split_transfer(&self, transfer: Transfer, max_frame_size: u32) -> AppResult<Vec<Transfer>> {
        let envelope = Transfer {
            delivery_id: Some(u32::MAX),
            more: true,
            payload: Bytes::new(),
            ..transfer.clone()
        };
        let overhead = encoded_frame_size(&Performative::Transfer(envelope));
        let max_frame_size = max_frame_size as usize;
        if overhead >= max_frame_size {
            return Err(AppError::InvalidValue(format!(
                "transfer header of {} bytes does not fit a frame of {} bytes",
                overhead, max_frame_size
            )));
        }
        let capacity = max_frame_size - overhead;
        if transfer.payload.len() <= capacity {
            return Ok(vec![transfer]);
        }

        let mut remaining = transfer.payload.clone();
        let mut frames = Vec::with_capacity(remaining.len().div_ceil(capacity));
        let first_chunk = remaining.split_to(capacity);
        frames.push(Transfer {
            more: true,
            payload: first_chunk,
            ..transfer.clone()
        });
        while !remaining.is_empty() {
            let chunk = remaining.split_to(capacity.min(remaining.len()));
            frames.push(Transfer {
                handle: transfer.handle,
                more: !remaining.is_empty(),
                payload: chunk,
                ..Default::default()
            });
        }
        if let Some(last) = frames.last_mut() {
            last.more = transfer.more;
        }
        Ok(frames)
    }

    /// Puts one delivery on the wire if the session is mapped and the peer's
    /// incoming window has room for all of its frames.
    pub async fn outgoing_transfer<S: FrameSink>(
        &mut self,
        sink: &mut S,
        transfer: Transfer,
    ) -> AppResult<TransferResult> {
        if self.state != SessionState::Mapped {
            return Ok(TransferResult::error());
        }
        if self.remote_incoming_window <= 0 {
            return Ok(TransferResult::busy());
        }
        let frames = self.split_transfer(transfer, sink.max_frame_size())?;
        if self.remote_incoming_window < frames.len() as i64 {
            return Ok(TransferResult::busy());
        }
        let delivery_id = self.next_outgoing_id;
        if frames.len() > 1 {
            trace!(
                "Session '{}' splits delivery {} into {} frames",
                self.name,
                delivery_id,
                frames.len()
            );
        }
        for (index, mut frame) in frames.into_iter().enumerate() {
            if index == 0 {
                frame.delivery_id = Some(delivery_id);
            }
            self.emit(sink, Performative::Transfer(frame)).await?;
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.remote_incoming_window -= 1;
            self.outgoing_window = self.outgoing_window.saturating_sub(1);
        }
        Ok(TransferResult::okay(delivery_id))
    }

    async fn incoming_transfer<S: FrameSink>(
        &mut self,
        sink: &mut S,
        transfer: Transfer,
    ) -> AppResult<()> {
        self.next_incoming_id = Some(self.next_incoming_id.unwrap_or(0).wrapping_add(1));
        self.remote_outgoing_window -= 1;
        self.incoming_window = self.incoming_window.saturating_sub(1);

        let Some(name) = self.input_handles.get(&transfer.handle).cloned() else {
            return self.unattached_handle(sink, transfer.handle).await;
        };
        let outputs = self.link_mut(&name)?.incoming_transfer(transfer)?;
        self.send_link_outputs(sink, outputs).await?;

        if self.incoming_window == 0 {
            self.incoming_window = self.target_incoming_window;
            self.outgoing_flow(sink, None).await?;
        }
        Ok(())
    }

    async fn incoming_disposition<S: FrameSink>(
        &mut self,
        sink: &mut S,
        disposition: Disposition,
    ) -> AppResult<()> {
        let mut outputs = Vec::new();
        for name in self.input_handles.values() {
            if let Some(link) = self.links.get_mut(name) {
                outputs.extend(link.incoming_disposition(&disposition));
            }
        }
        self.send_link_outputs(sink, outputs).await
    }

    async fn incoming_detach<S: FrameSink>(&mut self, sink: &mut S, detach: Detach) -> AppResult<()> {
        let Some(name) = self.input_handles.get(&detach.handle).cloned() else {
            return self.unattached_handle(sink, detach.handle).await;
        };
        let link = self.link_mut(&name)?;
        let outputs = link.incoming_detach(&detach);
        let detached = link.state() == LinkState::Detached;
        self.send_link_outputs(sink, outputs).await?;
        if detached {
            self.remove_link(&name);
        }
        Ok(())
    }

    /// The peer used a handle that is not attached: end the session with
    /// `amqp:session:unattached-handle`.
    async fn unattached_handle<S: FrameSink>(&mut self, sink: &mut S, handle: u32) -> AppResult<()> {
        warn!(
            "Session '{}' received a frame for unattached handle {}",
            self.name, handle
        );
        let error = AmqpError::new(
            condition::UNATTACHED_HANDLE,
            format!("handle {} is not attached", handle),
        );
        self.outgoing_end(sink, Some(error)).await?;
        self.set_state(sink, SessionState::Discarding).await?;
        Err(AppError::UnattachedHandle(handle))
    }

    /// The peer attached a second link on a handle it already uses: end the
    /// session with `amqp:session:handle-in-use`.
    async fn handle_in_use<S: FrameSink>(
        &mut self,
        sink: &mut S,
        handle: u32,
        holder: &str,
        name: &str,
    ) -> AppResult<()> {
        warn!(
            "Session '{}' received attach of '{}' on handle {} held by '{}'",
            self.name, name, handle, holder
        );
        let error = AmqpError::new(
            condition::HANDLE_IN_USE,
            format!("handle {} is in use by link '{}'", handle, holder),
        );
        self.outgoing_end(sink, Some(error)).await?;
        self.set_state(sink, SessionState::Discarding).await?;
        Err(AppError::HandleInUse(handle))
    }

    /// Routes one incoming session frame. `remote_channel` is the channel the
    /// frame arrived on.
    pub async fn incoming_frame<S: FrameSink>(
        &mut self,
        sink: &mut S,
        remote_channel: u16,
        frame: Performative,
    ) -> AppResult<()> {
        match frame {
            Performative::Begin(begin) => self.incoming_begin(sink, remote_channel, begin).await,
            Performative::End(end) => self.incoming_end(sink, end).await,
            Performative::Attach(attach) => self.incoming_attach(sink, attach).await,
            Performative::Flow(flow) => self.incoming_flow(sink, flow).await,
            Performative::Transfer(transfer) => self.incoming_transfer(sink, transfer).await,
            Performative::Disposition(disposition) => {
                self.incoming_disposition(sink, disposition).await
            }
            Performative::Detach(detach) => self.incoming_detach(sink, detach).await,
            other => Err(AppError::MalformedProtocol(format!(
                "{} is not a session frame",
                other.name()
            ))),
        }
    }

    /// Sends Begin and moves to BEGIN_SENT. Waiting for the answer is up to
    /// the connection; without a wait the peer must allow pipelined open.
    pub async fn begin<S: FrameSink>(&mut self, sink: &mut S, wait: WaitMode) -> AppResult<()> {
        if !wait.is_waiting() && !self.allow_pipelined_open {
            return Err(AppError::PolicyViolation(
                "pipelined open is not allowed, a wait mode is required".to_string(),
            ));
        }
        if self.state != SessionState::Unmapped {
            return Err(AppError::IllegalStateError(format!(
                "session '{}' cannot begin in state {:?}",
                self.name, self.state
            )));
        }
        self.outgoing_begin(sink).await?;
        self.set_state(sink, SessionState::BeginSent).await
    }

    /// Sends End. With an error the session is discarded at once, otherwise
    /// it waits in END_SENT for the peer's End.
    pub async fn end<S: FrameSink>(
        &mut self,
        sink: &mut S,
        error: Option<AmqpError>,
    ) -> AppResult<()> {
        if matches!(
            self.state,
            SessionState::Unmapped | SessionState::Discarding
        ) {
            return Ok(());
        }
        let discard = error.is_some();
        self.outgoing_end(sink, error).await?;
        let state = if discard {
            SessionState::Discarding
        } else {
            SessionState::EndSent
        };
        self.set_state(sink, state).await
    }

    fn link_config_or_default(&self, config: Option<LinkConfig>) -> LinkConfig {
        config.unwrap_or_else(|| self.link_config.clone())
    }

    /// Registers a sending link to `target_address`. It attaches when the
    /// session maps, or on [`Session::attach_link`] if already mapped.
    pub fn create_sender_link(
        &mut self,
        target_address: &str,
        config: Option<LinkConfig>,
    ) -> AppResult<String> {
        let handle = self.next_output_handle()?;
        let name = format!("sender-link-{}", Uuid::new_v4());
        let config = self.link_config_or_default(config);
        let link = SenderLink::new(
            name.clone(),
            handle,
            Some(Source::new(name.clone())),
            Some(Target::new(target_address)),
            &config,
        )?;
        self.register_link(Link::Sender(link));
        debug!(
            "Session '{}' created sender link '{}' to '{}' on handle {}",
            self.name, name, target_address, handle
        );
        Ok(name)
    }

    pub fn create_receiver_link(
        &mut self,
        source_address: &str,
        config: Option<LinkConfig>,
    ) -> AppResult<String> {
        let handle = self.next_output_handle()?;
        let name = format!("receiver-link-{}", Uuid::new_v4());
        let config = self.link_config_or_default(config);
        let link = ReceiverLink::new(
            name.clone(),
            handle,
            Some(Source::new(source_address)),
            Some(Target::new(name.clone())),
            &config,
        )?;
        self.register_link(Link::Receiver(link));
        debug!(
            "Session '{}' created receiver link '{}' from '{}' on handle {}",
            self.name, name, source_address, handle
        );
        Ok(name)
    }

    pub async fn attach_link<S: FrameSink>(&mut self, sink: &mut S, name: &str) -> AppResult<()> {
        let mapped = self.state == SessionState::Mapped;
        let link = self.link_mut(name)?;
        if !mapped {
            link.core_mut().is_closed = false;
            return Ok(());
        }
        let outputs = link.attach();
        self.send_link_outputs(sink, outputs).await
    }

    /// Detaches a link, closing it when `close` is set. A link that never
    /// attached is released right away.
    pub async fn detach_link<S: FrameSink>(
        &mut self,
        sink: &mut S,
        name: &str,
        close: bool,
        error: Option<AmqpError>,
    ) -> AppResult<()> {
        let link = self.link_mut(name)?;
        if link.state() == LinkState::Detached {
            self.remove_link(name);
            return Ok(());
        }
        let outputs = link.detach(close, error);
        self.send_link_outputs(sink, outputs).await
    }

    /// Sends one message on a sending link.
    pub async fn send<S: FrameSink>(
        &mut self,
        sink: &mut S,
        name: &str,
        payload: Bytes,
        settled: bool,
    ) -> AppResult<TransferResult> {
        if self.state != SessionState::Mapped {
            return Ok(TransferResult::error());
        }
        let sender = self
            .link_mut(name)?
            .as_sender_mut()
            .ok_or_else(|| AppError::InvalidValue(format!("link '{}' is not a sender", name)))?;
        let Some(transfer) = sender.prepare_transfer(payload, settled)? else {
            return Ok(TransferResult::busy());
        };
        let booked = Transfer {
            payload: Bytes::new(),
            ..transfer.clone()
        };
        let result = self.outgoing_transfer(sink, transfer).await?;
        if let Some(delivery_id) = result.delivery_id {
            if let Some(sender) = self.link_mut(name)?.as_sender_mut() {
                sender.on_transfer_sent(delivery_id, &booked, Instant::now());
            }
        }
        Ok(result)
    }

    pub async fn issue_credit<S: FrameSink>(
        &mut self,
        sink: &mut S,
        name: &str,
        credit: u32,
    ) -> AppResult<()> {
        let receiver = self
            .link_mut(name)?
            .as_receiver_mut()
            .ok_or_else(|| AppError::InvalidValue(format!("link '{}' is not a receiver", name)))?;
        let outputs = receiver.issue_credit(credit)?;
        self.send_link_outputs(sink, outputs).await
    }

    pub async fn settle<S: FrameSink>(
        &mut self,
        sink: &mut S,
        name: &str,
        delivery_id: u32,
        state: DeliveryState,
    ) -> AppResult<()> {
        let receiver = self
            .link_mut(name)?
            .as_receiver_mut()
            .ok_or_else(|| AppError::InvalidValue(format!("link '{}' is not a receiver", name)))?;
        let outputs = receiver.settle(delivery_id, state)?;
        self.send_link_outputs(sink, outputs).await
    }

    /// Next message received on a receiving link, if any.
    pub fn receive(&mut self, name: &str) -> AppResult<Option<ReceivedMessage>> {
        let receiver = self
            .link_mut(name)?
            .as_receiver_mut()
            .ok_or_else(|| AppError::InvalidValue(format!("link '{}' is not a receiver", name)))?;
        Ok(receiver.pop_received())
    }

    /// Removes and returns the final state of an unsettled delivery sent on
    /// `name`. `None` while the delivery is still in flight.
    pub fn take_outcome(&mut self, name: &str, delivery_id: u32) -> AppResult<Option<DeliveryOutcome>> {
        let sender = self
            .link_mut(name)?
            .as_sender_mut()
            .ok_or_else(|| AppError::InvalidValue(format!("link '{}' is not a sender", name)))?;
        Ok(sender.take_outcome(delivery_id))
    }
}
