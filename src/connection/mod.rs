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

//! Connection Implementation
//!
//! A connection owns the transport and every session multiplexed over it.
//! All frames are read and dispatched by the task that drives the
//! connection, either through [`Connection::listen`] or [`Connection::run`].
//!
//! Sessions emit frames through the [`FrameSink`] handed to them, which the
//! connection implements with [`ConnectionIo`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::network::Transport;
use crate::protocol::{
    condition, AmqpError, Begin, Close, Frame, Open, Performative, AMQP_HEADER_FRAME,
    MIN_MAX_FRAME_SIZE,
};
use crate::service::{ClientConfig, SessionConfig, Shutdown};
use crate::session::{Session, SessionState, WaitMode, WaitOutcome};
use crate::{AppError, AppResult};

pub use state::ConnectionState;

mod state;

/// What a session needs from its connection.
#[allow(async_fn_in_trait)]
pub trait FrameSink {
    fn state(&self) -> ConnectionState;

    /// Largest frame both ends accept.
    fn max_frame_size(&self) -> u32;

    async fn process_outgoing_frame(&mut self, channel: u16, frame: Performative) -> AppResult<()>;
}

/// The half of a connection sessions write through.
#[derive(Debug)]
pub struct ConnectionIo {
    transport: Transport,
    state: ConnectionState,
    max_frame_size: u32,
    remote_max_frame_size: u32,
}

impl ConnectionIo {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn send_connection_frame(&self, frame: Performative) -> AppResult<()> {
        self.transport.send_frame(0, Some(&frame)).await
    }
}

impl FrameSink for ConnectionIo {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn max_frame_size(&self) -> u32 {
        self.max_frame_size.min(self.remote_max_frame_size)
    }

    async fn process_outgoing_frame(&mut self, channel: u16, frame: Performative) -> AppResult<()> {
        if !self.state.accepts_session_frames() {
            return Err(AppError::IllegalStateError(format!(
                "connection in state {:?} cannot send {}",
                self.state,
                frame.name()
            )));
        }
        self.transport.send_frame(channel, Some(&frame)).await
    }
}

#[derive(Debug)]
pub struct Connection {
    io: ConnectionIo,
    config: ClientConfig,
    container_id: String,
    remote_container_id: Option<String>,
    remote_channel_max: u16,
    sessions: HashMap<u16, Session>,
    /// peer channel -> local channel
    incoming_channels: HashMap<u16, u16>,
    idle_wait: Duration,
}

impl Connection {
    /// Connects the transport described by `config`. The AMQP handshake is
    /// started by [`Connection::open`].
    pub async fn connect(config: ClientConfig) -> AppResult<Connection> {
        let transport = Transport::new(&config.transport);
        transport.connect().await?;
        Ok(Connection::new(transport, config))
    }

    pub fn new(transport: Transport, config: ClientConfig) -> Connection {
        let container_id = config
            .connection
            .container_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        transport.set_max_frame_size(config.connection.max_frame_size);
        Connection {
            io: ConnectionIo {
                transport,
                state: ConnectionState::Start,
                max_frame_size: config.connection.max_frame_size,
                remote_max_frame_size: u32::MAX,
            },
            container_id,
            remote_container_id: None,
            remote_channel_max: u16::MAX,
            sessions: HashMap::new(),
            incoming_channels: HashMap::new(),
            idle_wait: Duration::from_millis(config.connection.idle_wait_time_ms.max(1)),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.io.state
    }
    pub fn container_id(&self) -> &str {
        &self.container_id
    }
    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_container_id.as_deref()
    }
    pub fn max_frame_size(&self) -> u32 {
        self.io.max_frame_size()
    }
    pub fn transport(&self) -> &Transport {
        &self.io.transport
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let previous = self.io.state;
        if previous == state {
            return;
        }
        self.io.state = state;
        info!("Connection state changed: {:?} -> {:?}", previous, state);
        for session in self.sessions.values_mut() {
            if let Err(e) = session.on_connection_state_change(&mut self.io).await {
                warn!(
                    "Session '{}' failed to follow connection state {:?}: {}",
                    session.name(),
                    state,
                    e
                );
            }
        }
    }

    /// Negotiates TLS if active, exchanges the AMQP header and sends Open.
    pub async fn open(&mut self, wait: WaitMode) -> AppResult<WaitOutcome> {
        if self.io.state != ConnectionState::Start {
            return Err(AppError::IllegalStateError(format!(
                "connection cannot open in state {:?}",
                self.io.state
            )));
        }
        self.io.transport.connect().await?;
        self.io.transport.negotiate().await?;
        self.io.transport.exchange_header(&AMQP_HEADER_FRAME).await?;
        self.set_state(ConnectionState::HdrExch).await;

        let open = Open {
            container_id: self.container_id.clone(),
            hostname: self
                .config
                .connection
                .hostname
                .clone()
                .or_else(|| Some(self.config.transport.host.clone())),
            max_frame_size: Some(self.io.max_frame_size),
            channel_max: Some(self.config.connection.channel_max),
            ..Default::default()
        };
        self.io
            .send_connection_frame(Performative::Open(open))
            .await?;
        self.set_state(ConnectionState::OpenSent).await;

        if !wait.is_waiting() {
            return Ok(WaitOutcome::NotWaited);
        }
        self.wait_until(wait, |c| c.io.state == ConnectionState::Opened)
            .await
    }

    /// Sends Close. Waiting ends when the peer's Close arrives; a timed out
    /// wait drops the transport anyway.
    pub async fn close(
        &mut self,
        error: Option<AmqpError>,
        wait: WaitMode,
    ) -> AppResult<WaitOutcome> {
        match self.io.state {
            ConnectionState::End => return Ok(WaitOutcome::Reached),
            ConnectionState::Start => {
                self.finish().await;
                return Ok(WaitOutcome::Reached);
            }
            ConnectionState::CloseSent | ConnectionState::Discarding => {}
            _ => {
                self.io
                    .send_connection_frame(Performative::Close(Close { error }))
                    .await?;
                self.set_state(ConnectionState::CloseSent).await;
            }
        }
        if !wait.is_waiting() {
            return Ok(WaitOutcome::NotWaited);
        }
        let outcome = self
            .wait_until(wait, |c| c.io.state == ConnectionState::End)
            .await;
        if !matches!(outcome, Ok(WaitOutcome::Reached)) {
            self.finish().await;
        }
        outcome
    }

    async fn finish(&mut self) {
        self.set_state(ConnectionState::End).await;
        self.io.transport.close().await;
    }

    /// Best effort Close describing `cause`, then the connection ends.
    async fn fail(&mut self, cause: &AppError) {
        error!("Connection failed: {}", cause);
        if self.io.transport.is_connected()
            && !matches!(
                self.io.state,
                ConnectionState::Start | ConnectionState::CloseSent | ConnectionState::End
            )
        {
            let condition = match cause {
                AppError::MalformedProtocol(_) => condition::DECODE_ERROR,
                _ => condition::INTERNAL_ERROR,
            };
            let close = Close {
                error: Some(AmqpError::new(condition, cause.to_string())),
            };
            if let Err(e) = self
                .io
                .send_connection_frame(Performative::Close(close))
                .await
            {
                debug!("Close after failure not sent: {}", e);
            }
        }
        self.finish().await;
    }

    /// Polls the transport until `reached` holds or the wait runs out.
    async fn wait_until<F>(&mut self, wait: WaitMode, reached: F) -> AppResult<WaitOutcome>
    where
        F: Fn(&Connection) -> bool,
    {
        let deadline = wait.deadline(Instant::now());
        loop {
            if reached(&*self) {
                return Ok(WaitOutcome::Reached);
            }
            if self.io.state == ConnectionState::End {
                return Err(AppError::ConnectionClosed(
                    "connection ended while waiting".to_string(),
                ));
            }
            let poll = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    self.idle_wait.min(deadline - now)
                }
                None => self.idle_wait,
            };
            self.listen(Some(poll)).await?;
        }
    }

    /// Reads and dispatches at most one frame. Errors that concern a single
    /// session are logged and swallowed; anything else ends the connection.
    pub async fn listen(&mut self, wait: Option<Duration>) -> AppResult<()> {
        let received = match self.io.transport.receive_frame(wait).await {
            Ok(received) => received,
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };
        let Some((channel, frame)) = received else {
            return Ok(());
        };
        let frame = match frame {
            Frame::Heartbeat => {
                trace!("Heartbeat on channel {}", channel);
                return Ok(());
            }
            Frame::Performative(frame) => frame,
        };
        match self.incoming_frame(channel, frame).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_session_scoped() => {
                warn!("Frame on channel {} failed: {}", channel, e);
                Ok(())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn incoming_frame(&mut self, channel: u16, frame: Performative) -> AppResult<()> {
        match frame {
            Performative::Open(open) => self.incoming_open(open).await,
            Performative::Close(close) => self.incoming_close(close).await,
            Performative::Begin(begin) => self.incoming_begin(channel, begin).await,
            frame => {
                let local = *self
                    .incoming_channels
                    .get(&channel)
                    .ok_or(AppError::UnknownChannel(channel))?;
                let session = self
                    .sessions
                    .get_mut(&local)
                    .ok_or(AppError::UnknownChannel(channel))?;
                let result = session.incoming_frame(&mut self.io, channel, frame).await;
                if session.state() == SessionState::Unmapped {
                    debug!(
                        "Session '{}' on channel {} unmapped, releasing it",
                        session.name(),
                        local
                    );
                    self.release_session(local);
                }
                result
            }
        }
    }

    async fn incoming_open(&mut self, open: Open) -> AppResult<()> {
        if self.io.state != ConnectionState::OpenSent {
            return Err(AppError::MalformedProtocol(format!(
                "unexpected open in state {:?}",
                self.io.state
            )));
        }
        let remote_max_frame_size = open.max_frame_size.unwrap_or(u32::MAX);
        if remote_max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "peer max frame size {} is below {}",
                remote_max_frame_size, MIN_MAX_FRAME_SIZE
            )));
        }
        self.io.remote_max_frame_size = remote_max_frame_size;
        self.remote_channel_max = open.channel_max.unwrap_or(u16::MAX);
        self.remote_container_id = Some(open.container_id);
        self.set_state(ConnectionState::Opened).await;
        Ok(())
    }

    async fn incoming_close(&mut self, close: Close) -> AppResult<()> {
        if let Some(error) = &close.error {
            warn!("Connection closed by peer: {}", error);
        }
        if self.io.state != ConnectionState::CloseSent {
            self.set_state(ConnectionState::CloseRcvd).await;
            self.io
                .send_connection_frame(Performative::Close(Close::default()))
                .await?;
        }
        self.finish().await;
        Ok(())
    }

    async fn incoming_begin(&mut self, channel: u16, begin: Begin) -> AppResult<()> {
        match begin.remote_channel {
            Some(local) => {
                let session = self
                    .sessions
                    .get_mut(&local)
                    .ok_or(AppError::UnknownChannel(local))?;
                self.incoming_channels.insert(channel, local);
                session
                    .incoming_frame(&mut self.io, channel, Performative::Begin(begin))
                    .await
            }
            None => {
                let local = self.next_channel()?;
                let session = Session::from_incoming_frame(
                    &mut self.io,
                    local,
                    channel,
                    begin,
                    &self.config.session,
                    self.config.link.clone(),
                )
                .await?;
                debug!(
                    "Peer began session '{}' on channel {}, mapped to {}",
                    session.name(),
                    channel,
                    local
                );
                self.incoming_channels.insert(channel, local);
                self.sessions.insert(local, session);
                Ok(())
            }
        }
    }

    /// Lowest channel not used by a local session.
    fn next_channel(&self) -> AppResult<u16> {
        let channel_max = self.config.connection.channel_max.min(self.remote_channel_max);
        (0..=channel_max)
            .find(|channel| !self.sessions.contains_key(channel))
            .ok_or_else(|| {
                AppError::IllegalStateError(format!("all {} channels are in use", channel_max as u32 + 1))
            })
    }

    /// Registers a new session on the lowest free channel. `config` falls
    /// back to the connection's session defaults.
    pub fn create_session(&mut self, config: Option<SessionConfig>) -> AppResult<u16> {
        let channel = self.next_channel()?;
        let config = config.unwrap_or_else(|| self.config.session.clone());
        let session = Session::new(channel, &config, self.config.link.clone());
        debug!("Created session '{}' on channel {}", session.name(), channel);
        self.sessions.insert(channel, session);
        Ok(channel)
    }

    pub fn session(&self, channel: u16) -> Option<&Session> {
        self.sessions.get(&channel)
    }

    /// A session together with the sink its operations write to.
    pub fn session_parts(&mut self, channel: u16) -> AppResult<(&mut Session, &mut ConnectionIo)> {
        let session = self
            .sessions
            .get_mut(&channel)
            .ok_or(AppError::UnknownChannel(channel))?;
        Ok((session, &mut self.io))
    }

    pub fn release_session(&mut self, channel: u16) -> Option<Session> {
        self.incoming_channels.retain(|_, local| *local != channel);
        self.sessions.remove(&channel)
    }

    pub async fn begin_session(&mut self, channel: u16, wait: WaitMode) -> AppResult<WaitOutcome> {
        let (session, io) = self.session_parts(channel)?;
        session.begin(io, wait).await?;
        if !wait.is_waiting() {
            return Ok(WaitOutcome::NotWaited);
        }
        self.wait_for_session_state(channel, SessionState::Mapped, wait)
            .await
    }

    pub async fn end_session(
        &mut self,
        channel: u16,
        error: Option<AmqpError>,
        wait: WaitMode,
    ) -> AppResult<WaitOutcome> {
        let (session, io) = self.session_parts(channel)?;
        session.end(io, error).await?;
        if session.state() != SessionState::EndSent {
            return Ok(WaitOutcome::Reached);
        }
        if !wait.is_waiting() {
            return Ok(WaitOutcome::NotWaited);
        }
        self.wait_for_session_state(channel, SessionState::Unmapped, wait)
            .await
    }

    pub async fn wait_for_session_state(
        &mut self,
        channel: u16,
        state: SessionState,
        wait: WaitMode,
    ) -> AppResult<WaitOutcome> {
        // unmapped sessions are released, so a missing one counts as unmapped
        self.wait_until(wait, |c| match c.sessions.get(&channel) {
            Some(session) => session.state() == state,
            None => state == SessionState::Unmapped,
        })
        .await
    }

    /// Gives every session a chance to act on its timers.
    pub async fn evaluate_status(&mut self) -> AppResult<()> {
        for session in self.sessions.values_mut() {
            if let Err(e) = session.evaluate_status(&mut self.io).await {
                if !e.is_session_scoped() {
                    return Err(e);
                }
                warn!("Session '{}' status check failed: {}", session.name(), e);
            }
        }
        Ok(())
    }

    /// Drives the connection until it ends. A shutdown request is checked
    /// between two polls and closes the connection gracefully.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> AppResult<()> {
        while self.io.state != ConnectionState::End {
            if shutdown.is_shutdown() {
                debug!("Shutdown requested, closing connection");
                let limit = Duration::from_millis(self.config.connection.close_timeout_ms);
                self.close(None, WaitMode::Timeout(limit)).await?;
                break;
            }
            self.listen(Some(self.idle_wait)).await?;
            self.evaluate_status().await?;
        }
        Ok(())
    }
}
