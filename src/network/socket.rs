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

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::{AppError, AppResult};

/// TCP socket options. Every field left unset falls back to the value in
/// [`SocketSettings::defaults`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketSettings {
    pub keepalive: Option<bool>,
    pub nodelay: Option<bool>,
    pub linger_secs: Option<u64>,
    pub recv_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
}

impl SocketSettings {
    pub fn defaults() -> SocketSettings {
        SocketSettings {
            keepalive: Some(true),
            nodelay: Some(true),
            linger_secs: None,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// The overrides in `self` layered on top of the defaults.
    pub fn merged(&self) -> SocketSettings {
        let defaults = SocketSettings::defaults();
        SocketSettings {
            keepalive: self.keepalive.or(defaults.keepalive),
            nodelay: self.nodelay.or(defaults.nodelay),
            linger_secs: self.linger_secs.or(defaults.linger_secs),
            recv_buffer_size: self.recv_buffer_size.or(defaults.recv_buffer_size),
            send_buffer_size: self.send_buffer_size.or(defaults.send_buffer_size),
        }
    }

    fn apply_before_connect(&self, socket: &TcpSocket) -> io::Result<()> {
        if let Some(keepalive) = self.keepalive {
            socket.set_keepalive(keepalive)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(secs) = self.linger_secs {
            socket.set_linger(Some(Duration::from_secs(secs)))?;
        }
        Ok(())
    }

    fn apply_after_connect(&self, stream: &TcpStream) -> io::Result<()> {
        if let Some(nodelay) = self.nodelay {
            stream.set_nodelay(nodelay)?;
        }
        Ok(())
    }
}

/// Resolves `host` and connects to the first reachable address, trying IPv4
/// addresses before IPv6 ones. Sockets of failed attempts are dropped before
/// the next attempt starts.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    settings: &SocketSettings,
    connect_timeout: Option<Duration>,
) -> AppResult<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(AppError::DetailedIoError(format!(
            "failed to resolve host {}",
            host
        )));
    }
    let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.into_iter().partition(|addr| addr.is_ipv4());

    let settings = settings.merged();
    let mut last_error = None;
    for addr in v4.into_iter().chain(v6) {
        match connect_addr(addr, &settings, connect_timeout).await {
            Ok(stream) => {
                debug!("connected to {} ({})", host, addr);
                return Ok(stream);
            }
            Err(e) => {
                warn!("connect to {} ({}) failed: {}", host, addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| AppError::DetailedIoError(format!("failed to connect to {}", host))))
}

async fn connect_addr(
    addr: SocketAddr,
    settings: &SocketSettings,
    connect_timeout: Option<Duration>,
) -> AppResult<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    settings.apply_before_connect(&socket)?;
    let stream = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, socket.connect(addr))
            .await
            .map_err(|_| AppError::Timeout)??,
        None => socket.connect(addr).await?,
    };
    settings.apply_after_connect(&stream)?;
    Ok(stream)
}
