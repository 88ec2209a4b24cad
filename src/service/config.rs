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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::{SocketSettings, TlsConfig, TlsOptions};
use crate::protocol::{DEFAULT_INCOMING_WINDOW, DEFAULT_OUTGOING_WINDOW, MAX_FRAME_SIZE_BYTES};

use super::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    /// treat an interrupted first read of a frame as "no data yet"
    pub raise_on_initial_eintr: bool,
    pub socket: SocketSettings,
    pub tls: Option<TlsOptions>,
    /// A pre-built rustls context. Takes precedence over `tls` and is never
    /// read from or written to a config file.
    #[serde(skip)]
    pub tls_context: Option<Arc<rustls::ClientConfig>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "localhost".to_string(),
            port: 5672,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            raise_on_initial_eintr: true,
            socket: SocketSettings::default(),
            tls: None,
            tls_context: None,
        }
    }
}

impl TransportConfig {
    pub fn tls_config(&self) -> TlsConfig {
        if let Some(context) = &self.tls_context {
            TlsConfig::Context(context.clone())
        } else if let Some(options) = &self.tls {
            TlsConfig::Options(options.clone())
        } else {
            TlsConfig::Disabled
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// generated when absent
    pub container_id: Option<String>,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// interval between two polls of the transport while waiting for a state
    pub idle_wait_time_ms: u64,
    /// how long a shutdown waits for the peer's close
    pub close_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            container_id: None,
            hostname: None,
            max_frame_size: MAX_FRAME_SIZE_BYTES,
            channel_max: u16::MAX,
            idle_wait_time_ms: 100,
            close_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
    pub offered_capabilities: Option<Vec<String>>,
    pub desired_capabilities: Option<Vec<String>>,
    pub allow_pipelined_open: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            next_outgoing_id: 0,
            incoming_window: DEFAULT_INCOMING_WINDOW,
            outgoing_window: DEFAULT_OUTGOING_WINDOW,
            handle_max: u32::MAX,
            offered_capabilities: None,
            desired_capabilities: None,
            allow_pipelined_open: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfig {
    /// credit a receiver grants once attached and refills to when exhausted
    pub prefetch: u32,
    pub auto_accept: bool,
    pub send_timeout_ms: Option<u64>,
    pub max_message_size: Option<u64>,
    /// 0 = unsettled, 1 = settled, 2 = mixed
    pub snd_settle_mode: u8,
    /// 0 = first, 1 = second
    pub rcv_settle_mode: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            prefetch: 300,
            auto_accept: true,
            send_timeout_ms: None,
            max_message_size: None,
            snd_settle_mode: 2,
            rcv_settle_mode: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub link: LinkConfig,
}

impl ClientConfig {
    /// Load the client configuration from a file, with `STONEAMQP__SECTION__KEY`
    /// environment variables layered on top.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ClientConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STONEAMQP").separator("__"))
            .build()?;

        let client_config: ClientConfig = config.try_deserialize()?;
        Ok(client_config)
    }
}
