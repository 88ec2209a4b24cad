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

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::socket::connect_tcp;
use super::tls::server_name;
use super::{SocketSettings, TlsConfig};
use crate::protocol::{
    decode_empty_frame, decode_frame, encode_frame, Frame, FrameHeader, Performative,
    FRAME_HEADER_SIZE, FRAME_TYPE_AMQP, SIGNED_INT_MAX, TLS_HEADER_FRAME,
};
use crate::service::TransportConfig;
use crate::{AppError, AppResult};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Most bytes reserved ahead of a single socket read.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct ReadOptions {
    timeout: Option<Duration>,
    raise_on_initial_eintr: bool,
}

/// Read side of the transport together with the bytes of a frame whose read
/// was interrupted. The next read starts from those bytes, so a timeout never
/// loses frame alignment.
struct FrameReader {
    stream: Option<BoxedReader>,
    buffer: BytesMut,
}

impl FrameReader {
    /// Puts `partial` back in front of whatever is still buffered.
    fn restore(&mut self, mut partial: BytesMut) {
        partial.unsplit(std::mem::take(&mut self.buffer));
        self.buffer = partial;
    }

    /// Reads exactly `size` bytes, draining the internal buffer first.
    async fn read_exact(
        &mut self,
        size: usize,
        initial: bool,
        options: ReadOptions,
    ) -> AppResult<BytesMut> {
        let buffered = size.min(self.buffer.len());
        let mut out = self.buffer.split_to(buffered);
        let mut interrupted = false;

        while out.len() < size {
            let Some(stream) = self.stream.as_mut() else {
                self.restore(out);
                return Err(AppError::ConnectionClosed("transport is closed".to_string()));
            };
            let remaining = size - out.len();
            out.reserve(remaining.min(READ_CHUNK));
            let mut limited = stream.take(remaining as u64);
            let read = limited.read_buf(&mut out);
            let result = match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => Err(ErrorKind::TimedOut.into()),
                },
                None => read.await,
            };
            match result {
                Ok(0) => {
                    self.restore(out);
                    return Err(AppError::ConnectionClosed(
                        "server unexpectedly closed connection".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                    // nothing of this frame has arrived yet
                    if initial && out.is_empty() && options.raise_on_initial_eintr {
                        if interrupted {
                            self.restore(out);
                            return Err(AppError::Timeout);
                        }
                        interrupted = true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    self.restore(out);
                    return Err(AppError::Timeout);
                }
                Err(e) => {
                    self.restore(out);
                    return Err(e.into());
                }
            }
        }
        Ok(out)
    }

    /// Reads one whole frame of at most `max_frame_size` bytes. Payloads
    /// bigger than `ceiling` are read in several pieces. On failure every
    /// byte of the frame read so far goes back to the buffer.
    async fn read_frame(
        &mut self,
        options: ReadOptions,
        max_frame_size: u32,
        ceiling: usize,
    ) -> AppResult<(Bytes, FrameHeader, Option<Bytes>)> {
        let raw_header = self.read_exact(FRAME_HEADER_SIZE, true, options).await?;
        let header = FrameHeader::parse(&raw_header)?;
        if header.size > max_frame_size {
            return Err(AppError::MalformedProtocol(format!(
                "frame of {} bytes on channel {} exceeds the max frame size {}",
                header.size, header.channel, max_frame_size
            )));
        }
        if header.is_empty_frame() {
            return Ok((raw_header.freeze(), header, None));
        }
        if header.frame_type != FRAME_TYPE_AMQP {
            return Err(AppError::MalformedProtocol(format!(
                "unsupported frame type {:#04x} on channel {}",
                header.frame_type, header.channel
            )));
        }
        let skip = header.extended_header_len()?;

        let payload_size = header.body_len();
        let mut payload = BytesMut::new();
        while payload.len() < payload_size {
            let chunk = ceiling.min(payload_size - payload.len());
            match self.read_exact(chunk, false, options).await {
                Ok(part) => payload.unsplit(part),
                Err(e) => {
                    let mut partial = raw_header;
                    partial.unsplit(payload);
                    self.restore(partial);
                    return Err(e);
                }
            }
        }
        payload.advance(skip);
        Ok((raw_header.freeze(), header, Some(payload.freeze())))
    }
}

/// Moves whole AMQP frames over a TCP or TLS byte stream.
///
/// Reads are serialized by the reader lock, writes by a separate writer
/// lock, so a pending read never blocks a write.
pub struct Transport {
    host: String,
    port: u16,
    socket_settings: SocketSettings,
    tls: TlsConfig,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    raise_on_initial_eintr: bool,
    max_frame_size: AtomicU32,
    reader: Mutex<FrameReader>,
    writer: Mutex<Option<BoxedWriter>>,
    connected: AtomicBool,
    tls_active: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .field("tls", &self.tls.is_enabled())
            .finish()
    }
}

impl Transport {
    /// A transport for `config`, not yet connected.
    pub fn new(config: &TransportConfig) -> Transport {
        Transport {
            host: config.host.clone(),
            port: config.port,
            socket_settings: config.socket.clone(),
            tls: config.tls_config(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            raise_on_initial_eintr: config.raise_on_initial_eintr,
            max_frame_size: AtomicU32::new(u32::MAX),
            reader: Mutex::new(FrameReader {
                stream: None,
                buffer: BytesMut::new(),
            }),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            tls_active: AtomicBool::new(false),
        }
    }

    /// A connected transport over an already established stream. TLS
    /// options in `config` are not applied to it.
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Transport
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::new(config);
        let (read_half, write_half) = tokio::io::split(stream);
        transport.install(Box::new(read_half), Box::new(write_half));
        transport
    }

    fn install(&self, read_half: BoxedReader, write_half: BoxedWriter) {
        // the transport is not shared yet, the locks are free
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.stream = Some(read_half);
            reader.buffer.clear();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = Some(write_half);
        }
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_tls(&self) -> bool {
        self.tls_active.load(Ordering::SeqCst)
    }

    /// Largest incoming frame accepted; bigger frames are a framing error.
    pub fn set_max_frame_size(&self, size: u32) {
        self.max_frame_size.store(size, Ordering::SeqCst);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::SeqCst)
    }

    /// Opens the TCP connection and runs the TLS handshake when configured.
    /// A no-op on a connected transport. On failure the half open socket is
    /// dropped before the error is returned.
    pub async fn connect(&self) -> AppResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let tls_context = self.tls.client_config()?;
        let stream = connect_tcp(
            &self.host,
            self.port,
            &self.socket_settings,
            self.connect_timeout,
        )
        .await?;

        let (read_half, write_half): (BoxedReader, BoxedWriter) = match tls_context {
            Some(context) => {
                let connector = TlsConnector::from(context);
                let handshake = connector.connect(server_name(&self.host)?, stream);
                let tls_stream = match self.connect_timeout {
                    Some(limit) => tokio::time::timeout(limit, handshake)
                        .await
                        .map_err(|_| AppError::Timeout)?,
                    None => handshake.await,
                }
                .map_err(|e| AppError::TlsError(e.to_string()))?;
                self.tls_active.store(true, Ordering::SeqCst);
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        *self.reader.lock().await = FrameReader {
            stream: Some(read_half),
            buffer: BytesMut::new(),
        };
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        debug!(
            "transport connected to {}:{} (tls: {})",
            self.host,
            self.port,
            self.is_tls()
        );
        Ok(())
    }

    fn read_options(&self, wait: Option<Duration>) -> ReadOptions {
        ReadOptions {
            timeout: wait.or(self.read_timeout),
            raise_on_initial_eintr: self.raise_on_initial_eintr,
        }
    }

    fn on_error(&self, error: &AppError) {
        if !error.is_timeout() {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Reads exactly `size` bytes. `wait` overrides the configured read
    /// timeout.
    pub async fn read_exact(&self, size: usize, wait: Option<Duration>) -> AppResult<Bytes> {
        let mut reader = self.reader.lock().await;
        match reader.read_exact(size, true, self.read_options(wait)).await {
            Ok(bytes) => Ok(bytes.freeze()),
            Err(e) => {
                self.on_error(&e);
                Err(e)
            }
        }
    }

    /// Reads one frame and returns its raw header, its channel and the
    /// performative bytes, `None` for an empty frame.
    pub async fn read_frame(
        &self,
        wait: Option<Duration>,
    ) -> AppResult<(Bytes, u16, Option<Bytes>)> {
        self.read_frame_with_ceiling(wait, SIGNED_INT_MAX).await
    }

    async fn read_frame_with_ceiling(
        &self,
        wait: Option<Duration>,
        ceiling: usize,
    ) -> AppResult<(Bytes, u16, Option<Bytes>)> {
        let mut reader = self.reader.lock().await;
        let max_frame_size = self.max_frame_size();
        match reader
            .read_frame(self.read_options(wait), max_frame_size, ceiling)
            .await
        {
            Ok((raw_header, header, payload)) => Ok((raw_header, header.channel, payload)),
            Err(e) => {
                self.on_error(&e);
                Err(e)
            }
        }
    }

    /// Receives and decodes one frame. `Ok(None)` means no frame arrived
    /// before the read timed out; partial bytes stay buffered for the next
    /// call.
    pub async fn receive_frame(&self, wait: Option<Duration>) -> AppResult<Option<(u16, Frame)>> {
        let (raw_header, channel, payload) = match self.read_frame(wait).await {
            Ok(frame) => frame,
            Err(AppError::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        };
        let frame = match payload {
            None => decode_empty_frame(&raw_header)?,
            Some(payload) => Frame::Performative(decode_frame(payload)?),
        };
        trace!("ICH{} <- {:?}", channel, frame);
        Ok(Some((channel, frame)))
    }

    pub async fn write(&self, data: &[u8]) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(AppError::ConnectionClosed("transport is closed".to_string()));
        };
        let write = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        let result = match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| AppError::Timeout)
                .and_then(|r| r.map_err(AppError::from)),
            None => write.await.map_err(AppError::from),
        };
        if let Err(e) = &result {
            self.on_error(e);
        }
        result
    }

    /// Encodes and writes one frame; `None` writes an empty frame.
    pub async fn send_frame(&self, channel: u16, frame: Option<&Performative>) -> AppResult<()> {
        let (header, body) = encode_frame(frame);
        let data = match body {
            None => header,
            Some(body) => {
                let mut data = BytesMut::with_capacity(header.len() + 2 + body.len());
                data.extend_from_slice(&header);
                data.put_u16(channel);
                data.extend_from_slice(&body);
                data.freeze()
            }
        };
        self.write(&data).await?;
        trace!("OCH{} -> {:?}", channel, frame);
        Ok(())
    }

    /// Sends an 8 byte protocol header and checks that the peer answers with
    /// the same bytes.
    pub async fn exchange_header(&self, expected: &[u8; 8]) -> AppResult<()> {
        self.write(expected).await?;
        let received = self.read_exact(expected.len(), None).await?;
        if received[..] != expected[..] {
            return Err(AppError::ProtocolMismatch {
                expected: expected.to_vec(),
                received: received.to_vec(),
            });
        }
        Ok(())
    }

    /// Exchanges the TLS protocol header. Does nothing on a plain connection.
    pub async fn negotiate(&self) -> AppResult<()> {
        if !self.is_tls() {
            return Ok(());
        }
        self.exchange_header(&TLS_HEADER_FRAME).await
    }

    /// Releases both halves of the stream. Closing a closed transport is a
    /// no-op.
    pub async fn close(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("shutdown of {}:{} failed: {}", self.host, self.port, e);
            }
        }
        let mut reader = self.reader.lock().await;
        reader.stream = None;
        reader.buffer.clear();
        self.connected.store(false, Ordering::SeqCst);
        self.tls_active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::protocol::{Begin, End, AMQP_HEADER_FRAME};

    fn transport_pair() -> (Transport, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let config = TransportConfig {
            read_timeout_ms: Some(50),
            ..Default::default()
        };
        (Transport::from_stream(local, &config), remote)
    }

    fn wire_frame(channel: u16, performative: &Performative) -> Vec<u8> {
        let (header, body) = encode_frame(Some(performative));
        let mut data = header.to_vec();
        data.extend_from_slice(&channel.to_be_bytes());
        data.extend_from_slice(&body.unwrap());
        data
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (transport, mut remote) = transport_pair();
        let begin = Performative::Begin(Begin {
            next_outgoing_id: 1,
            incoming_window: 100,
            outgoing_window: 100,
            ..Default::default()
        });
        transport.send_frame(4, Some(&begin)).await.unwrap();

        let expected = wire_frame(4, &begin);
        let mut sent = vec![0u8; expected.len()];
        remote.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, expected);

        remote.write_all(&sent).await.unwrap();
        let (channel, frame) = transport.receive_frame(None).await.unwrap().unwrap();
        assert_eq!(channel, 4);
        assert_eq!(frame, Frame::Performative(begin));
    }

    #[tokio::test]
    async fn test_partial_read_recovery() {
        let (transport, mut remote) = transport_pair();
        let end = Performative::End(End::default());
        let data = wire_frame(2, &end);

        // header and a piece of the body, then the peer goes quiet
        remote.write_all(&data[..11]).await.unwrap();
        assert!(transport.receive_frame(None).await.unwrap().is_none());
        assert!(transport.is_connected());

        remote.write_all(&data[11..]).await.unwrap();
        let (channel, frame) = transport.receive_frame(None).await.unwrap().unwrap();
        assert_eq!(channel, 2);
        assert_eq!(frame, Frame::Performative(end));
    }

    #[tokio::test]
    async fn test_partial_header_recovery() {
        let (transport, mut remote) = transport_pair();
        remote.write_all(&[0, 0, 0]).await.unwrap();
        assert!(matches!(
            transport.read_frame(None).await,
            Err(AppError::Timeout)
        ));
        remote.write_all(&[8, 2, 0, 0, 7]).await.unwrap();
        let (channel, frame) = transport.receive_frame(None).await.unwrap().unwrap();
        assert_eq!(channel, 7);
        assert_eq!(frame, Frame::Heartbeat);
    }

    #[tokio::test]
    async fn test_unexpected_close() {
        let (transport, mut remote) = transport_pair();
        remote.write_all(&[0, 0, 0, 64, 2, 0]).await.unwrap();
        drop(remote);
        let result = transport.receive_frame(None).await;
        assert!(matches!(result, Err(AppError::ConnectionClosed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_payload_read_in_chunks() {
        let (transport, mut remote) = transport_pair();
        let end = Performative::End(End {
            error: Some(crate::protocol::AmqpError::new(
                "amqp:internal-error",
                "x".repeat(300),
            )),
        });
        remote.write_all(&wire_frame(9, &end)).await.unwrap();
        let (_, channel, payload) = transport
            .read_frame_with_ceiling(None, 16)
            .await
            .unwrap();
        assert_eq!(channel, 9);
        assert_eq!(decode_frame(payload.unwrap()).unwrap(), end);
    }

    #[tokio::test]
    async fn test_extended_header_skipped() {
        let (transport, mut remote) = transport_pair();
        let end = Performative::End(End::default());
        let (_, body) = encode_frame(Some(&end));
        let body = body.unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&((16 + body.len()) as u32).to_be_bytes());
        data.extend_from_slice(&[4, 0, 0, 1]);
        data.extend_from_slice(&[0xAA; 8]);
        data.extend_from_slice(&body);
        remote.write_all(&data).await.unwrap();
        let (channel, frame) = transport.receive_frame(None).await.unwrap().unwrap();
        assert_eq!(channel, 1);
        assert_eq!(frame, Frame::Performative(end));
    }

    #[tokio::test]
    async fn test_sasl_frame_rejected() {
        let (transport, mut remote) = transport_pair();
        remote
            .write_all(&[0, 0, 0, 12, 2, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        assert!(matches!(
            transport.receive_frame(None).await,
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (transport, mut remote) = transport_pair();
        transport.set_max_frame_size(512);
        // a header announcing an almost 4 GiB frame and nothing else
        remote
            .write_all(&[0xff, 0xff, 0xff, 0xf0, 2, 0, 0, 0])
            .await
            .unwrap();
        assert!(matches!(
            transport.read_frame(None).await,
            Err(AppError::MalformedProtocol(_))
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_frame_at_max_size_accepted() {
        let (transport, mut remote) = transport_pair();
        let end = Performative::End(End::default());
        let data = wire_frame(3, &end);
        transport.set_max_frame_size(data.len() as u32);
        remote.write_all(&data).await.unwrap();
        let (channel, frame) = transport.receive_frame(None).await.unwrap().unwrap();
        assert_eq!(channel, 3);
        assert_eq!(frame, Frame::Performative(end));
    }

    #[tokio::test]
    async fn test_empty_frame_write() {
        let (transport, mut remote) = transport_pair();
        transport.send_frame(5, None).await.unwrap();
        let mut sent = [0u8; 8];
        remote.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, [0, 0, 0, 8, 2, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_header_exchange() {
        let (transport, mut remote) = transport_pair();
        let peer = tokio::spawn(async move {
            let mut header = [0u8; 8];
            remote.read_exact(&mut header).await.unwrap();
            remote.write_all(&header).await.unwrap();
            remote
        });
        transport.exchange_header(&AMQP_HEADER_FRAME).await.unwrap();
        let mut remote = peer.await.unwrap();

        let peer = tokio::spawn(async move {
            let mut header = [0u8; 8];
            remote.read_exact(&mut header).await.unwrap();
            remote.write_all(&TLS_HEADER_FRAME).await.unwrap();
            remote
        });
        let result = transport.exchange_header(&AMQP_HEADER_FRAME).await;
        match result {
            Err(AppError::ProtocolMismatch { expected, received }) => {
                assert_eq!(expected, AMQP_HEADER_FRAME.to_vec());
                assert_eq!(received, TLS_HEADER_FRAME.to_vec());
            }
            other => panic!("unexpected {:?}", other),
        }
        let _remote = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_plain_is_noop() {
        let (transport, _remote) = transport_pair();
        assert!(!transport.is_tls());
        transport.negotiate().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (transport, _remote) = transport_pair();
        transport.close().await;
        assert!(!transport.is_connected());
        transport.close().await;
        assert!(matches!(
            transport.send_frame(0, None).await,
            Err(AppError::ConnectionClosed(_))
        ));
        assert!(matches!(
            transport.receive_frame(None).await,
            Err(AppError::ConnectionClosed(_))
        ));
    }
}
