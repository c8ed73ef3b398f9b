//! WebSocket transport client: Upgrade handshake, state machine and
//! synchronous frame-level reads and writes.

use crate::config::ClientConfig;
use crate::error::Error;
use crate::frame::{self, OpCode};
use crate::handshake;
use crate::transport::{Connector, TcpConnector, Transport};
use bytes::{Buf, BytesMut};
use log::{debug, error};
use rand::random;
use std::os::unix::io::RawFd;

/// Connection state. Transitions are monotone toward the terminal states;
/// `Closed` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Never opened, or fully torn down.
    Closed,
    /// Handshake done; reads and writes are permitted.
    Ok,
    /// Protocol violation observed. Writing is still permitted so a Close
    /// frame can go out; no further reads.
    Failed,
    /// Transport-level failure; neither side may write a Close.
    FailedNoClose,
}

impl ClientState {
    fn can_write(self) -> bool {
        matches!(self, ClientState::Ok | ClientState::Failed)
    }

    fn can_read(self) -> bool {
        self == ClientState::Ok
    }
}

// Masked payload bytes are staged through a fixed buffer so writes never
// allocate per frame.
const WRITE_FRAME_BUFFER_SIZE: usize = 1024;

pub struct WsClient {
    state: ClientState,
    transport: Option<Box<dyn Transport>>,
    /// Frame bytes the HTTP layer pulled past the end of the 101 response.
    overread: BytesMut,
    response_subprotocol: Option<String>,
    close_delay_ms: u32,
}

impl WsClient {
    /// Opens a connection over plain TCP and performs the Upgrade handshake.
    /// `wss` endpoints need a TLS-capable [`Connector`] via [`Self::open_with`].
    pub fn open(config: &ClientConfig) -> Result<Self, Error> {
        let url = handshake::parse_ws_url(&config.url)?;
        if url.scheme() == "https" {
            return Err(Error::InvalidArg("wss requires a TLS connector"));
        }
        Self::open_with(config, &mut TcpConnector)
    }

    /// Opens a connection over a caller-supplied transport factory and
    /// performs the Upgrade handshake. On success the state is [`ClientState::Ok`].
    pub fn open_with(config: &ClientConfig, connector: &mut dyn Connector) -> Result<Self, Error> {
        let url = handshake::parse_ws_url(&config.url)?;
        let host = url.host_str().ok_or(Error::URLNoHost)?.to_string();
        let port = handshake::effective_port(&url);

        let mut transport = connector.connect(&host, port, config.http_timeout_ms)?;

        let key = handshake::generate_websocket_key();
        let request = handshake::construct_http_request(&url, &key, config)?;
        write_all(transport.as_mut(), request.as_bytes(), config.http_timeout_ms)?;

        let response = handshake::read_upgrade_response(
            transport.as_mut(),
            &key,
            config.subprotocols.is_some(),
            config.http_timeout_ms,
        )
        .map_err(|err| {
            error!("websocket handshake failed: {}", err);
            err
        })?;

        debug!(
            "websocket open to {} (subprotocol: {:?}, overread: {} bytes)",
            config.url,
            response.subprotocol,
            response.overread.len()
        );

        Ok(Self {
            state: ClientState::Ok,
            transport: Some(transport),
            overread: BytesMut::from(&response.overread[..]),
            response_subprotocol: response.subprotocol,
            close_delay_ms: config.close_delay_ms,
        })
    }

    /// Builds a connected client from an already-upgraded transport, e.g.
    /// when the caller ran its own handshake. `overread` holds any bytes read
    /// past the HTTP response.
    pub fn from_upgraded(
        transport: Box<dyn Transport>,
        overread: Vec<u8>,
        response_subprotocol: Option<String>,
    ) -> Self {
        Self {
            state: ClientState::Ok,
            transport: Some(transport),
            overread: BytesMut::from(&overread[..]),
            response_subprotocol,
            close_delay_ms: 0,
        }
    }

    /// Tears down the transport. Idempotent; after the call the state is
    /// [`ClientState::Closed`]. The configured close delay gives in-flight
    /// writes a chance to drain, since the transport has no explicit flush.
    pub fn close(&mut self) {
        self.state = ClientState::Closed;
        self.response_subprotocol = None;
        if let Some(_transport) = self.transport.take() {
            if self.close_delay_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(self.close_delay_ms as u64));
            }
        }
        self.overread.clear();
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Subprotocol the server selected, verbatim from the response.
    pub fn response_subprotocol(&self) -> Option<&str> {
        self.response_subprotocol.as_deref()
    }

    /// The transport fd to register with the loop, while the connection is
    /// usable.
    pub fn select_fd(&self) -> Option<RawFd> {
        let transport = self.transport.as_ref()?;
        if self.state.can_read() && self.state.can_write() {
            Some(transport.as_raw_fd())
        } else {
            None
        }
    }

    /// True while handshake overread is still buffered; those bytes are
    /// consumed before the transport is read again.
    pub fn has_buffered_read_data(&self) -> bool {
        !self.overread.is_empty()
    }

    /// Waits up to `timeout_ms` for readability; buffered overread counts as
    /// immediately readable. A timeout leaves the state unchanged.
    pub fn poll_read(&mut self, timeout_ms: u32) -> Result<(), Error> {
        let state = self.state;
        let transport = self.transport.as_ref().ok_or(Error::InvalidState("client not open"))?;
        if !state.can_read() {
            return Err(Error::InvalidState("client cannot read"));
        }
        if !self.overread.is_empty() {
            return Ok(());
        }
        match transport.poll_read(timeout_ms) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Timeout),
            Err(err) => {
                self.state = ClientState::FailedNoClose;
                Err(err)
            }
        }
    }

    /// Waits up to `timeout_ms` for writability. A timeout leaves the state
    /// unchanged.
    pub fn poll_write(&mut self, timeout_ms: u32) -> Result<(), Error> {
        let state = self.state;
        let transport = self.transport.as_ref().ok_or(Error::InvalidState("client not open"))?;
        if !state.can_write() {
            return Err(Error::InvalidState("client cannot write"));
        }
        match transport.poll_write(timeout_ms) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Timeout),
            Err(err) => {
                self.state = ClientState::FailedNoClose;
                Err(err)
            }
        }
    }

    /// Writes one frame, masked, atomically with respect to this client (all
    /// writes happen on the loop worker). Each underlying write gets at most
    /// `timeout_ms` to make progress.
    pub fn write_frame(
        &mut self,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        if self.transport.is_none() {
            return Err(Error::InvalidState("client not open"));
        }
        if !self.state.can_write() {
            return Err(Error::InvalidState("client cannot write"));
        }

        let mask: [u8; 4] = random();
        let mut header = [0u8; frame::MAX_HEADER_SIZE];
        let header_len = frame::encode_header(&mut header, fin, opcode, payload.len(), mask);

        if let Err(err) = self.write_all_masked(&header[..header_len], payload, mask, timeout_ms) {
            // We don't know why it failed, so the transport has to be
            // presumed bad.
            self.state = ClientState::FailedNoClose;
            debug!("write frame failed: {}", err);
            return Err(Error::TransportFailed);
        }
        Ok(())
    }

    fn write_all_masked(
        &mut self,
        header: &[u8],
        payload: &[u8],
        mask: [u8; 4],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or(Error::InvalidState("client not open"))?;
        write_all(transport.as_mut(), header, timeout_ms)?;

        let mut write_buf = [0u8; WRITE_FRAME_BUFFER_SIZE];
        let mut offset = 0;
        while offset < payload.len() {
            let chunk_len = (payload.len() - offset).min(WRITE_FRAME_BUFFER_SIZE);
            let chunk = &mut write_buf[..chunk_len];
            chunk.copy_from_slice(&payload[offset..offset + chunk_len]);
            frame::apply_mask(chunk, mask, offset);
            write_all(transport.as_mut(), chunk, timeout_ms)?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Writes a Close frame with the given status and optional reason.
    /// `status == 0` sends an empty payload, in which case no reason may be
    /// given; otherwise the status must be a valid outbound close code and
    /// the reason at most 123 bytes.
    pub fn write_close_frame(
        &mut self,
        status: u16,
        reason: Option<&str>,
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let reason = reason.unwrap_or("");
        let mut buf = [0u8; 125];
        let mut size = 0;

        if status != 0 {
            if !frame::is_valid_close_status(status) {
                return Err(Error::InvalidArg("invalid close status"));
            }
            if reason.len() > 123 {
                return Err(Error::InvalidArg("close reason too long"));
            }
            buf[..2].copy_from_slice(&status.to_be_bytes());
            size = 2;
            buf[size..size + reason.len()].copy_from_slice(reason.as_bytes());
            size += reason.len();
        } else if !reason.is_empty() {
            // No payload, so no room for a reason.
            return Err(Error::InvalidArg("close reason requires a status"));
        }

        self.write_frame(true, OpCode::Close, &buf[..size], timeout_ms)
    }

    /// Reads one whole frame into `buf`, returning `(fin, opcode,
    /// payload_len)`. Benign protocol violations consume the frame, move the
    /// state to [`ClientState::Failed`] and surface [`Error::Protocol`];
    /// unrecoverable conditions move it to [`ClientState::FailedNoClose`] and
    /// surface [`Error::TransportFailed`].
    pub fn read_frame(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(bool, OpCode, usize), Error> {
        if self.transport.is_none() {
            return Err(Error::InvalidState("client not open"));
        }
        if !self.state.can_read() {
            return Err(Error::InvalidState("client cannot read"));
        }

        let mut header = [0u8; 2];
        self.read_data(&mut header, timeout_ms)?;

        if header[0] & 0x70 != 0 {
            // Reserved bits set without a negotiated extension. Keep going so
            // the frame is consumed and a Close can still be sent.
            self.state = ClientState::Failed;
        }
        let raw_opcode = header[0] & 0x0F;
        let opcode = match OpCode::from(raw_opcode) {
            Ok(opcode) => Some(opcode),
            Err(_) => {
                self.state = ClientState::Failed;
                None
            }
        };
        let is_control = raw_opcode >= 0x8;
        let fin = header[0] & 0x80 != 0;
        if is_control && !fin {
            // Control frames must not be fragmented.
            self.state = ClientState::Failed;
        }
        if header[1] & 0x80 != 0 {
            // Frames from the server must not be masked, and we don't know
            // how to unmask, so stop here.
            self.state = ClientState::FailedNoClose;
            return Err(Error::TransportFailed);
        }

        let mut payload_len = (header[1] & 0x7F) as usize;
        if is_control && payload_len > 125 {
            self.state = ClientState::Failed;
        }

        if payload_len == 126 {
            let mut extended = [0u8; 2];
            self.read_data(&mut extended, timeout_ms)?;
            payload_len = u16::from_be_bytes(extended) as usize;
            if payload_len <= 125 {
                // Not the minimal encoding of the length.
                self.state = ClientState::Failed;
            }
        } else if payload_len == 127 {
            let mut extended = [0u8; 8];
            self.read_data(&mut extended, timeout_ms)?;
            let length = u64::from_be_bytes(extended);
            if length > i32::MAX as u64 {
                self.state = ClientState::FailedNoClose;
                return Err(Error::TransportFailed);
            }
            payload_len = length as usize;
            if payload_len <= 0xFFFF {
                self.state = ClientState::Failed;
            }
        }

        if payload_len > buf.len() {
            self.state = ClientState::FailedNoClose;
            return Err(Error::TransportFailed);
        }

        self.read_data(&mut buf[..payload_len], timeout_ms)?;

        match (self.state, opcode) {
            (ClientState::Ok, Some(opcode)) => Ok((fin, opcode, payload_len)),
            (ClientState::Failed, _) => Err(Error::Protocol("invalid frame header")),
            _ => Err(Error::TransportFailed),
        }
    }

    // Fills `buf`, draining the overread buffer first. A read that makes no
    // progress within the timeout means the stream is out of sync, so the
    // transport is presumed bad.
    fn read_data(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<(), Error> {
        let mut filled = 0;

        if !self.overread.is_empty() && !buf.is_empty() {
            let take = self.overread.len().min(buf.len());
            buf[..take].copy_from_slice(&self.overread[..take]);
            self.overread.advance(take);
            filled = take;
        }

        while filled < buf.len() {
            let transport = self.transport.as_mut().ok_or(Error::InvalidState("client not open"))?;
            match transport.read(&mut buf[filled..], timeout_ms) {
                Ok(0) | Err(_) => {
                    self.state = ClientState::FailedNoClose;
                    return Err(Error::TransportFailed);
                }
                Ok(n) => filled += n,
            }
        }
        Ok(())
    }
}

// Writes the whole buffer, with `timeout_ms` as the progress budget of each
// underlying write.
fn write_all(transport: &mut dyn Transport, mut buf: &[u8], timeout_ms: u32) -> Result<(), Error> {
    while !buf.is_empty() {
        let written = transport.write(buf, timeout_ms)?;
        if written == 0 {
            return Err(Error::TransportFailed);
        }
        buf = &buf[written..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn connected_pair(overread: Vec<u8>) -> (WsClient, UnixStream) {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        client_end.set_nonblocking(true).unwrap();
        let client = WsClient::from_upgraded(
            Box::new(StreamTransport::new(client_end)),
            overread,
            None,
        );
        (client, server_end)
    }

    fn server_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![(fin as u8) << 7 | opcode];
        if payload.len() <= 125 {
            raw.push(payload.len() as u8);
        } else if payload.len() <= 0xFFFF {
            raw.push(126);
            raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            raw.push(127);
            raw.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        raw.extend_from_slice(payload);
        raw
    }

    // Reads a client frame off the wire and unmasks it.
    fn read_client_frame(server: &mut UnixStream) -> (bool, u8, Vec<u8>) {
        let mut header = [0u8; 2];
        server.read_exact(&mut header).unwrap();
        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        assert_eq!(header[1] & 0x80, 0x80, "client frames must be masked");
        let mut len = (header[1] & 0x7F) as usize;
        if len == 126 {
            let mut ext = [0u8; 2];
            server.read_exact(&mut ext).unwrap();
            len = u16::from_be_bytes(ext) as usize;
        } else if len == 127 {
            let mut ext = [0u8; 8];
            server.read_exact(&mut ext).unwrap();
            len = u64::from_be_bytes(ext) as usize;
        }
        let mut mask = [0u8; 4];
        server.read_exact(&mut mask).unwrap();
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).unwrap();
        frame::apply_mask(&mut payload, mask, 0);
        (fin, opcode, payload)
    }

    #[test]
    fn frame_round_trip() {
        let (mut client, mut server) = connected_pair(Vec::new());

        client.write_frame(true, OpCode::Text, b"hello", 1000).unwrap();
        let (fin, opcode, payload) = read_client_frame(&mut server);
        assert!(fin);
        assert_eq!(opcode, 0x1);
        assert_eq!(payload, b"hello");

        server.write_all(&server_frame(true, 0x1, b"hello")).unwrap();
        let mut buf = [0u8; 256];
        let (fin, opcode, len) = client.read_frame(&mut buf, 1000).unwrap();
        assert!(fin);
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn medium_frame_uses_extended_length() {
        let (mut client, mut server) = connected_pair(Vec::new());
        let payload = vec![0xAB; 300];

        let writer = std::thread::spawn(move || {
            let (fin, opcode, echoed) = read_client_frame(&mut server);
            assert!(fin);
            assert_eq!(opcode, 0x2);
            (echoed, server)
        });
        client.write_frame(true, OpCode::Binary, &payload, 1000).unwrap();
        let (echoed, _server) = writer.join().unwrap();
        assert_eq!(echoed, payload);
    }

    #[test]
    fn overread_is_consumed_before_the_transport() {
        let frame_bytes = server_frame(true, 0x1, b"hi");
        let (split_a, split_b) = frame_bytes.split_at(3);
        let (mut client, mut server) = connected_pair(split_a.to_vec());
        server.write_all(split_b).unwrap();

        assert!(client.has_buffered_read_data());
        client.poll_read(0).unwrap(); // overread counts as readable

        let mut buf = [0u8; 64];
        let (fin, opcode, len) = client.read_frame(&mut buf, 1000).unwrap();
        assert!(fin);
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(&buf[..len], b"hi");
        assert!(!client.has_buffered_read_data());
    }

    #[test]
    fn reserved_bits_fail_but_consume_the_frame() {
        let (mut client, mut server) = connected_pair(Vec::new());
        let mut raw = server_frame(true, 0x1, b"x");
        raw[0] |= 0x40; // RSV1
        server.write_all(&raw).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(client.read_frame(&mut buf, 1000), Err(Error::Protocol(_))));
        assert_eq!(client.state(), ClientState::Failed);
        // A Close frame can still be written.
        client.write_close_frame(1002, None, 1000).unwrap();
        let (_, opcode, payload) = read_client_frame(&mut server);
        assert_eq!(opcode, 0x8);
        assert_eq!(payload, 1002u16.to_be_bytes());
    }

    #[test]
    fn masked_server_frame_is_fatal() {
        let (mut client, mut server) = connected_pair(Vec::new());
        let mut raw = server_frame(true, 0x1, b"x");
        raw[1] |= 0x80;
        server.write_all(&raw).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(client.read_frame(&mut buf, 1000), Err(Error::TransportFailed)));
        assert_eq!(client.state(), ClientState::FailedNoClose);
        assert!(client.write_frame(true, OpCode::Close, &[], 1000).is_err());
    }

    #[test]
    fn non_minimal_length_encoding_fails() {
        let (mut client, mut server) = connected_pair(Vec::new());
        let mut raw = vec![0x81, 126];
        raw.extend_from_slice(&5u16.to_be_bytes());
        raw.extend_from_slice(b"hello");
        server.write_all(&raw).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(client.read_frame(&mut buf, 1000), Err(Error::Protocol(_))));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let (mut client, mut server) = connected_pair(Vec::new());
        server.write_all(&[0x81, 126]).unwrap();
        server.write_all(&300u16.to_be_bytes()).unwrap();

        let mut buf = [0u8; 64]; // smaller than the announced payload
        assert!(matches!(client.read_frame(&mut buf, 1000), Err(Error::TransportFailed)));
        assert_eq!(client.state(), ClientState::FailedNoClose);
    }

    #[test]
    fn fragmented_control_frame_fails() {
        let (mut client, mut server) = connected_pair(Vec::new());
        server.write_all(&server_frame(false, 0x9, b"ping")).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(client.read_frame(&mut buf, 1000), Err(Error::Protocol(_))));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[test]
    fn close_frame_encodes_status_and_reason() {
        let (mut client, mut server) = connected_pair(Vec::new());
        client.write_close_frame(1000, Some("bye"), 1000).unwrap();
        let (fin, opcode, payload) = read_client_frame(&mut server);
        assert!(fin);
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"bye");
    }

    #[test]
    fn close_frame_argument_checks() {
        let (mut client, _server) = connected_pair(Vec::new());
        assert!(matches!(
            client.write_close_frame(1005, None, 1000),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            client.write_close_frame(0, Some("reason without status"), 1000),
            Err(Error::InvalidArg(_))
        ));
        let long_reason = "x".repeat(124);
        assert!(matches!(
            client.write_close_frame(1000, Some(&long_reason), 1000),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut client, _server) = connected_pair(Vec::new());
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.select_fd().is_none());
    }
}
