//! WebSocket client handler: drives a [`WsClient`] from an [`EventLoop`].
//!
//! The handler receives *frames* and hands them to the user (to be
//! defragmented into messages at another layer, see [`crate::defrag`]), and
//! it sends *messages*, fragmenting them as required. Receives are
//! synchronous; sends are asynchronous so frames keep flowing while a large
//! message goes out.
//!
//! Event callbacks receive `&mut WsControl`, so calling
//! [`WsControl::send_message`], [`WsControl::close`] or [`WsControl::ping`]
//! from inside a callback is legal: the handler's own mutations are quiesced
//! at callback boundaries.

use crate::client::{ClientState, WsClient};
use crate::config::HandlerConfig;
use crate::error::Error;
use crate::event_loop::{EventLoop, FdWatcher, WatchFor, WatcherId};
use crate::frame::{self, OpCode};
use crate::utf8;
use bytes::Bytes;
use log::debug;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Handler events. All callbacks run on the loop worker; payload slices are
/// only valid for the duration of the call.
pub trait WsClientEvents {
    /// The connection closed or failed. Fires at most once per handler.
    fn on_closed(&mut self, control: &mut WsControl, status: u16) {
        let _ = (control, status);
    }

    /// A data (non-control) frame arrived.
    fn on_data_frame_received(
        &mut self,
        control: &mut WsControl,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
    ) {
        let _ = (control, fin, opcode, payload);
    }

    /// A Ping arrived; the Pong reply has already been written.
    fn on_ping_received(&mut self, control: &mut WsControl, payload: &[u8]) {
        let _ = (control, payload);
    }

    fn on_pong_received(&mut self, control: &mut WsControl, payload: &[u8]) {
        let _ = (control, payload);
    }

    /// A message given to [`WsControl::send_message`] finished (or failed).
    /// The payload handle is released either way.
    fn on_message_sent(&mut self, control: &mut WsControl, success: bool) {
        let _ = (control, success);
    }
}

struct SendJob {
    binary: bool,
    payload: Bytes,
    written: usize,
}

/// The handler state reachable from event callbacks.
pub struct WsControl {
    config: HandlerConfig,
    client: WsClient,
    event_loop: Rc<EventLoop>,
    close_sent: bool,
    close_event_sent: bool,
    close_status: u16,
    sending: Option<SendJob>,
}

impl WsControl {
    /// Schedules `payload` to be sent as one message; the actual writes run
    /// from the loop's writability callbacks. `on_message_sent` fires on
    /// completion or failure. Only one send may be in flight.
    pub fn send_message(&mut self, binary: bool, payload: Bytes) -> Result<(), Error> {
        if !self.event_loop.is_running() {
            return Err(Error::InvalidState("loop is not running"));
        }
        if self.sending.is_some() {
            return Err(Error::InvalidState("a send is already in progress"));
        }
        if self.client.state() != ClientState::Ok {
            return Err(Error::InvalidState("client is not connected"));
        }

        self.sending = Some(SendJob { binary, payload, written: 0 });
        Ok(())
    }

    /// Sends a Close frame with the given status. Idempotent: a no-op when a
    /// Close already went out (for instance to echo the server's), or when
    /// the connection can no longer carry one.
    pub fn close(&mut self, status: u16) -> Result<(), Error> {
        if !frame::is_valid_close_status(status) {
            return Err(Error::InvalidArg("invalid close status"));
        }
        if !self.event_loop.is_running() {
            return Err(Error::InvalidState("loop is not running"));
        }
        // In the failed states a Close (if one is possible at all) is sent by
        // the failure path; don't report an error here.
        if self.client.state() != ClientState::Ok {
            return Ok(());
        }
        if self.close_sent {
            return Ok(());
        }

        // Don't report an error if the Close frame can't actually be sent.
        let _ = self
            .client
            .write_close_frame(status, None, self.config.write_timeout_ms);
        self.close_sent = true;
        Ok(())
    }

    /// Writes a Ping frame synchronously. The payload is limited to 125
    /// bytes, like any control frame.
    pub fn ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > 125 {
            return Err(Error::InvalidArg("ping payload too long"));
        }
        if !self.event_loop.is_running() {
            return Err(Error::InvalidState("loop is not running"));
        }

        self.client
            .write_frame(true, OpCode::Ping, payload, self.config.write_timeout_ms)
    }

    pub fn client(&self) -> &WsClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut WsClient {
        &mut self.client
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub fn close_status(&self) -> u16 {
        self.close_status
    }

    pub fn is_sending(&self) -> bool {
        self.sending.is_some()
    }
}

pub struct WsHandler<E: WsClientEvents> {
    control: WsControl,
    // Sibling of `control` so a payload slice can be passed to callbacks
    // alongside `&mut WsControl`.
    read_buf: Vec<u8>,
    events: E,
    watcher_id: Option<WatcherId>,
}

impl<E: WsClientEvents + 'static> WsHandler<E> {
    /// Registers a watcher for the client's transport fd and returns the
    /// handler. The client must be connected ([`ClientState::Ok`]); the loop
    /// must outlive the handler.
    pub fn start(
        config: HandlerConfig,
        client: WsClient,
        event_loop: &Rc<EventLoop>,
        events: E,
    ) -> Result<Rc<RefCell<Self>>, Error> {
        config.validate()?;
        let fd = client
            .select_fd()
            .ok_or(Error::InvalidState("client is not connected"))?;

        let read_buf = vec![0u8; config.max_frame_read_size];
        let handler = Rc::new(RefCell::new(Self {
            control: WsControl {
                config,
                client,
                event_loop: Rc::clone(event_loop),
                close_sent: false,
                close_event_sent: false,
                close_status: frame::STATUS_NONE,
                sending: None,
            },
            read_buf,
            events,
            watcher_id: None,
        }));

        let weak_concrete: Weak<RefCell<Self>> = Rc::downgrade(&handler);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        let watcher_id = event_loop.add_watcher(fd, WatchFor::READ, weak)?;
        handler.borrow_mut().watcher_id = Some(watcher_id);
        Ok(handler)
    }

    /// Unregisters from the loop. Must not be called while the loop is
    /// running; the client stays usable.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        if self.control.event_loop.is_running() {
            return Err(Error::InvalidState("loop is running"));
        }
        if let Some(id) = self.watcher_id.take() {
            self.control.event_loop.remove_watcher(id)?;
        }
        Ok(())
    }

    pub fn control(&self) -> &WsControl {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut WsControl {
        &mut self.control
    }

    /// See [`WsControl::send_message`].
    pub fn send_message(&mut self, binary: bool, payload: Bytes) -> Result<(), Error> {
        self.control.send_message(binary, payload)
    }

    /// See [`WsControl::close`].
    pub fn close(&mut self, status: u16) -> Result<(), Error> {
        self.control.close(status)
    }

    /// See [`WsControl::ping`].
    pub fn ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.control.ping(payload)
    }

    fn do_read(&mut self) {
        let result = self
            .control
            .client
            .read_frame(&mut self.read_buf, self.control.config.read_timeout_ms);
        let (fin, opcode, payload_len) = match result {
            Ok(frame) => frame,
            Err(err) => {
                debug!("read frame failed: {}", err);
                self.handle_client_failure();
                return;
            }
        };

        match opcode {
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {
                self.events.on_data_frame_received(
                    &mut self.control,
                    fin,
                    opcode,
                    &self.read_buf[..payload_len],
                );
            }

            OpCode::Close => self.handle_close_frame(payload_len),

            OpCode::Ping => {
                // Reply first, then surface the event.
                if let Err(err) = self.control.client.write_frame(
                    true,
                    OpCode::Pong,
                    &self.read_buf[..payload_len],
                    self.control.config.write_timeout_ms,
                ) {
                    debug!("pong reply failed: {}", err);
                }
                self.events
                    .on_ping_received(&mut self.control, &self.read_buf[..payload_len]);
            }

            OpCode::Pong => {
                self.events
                    .on_pong_received(&mut self.control, &self.read_buf[..payload_len]);
            }
        }
    }

    fn handle_close_frame(&mut self, payload_len: usize) {
        if self.control.close_sent {
            return; // Nothing more to do.
        }

        let write_timeout = self.control.config.write_timeout_ms;
        if payload_len == 0 {
            self.control.close_status = frame::STATUS_NO_STATUS_RECEIVED;
            let _ = self
                .control
                .client
                .write_close_frame(frame::STATUS_NONE, None, write_timeout);
        } else if payload_len == 1 {
            self.control.close_status = frame::STATUS_PROTOCOL_ERROR;
            let _ = self
                .control
                .client
                .write_close_frame(frame::STATUS_PROTOCOL_ERROR, None, write_timeout);
        } else {
            let status = u16::from_be_bytes([self.read_buf[0], self.read_buf[1]]);
            if !frame::is_valid_close_status(status) {
                self.control.close_status = frame::STATUS_PROTOCOL_ERROR;
                let _ = self
                    .control
                    .client
                    .write_close_frame(frame::STATUS_PROTOCOL_ERROR, None, write_timeout);
            } else if !utf8::validate(&self.read_buf[2..payload_len]) {
                self.control.close_status = frame::STATUS_INVALID_DATA;
                let _ = self
                    .control
                    .client
                    .write_close_frame(frame::STATUS_INVALID_DATA, None, write_timeout);
            } else {
                self.control.close_status = status;
                // Echo the Close payload verbatim.
                let _ = self.control.client.write_frame(
                    true,
                    OpCode::Close,
                    &self.read_buf[..payload_len],
                    write_timeout,
                );
            }
        }
        self.control.close_sent = true;
        self.emit_closed();
    }

    // A read or write surfaced a failed client state. Protocol failures get
    // a Close 1002 from us; transport failures can't carry one.
    fn handle_client_failure(&mut self) {
        match self.control.client.state() {
            ClientState::Failed => {
                if !self.control.close_sent {
                    let _ = self.control.client.write_close_frame(
                        frame::STATUS_PROTOCOL_ERROR,
                        None,
                        self.control.config.write_timeout_ms,
                    );
                    self.control.close_sent = true;
                    self.control.close_status = frame::STATUS_PROTOCOL_ERROR;
                }
                self.fail_pending_send();
                self.emit_closed();
            }
            ClientState::FailedNoClose => {
                self.fail_pending_send();
                self.emit_closed();
            }
            _ => {}
        }
    }

    fn fail_pending_send(&mut self) {
        if self.control.sending.take().is_some() {
            self.events.on_message_sent(&mut self.control, false);
        }
    }

    fn emit_closed(&mut self) {
        if self.control.close_event_sent {
            return;
        }
        self.control.close_event_sent = true;
        let status = if self.control.close_status != frame::STATUS_NONE {
            self.control.close_status
        } else {
            frame::STATUS_ABNORMAL_CLOSURE
        };
        self.events.on_closed(&mut self.control, status);
    }

    fn do_write(&mut self) {
        let (binary, payload, written) = match &self.control.sending {
            Some(job) => (job.binary, job.payload.clone(), job.written),
            None => return,
        };

        let write_size = self
            .control
            .config
            .max_data_frame_write_size
            .min(payload.len() - written);
        let opcode = if written == 0 {
            if binary {
                OpCode::Binary
            } else {
                OpCode::Text
            }
        } else {
            OpCode::Continuation
        };
        let end = written + write_size;
        let fin = end == payload.len();
        if let Some(job) = &mut self.control.sending {
            job.written = end;
        }

        let result = self.control.client.write_frame(
            fin,
            opcode,
            &payload[written..end],
            self.control.config.write_timeout_ms,
        );
        if let Err(err) = result {
            debug!("write frame failed: {}", err);
            self.fail_pending_send();
            self.handle_client_failure();
            return;
        }

        if fin {
            self.control.sending = None;
            self.events.on_message_sent(&mut self.control, true);
        }
    }
}

impl<E: WsClientEvents + 'static> FdWatcher for WsHandler<E> {
    fn on_will_select(&mut self, event_loop: &EventLoop, _fd: RawFd) -> Option<WatchFor> {
        // Bytes over-read during the handshake never show up as fd
        // readiness; consume them before polling and count it as work so
        // idle doesn't fire over buffered input.
        let mut drained = false;
        while self.control.client.has_buffered_read_data()
            && self.control.client.state() == ClientState::Ok
            && !event_loop.should_stop()
        {
            self.do_read();
            drained = true;
        }
        if drained {
            event_loop.note_activity();
        }

        Some(if self.control.sending.is_some() {
            WatchFor::READ_WRITE
        } else {
            WatchFor::READ
        })
    }

    fn on_can_read(&mut self, _event_loop: &EventLoop, _fd: RawFd) {
        self.do_read();
    }

    fn on_can_write(&mut self, event_loop: &EventLoop, _fd: RawFd) {
        if self.control.sending.is_none() {
            return;
        }
        self.do_write();
        // Keep writing while there is more to send and the transport stays
        // writable right now.
        while self.control.sending.is_some()
            && !event_loop.should_stop()
            && self.control.client.poll_write(0).is_ok()
        {
            self.do_write();
        }
    }
}
