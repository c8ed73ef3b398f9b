use crate::error::Error;

/// Connection settings for [`crate::client::WsClient::open`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// `ws://` or `wss://` URL of the endpoint.
    pub url: String,
    /// Optional HTTP basic credentials sent with the Upgrade request.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Comma-separated subprotocols offered via `Sec-WebSocket-Protocol`.
    pub subprotocols: Option<String>,
    /// Budget for connecting and completing the Upgrade handshake.
    pub http_timeout_ms: u32,
    /// Grace period before tearing down the transport on close, so frames
    /// written just before the close can drain.
    pub close_delay_ms: u32,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_timeout_ms: 10_000,
            close_delay_ms: 100,
            ..Default::default()
        }
    }
}

/// Settings for [`crate::handler::WsHandler`].
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Read buffer size; a larger incoming frame fails the connection.
    /// Must be at least 125 so any control frame fits.
    pub max_frame_read_size: usize,
    /// Upper bound on each outgoing data-frame chunk. Must be at least 1.
    pub max_data_frame_write_size: usize,
    pub read_timeout_ms: u32,
    pub write_timeout_ms: u32,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_frame_read_size: 16 * 1024,
            max_data_frame_write_size: 4 * 1024,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
        }
    }
}

impl HandlerConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_frame_read_size < 125 {
            return Err(Error::InvalidArg("max_frame_read_size must be at least 125"));
        }
        if self.max_data_frame_write_size < 1 {
            return Err(Error::InvalidArg("max_data_frame_write_size must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for [`crate::event_loop::EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Upper bound on one readiness wait; bounds shutdown latency.
    pub poll_timeout_ms: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { poll_timeout_ms: 100 }
    }
}

/// Dimensions of the cross-thread task ring.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Capacity of one slot in bytes.
    pub slot_bytes: usize,
    /// Number of slots.
    pub capacity: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self { slot_bytes: 8, capacity: 16 }
    }
}

impl TaskQueueConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.slot_bytes < 1 {
            return Err(Error::InvalidArg("slot_bytes must be at least 1"));
        }
        if self.capacity < 1 {
            return Err(Error::InvalidArg("capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for [`crate::defrag::Defragmenter`].
#[derive(Debug, Clone)]
pub struct DefragConfig {
    /// Cap on the reassembled message size. Must be at least 1.
    pub max_message_size: usize,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self { max_message_size: 1024 * 1024 }
    }
}

impl DefragConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_message_size < 1 {
            return Err(Error::InvalidArg("max_message_size must be at least 1"));
        }
        Ok(())
    }
}
