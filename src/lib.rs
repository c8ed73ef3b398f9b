//! WebSocket client stack for a single-threaded event loop.
//!
//! This library implements the [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! client side on top of a cooperative `poll(2)` loop, for targets where one
//! worker owns all network I/O: the loop multiplexes fd watchers, a counting
//! wake fd lets other threads post work items into the worker, and the
//! client handler performs handshakes, reads frames, applies masks, handles
//! opcodes and fragments outgoing messages.
//!
//! The pieces compose as follows: a [`handler::WsHandler`] owns one
//! [`client::WsClient`] and registers a watcher with one
//! [`event_loop::EventLoop`]; a [`task_queue::TaskQueue`] feeds the same loop
//! from other threads through a [`wake::WakeFd`]; the
//! [`defrag::Defragmenter`] turns the handler's frame events into whole
//! [`message::Message`]s.

pub mod client;
pub mod config;
pub mod defrag;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod handler;
mod handshake;
pub mod message;
pub mod task_queue;
pub mod transport;
pub mod utf8;
pub mod wake;


pub use client::{ClientState, WsClient};
pub use config::{ClientConfig, DefragConfig, HandlerConfig, LoopConfig, TaskQueueConfig};
pub use defrag::Defragmenter;
pub use error::Error;
pub use event_loop::{EventLoop, FdWatcher, LoopHooks, WatchFor, WatcherId};
pub use frame::{Frame, OpCode};
pub use handler::{WsClientEvents, WsControl, WsHandler};
pub use message::Message;
pub use task_queue::{TaskHandler, TaskPoster, TaskQueue};
pub use wake::WakeFd;
