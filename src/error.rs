use httparse::Error as HttpParseError;
use std::io;
use thiserror::Error;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    // Handshake Errors
    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("Server didn't reply with HTTP 101, got {0}")]
    BadHandshakeStatus(u16),

    #[error("Upgrade: websocket header missing in the response")]
    NoUpgradeHeaderPresent,

    #[error("Connection: Upgrade header missing in the response")]
    NoConnectionHeaderPresent,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Duplicate {0} header in the response")]
    DuplicateHeader(&'static str),

    #[error("Server sent a Sec-WebSocket-Protocol header that was not requested")]
    UnexpectedSubprotocol,

    #[error("Incomplete HTTP response")]
    IncompleteHTTPResponse,

    // Framing / protocol errors
    #[error("websocket protocol violation: {0}")]
    Protocol(&'static str),

    #[error("invalid UTF-8 in text payload")]
    InvalidData,

    #[error("message exceeds the maximum configured size")]
    MessageTooBig,

    #[error("allocation failed")]
    OutOfMemory,

    #[error("transport failed")]
    TransportFailed,

    // Task queue / wake signal errors
    #[error("task queue is at capacity")]
    QueueFull,

    #[error("file descriptor used after close")]
    BadFd,

    // HTTP / URL errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },
}
