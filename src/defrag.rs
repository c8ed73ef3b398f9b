//! Reassembles data frames into whole messages.
//!
//! Frames are fed in arrival order. A violation anywhere in a message makes
//! the error sticky: every call up to and including the frame with `fin` set
//! reports it, the partial buffer is released immediately, and the call after
//! the terminating frame starts a fresh message.

use crate::config::DefragConfig;
use crate::error::Error;
use crate::frame::OpCode;
use crate::message::Message;
use crate::utf8::Utf8Validator;

// Copyable error marker; mapped to crate::Error on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefragError {
    Protocol,
    InvalidData,
    MessageTooBig,
    OutOfMemory,
}

impl From<DefragError> for Error {
    fn from(err: DefragError) -> Self {
        match err {
            DefragError::Protocol => Error::Protocol("invalid message fragmentation"),
            DefragError::InvalidData => Error::InvalidData,
            DefragError::MessageTooBig => Error::MessageTooBig,
            DefragError::OutOfMemory => Error::OutOfMemory,
        }
    }
}

pub struct Defragmenter {
    max_message_size: usize,
    error: Option<DefragError>,
    /// Opcode of the first frame; `None` between messages.
    opcode: Option<OpCode>,
    utf8: Utf8Validator,
    buffer: Vec<u8>,
}

impl Defragmenter {
    pub fn new(config: DefragConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            max_message_size: config.max_message_size,
            error: None,
            opcode: None,
            utf8: Utf8Validator::new(),
            buffer: Vec::new(),
        })
    }

    /// Feeds one data frame. Returns `Ok(None)` while the message is still
    /// being assembled and `Ok(Some(message))` on the final frame.
    pub fn on_data_frame(
        &mut self,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<Option<Message>, Error> {
        if !opcode.is_data() {
            return Err(Error::InvalidArg("control frame fed to defragmenter"));
        }

        if let Some(error) = self.error {
            // Sticky until the message terminates.
            return Err(self.fail(fin, error));
        }

        match self.opcode {
            None => {
                if opcode == OpCode::Continuation {
                    return Err(self.fail(fin, DefragError::Protocol));
                }
                self.opcode = Some(opcode);
                self.utf8.reset();
            }
            Some(_) => {
                if opcode != OpCode::Continuation {
                    return Err(self.fail(fin, DefragError::Protocol));
                }
            }
        }

        if self.opcode == Some(OpCode::Text) {
            self.utf8.advance(payload);
            if self.utf8.is_reject() || (fin && !self.utf8.is_accept()) {
                return Err(self.fail(fin, DefragError::InvalidData));
            }
        }

        if self.buffer.len() + payload.len() > self.max_message_size {
            return Err(self.fail(fin, DefragError::MessageTooBig));
        }
        if self.buffer.try_reserve(payload.len()).is_err() {
            return Err(self.fail(fin, DefragError::OutOfMemory));
        }
        self.buffer.extend_from_slice(payload);

        if !fin {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.buffer);
        let opcode = self.opcode.take();
        match opcode {
            Some(OpCode::Text) => {
                let text = String::from_utf8(data).map_err(|_| Error::InvalidData)?;
                Ok(Some(Message::Text(text)))
            }
            _ => Ok(Some(Message::Binary(data))),
        }
    }

    // Enters (or stays in) the error state, releasing the partial message.
    // The sticky error clears once the terminating frame has been reported.
    fn fail(&mut self, fin: bool, error: DefragError) -> Error {
        self.opcode = None;
        self.buffer = Vec::new();
        self.error = if fin { None } else { Some(error) };
        error.into()
    }
}
