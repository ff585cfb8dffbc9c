//! Splitting inbound bytes into messages.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// One inbound message: a command word and the rest of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Bytes,
    pub data: Bytes,
}

impl Message {
    pub fn new(command: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            data: data.into(),
        }
    }

    /// The command as text, if it is valid UTF-8.
    pub fn command_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.command).ok()
    }

    /// Wire size of the message without its delimiter.
    pub fn len(&self) -> usize {
        if self.data.is_empty() {
            self.command.len()
        } else {
            self.command.len() + 1 + self.data.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_empty() && self.data.is_empty()
    }
}

/// Parser errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("control line of {size} bytes exceeds maximum of {max}")]
    LineTooLong { size: usize, max: usize },
}

/// Turns a stream of byte chunks into messages.
///
/// Implementations keep partial input between calls; a chunk may carry zero,
/// one or many messages.
pub trait MessageParser: Send {
    fn parse(&mut self, chunk: &[u8]) -> Result<Vec<Message>, ParseError>;
}

/// Newline-delimited parser. A trailing `\r` is dropped, blank lines are
/// skipped and the first space separates command from data.
#[derive(Debug)]
pub struct LineParser {
    buf: BytesMut,
    max_line: usize,
}

impl LineParser {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line,
        }
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Queues input that was read before the parser took over the stream,
    /// such as a handshake line. It is parsed ahead of the next chunk.
    pub fn prefill(&mut self, input: &[u8]) {
        self.buf.extend_from_slice(input);
    }

    fn split_line(mut line: Bytes) -> Message {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        match line.iter().position(|&b| b == b' ') {
            Some(pos) => {
                let command = line.slice(..pos);
                let mut data = line.slice(pos + 1..);
                let skip = data.iter().take_while(|&&b| b == b' ').count();
                data.advance(skip);
                Message { command, data }
            }
            None => Message {
                command: line,
                data: Bytes::new(),
            },
        }
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new(crate::MAX_CONTROL_LINE_SIZE)
    }
}

impl MessageParser for LineParser {
    fn parse(&mut self, chunk: &[u8]) -> Result<Vec<Message>, ParseError> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            if pos > self.max_line {
                let size = pos;
                self.buf.clear();
                return Err(ParseError::LineTooLong {
                    size,
                    max: self.max_line,
                });
            }
            let line = self.buf.split_to(pos + 1).freeze().slice(..pos);
            let message = Self::split_line(line);
            if !message.is_empty() {
                messages.push(message);
            }
        }

        if self.buf.len() > self.max_line {
            let size = self.buf.len();
            self.buf.clear();
            return Err(ParseError::LineTooLong {
                size,
                max: self.max_line,
            });
        }

        Ok(messages)
    }
}
