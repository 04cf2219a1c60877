use std::{
    io::{self, ErrorKind::WouldBlock, Read, Write},
    time::Instant,
};

use mio::{net::UnixStream, Interest};

use crate::{
    errors::{Error, Result},
    protocol::{Message, MessageAssembler},
};

pub enum TransportState {
    // The buffer has been transferred completely
    Finished,
    // This operation would block
    Stalled,
}

/// Outbound bytes of one connection. Grows at the back by `push()`, shrinks at the front as the
/// socket accepts bytes.
#[derive(Debug, Default)]
pub struct TxBuffer {
    bytes_sent: usize,
    buf: Vec<u8>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // Reclaim the already sent prefix before growing
        if self.bytes_sent > 0 && self.bytes_sent >= self.buf.len() / 2 {
            self.buf.drain(..self.bytes_sent);
            self.bytes_sent = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn update_bytes_sent(&mut self, bytes_sent: usize) {
        self.bytes_sent += bytes_sent;
        if self.bytes_sent == self.buf.len() {
            self.buf.clear();
            self.bytes_sent = 0;
        }
    }

    /// Has everything been sent?
    pub fn is_empty(&self) -> bool {
        self.bytes_sent == self.buf.len()
    }

    pub fn buf_unsent(&self) -> &[u8] {
        &self.buf[self.bytes_sent..]
    }

    /// Writes as many bytes as `writer` accepts without blocking. Unwritten bytes are kept for
    /// the next attempt.
    pub fn write_to<W>(&mut self, writer: &mut W) -> Result<TransportState>
    where
        W: Write,
    {
        while !self.is_empty() {
            match writer.write(self.buf_unsent()) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(bytes_sent) => self.update_bytes_sent(bytes_sent),
                // When errors are returned, it's guaranteed that nothing was written during this
                // iteration
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == WouldBlock => return Ok(TransportState::Stalled),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(TransportState::Finished)
    }
}

/// Outcome of draining a readable socket
#[derive(Debug, Default)]
pub struct Received {
    pub messages: Vec<Message>,
    pub bytes: usize,
    pub eof: bool,
}

/// Reads chunks of at most `scratch.len()` bytes from `reader` until it would block or the
/// peer closes the stream, feeding everything through `assembler`.
pub fn read_available<R>(
    reader: &mut R,
    assembler: &mut MessageAssembler,
    scratch: &mut [u8],
) -> Result<Received>
where
    R: Read,
{
    let mut received = Received::default();
    loop {
        match reader.read(scratch) {
            Ok(0) => {
                received.eof = true;
                return Ok(received);
            }
            Ok(bytes_read) => {
                received.bytes += bytes_read;
                received
                    .messages
                    .extend(assembler.feed(&scratch[..bytes_read])?);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == WouldBlock => return Ok(received),
            Err(e) => return Err(e.into()),
        }
    }
}

/// One multiplexed socket of the event loop
#[derive(Debug)]
pub struct Connection {
    pub stream: UnixStream,
    pub assembler: MessageAssembler,
    pub tx_buffer: TxBuffer,
    pub interest: Interest,
    // Last time bytes went in, respectively out
    pub last_read: Instant,
    pub last_write: Instant,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        let now = Instant::now();
        Self {
            stream,
            assembler: MessageAssembler::new(),
            tx_buffer: TxBuffer::new(),
            interest: Interest::READABLE,
            last_read: now,
            last_write: now,
        }
    }

    /// Socket interest matching the current buffer state: writability is only of interest while
    /// there is something to write
    pub fn wanted_interest(&self) -> Interest {
        if self.tx_buffer.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    pub fn receive(&mut self, scratch: &mut [u8]) -> Result<Received> {
        let received = read_available(&mut self.stream, &mut self.assembler, scratch)?;
        if received.bytes > 0 {
            self.last_read = Instant::now();
        }
        Ok(received)
    }

    pub fn flush(&mut self) -> Result<TransportState> {
        let before = self.tx_buffer.buf_unsent().len();
        let state = self.tx_buffer.write_to(&mut self.stream)?;
        if self.tx_buffer.buf_unsent().len() != before {
            self.last_write = Instant::now();
        }
        Ok(state)
    }
}
