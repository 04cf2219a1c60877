use std::{collections::BTreeMap, mem};

use bstr::ByteSlice;

use crate::{
    errors::{Error, Result},
    protocol::message::{Message, BODY_LEN},
};

const HEADER_DELIMITER: &[u8; 2] = b"\n\n";

#[derive(Debug)]
enum State {
    ReadingHeader {
        buf: Vec<u8>,
        // Everything before this offset is known not to contain the delimiter
        scanned: usize,
    },
    ReadingBody {
        headers: BTreeMap<String, String>,
        body_len: usize,
        body: Vec<u8>,
    },
}

/// Incremental parser for one connection. Turns arbitrarily sized chunks of the byte stream into
/// complete `Message`s, in arrival order.
///
/// After a message has been completed, the state is replaced by a fresh one that gets seeded with
/// the bytes following the message (overflow), so one chunk may yield any number of messages.
#[derive(Debug)]
pub struct MessageAssembler {
    state: State,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            state: State::ReadingHeader {
                buf: Vec::new(),
                scanned: 0,
            },
        }
    }

    /// Is the assembler in between two messages?
    pub fn is_idle(&self) -> bool {
        matches!(&self.state, State::ReadingHeader { buf, .. } if buf.is_empty())
    }

    /// Feeds the next chunk of the stream and returns all messages it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            rest = match self.state {
                State::ReadingHeader { .. } => self.consume_header(rest)?,
                State::ReadingBody { .. } => self.consume_body(rest, &mut messages),
            };
        }

        // A header that declares an empty body completes without any further bytes
        if let State::ReadingBody { body_len: 0, .. } = self.state {
            self.consume_body(&[], &mut messages);
        }

        Ok(messages)
    }

    /// Returns the bytes not belonging to the header block
    fn consume_header<'a>(&mut self, chunk: &'a [u8]) -> Result<&'a [u8]> {
        let State::ReadingHeader { buf, scanned } = &mut self.state else {
            unreachable!()
        };

        let search_from = scanned.saturating_sub(HEADER_DELIMITER.len() - 1);
        let old_len = buf.len();
        buf.extend_from_slice(chunk);

        let header_end = match buf[search_from..].find(HEADER_DELIMITER) {
            Some(pos) => search_from + pos,
            None => {
                *scanned = buf.len();
                return Ok(&[]);
            }
        };

        let headers = parse_header_block(&buf[..header_end])?;
        let body_len = parse_body_len(&headers)?;

        // The delimiter may have been completed by this chunk only, so locate the remainder
        // relative to the chunk rather than to the accumulated buffer
        let body_start_in_chunk = header_end + HEADER_DELIMITER.len() - old_len;
        // `body-len` comes from the peer, only reserve what has actually arrived
        let available = chunk.len() - body_start_in_chunk;
        self.state = State::ReadingBody {
            headers,
            body_len,
            body: Vec::with_capacity(body_len.min(available)),
        };

        Ok(&chunk[body_start_in_chunk..])
    }

    /// Returns the overflow which belongs to the next message
    fn consume_body<'a>(&mut self, chunk: &'a [u8], messages: &mut Vec<Message>) -> &'a [u8] {
        let State::ReadingBody { body_len, body, .. } = &mut self.state else {
            unreachable!()
        };

        let missing = *body_len - body.len();
        let (this, overflow) = chunk.split_at(missing.min(chunk.len()));
        body.extend_from_slice(this);

        if body.len() == *body_len {
            if let State::ReadingBody { headers, body, .. } =
                mem::replace(&mut self.state, Self::new().state)
            {
                messages.push(Message::from_parts(headers, body));
            }
        }

        overflow
    }
}

fn parse_header_block(block: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    for line in block.split_str("\n").filter(|line| !line.is_empty()) {
        let line = line
            .to_str()
            .map_err(|_| Error::protocol("Header line is not valid UTF-8"))?;
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("Header line {:?} has no colon", line)))?;
        headers.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(headers)
}

fn parse_body_len(headers: &BTreeMap<String, String>) -> Result<usize> {
    headers
        .get(BODY_LEN)
        .ok_or_else(|| Error::protocol("Missing header \"body-len\""))?
        .parse()
        .map_err(|_| Error::protocol("Header \"body-len\" is not a non-negative integer"))
}
