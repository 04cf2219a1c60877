use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
};

use bstr::ByteSlice;

use crate::errors::{Error, Result};

/// Name of the mandatory header carrying the exact length of the body
pub const BODY_LEN: &str = "body-len";

/// A unit of wire data: string headers plus a raw body.
///
/// Messages are built once, either by the sender or by the `MessageAssembler`, and never change
/// afterwards. The `body-len` header is not stored for outgoing messages, it is derived from the
/// body when the message gets encoded.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Message {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Message {
    pub fn new<T>(body: T) -> Self
    where
        T: Into<Vec<u8>>,
    {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header. Key and value are trimmed, the same way the receiving side trims them.
    /// A caller-supplied `body-len` is ignored on encoding.
    pub fn with_header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: ToString,
    {
        self.headers.insert(
            key.as_ref().trim().to_owned(),
            value.to_string().trim().to_owned(),
        );
        self
    }

    /// Used by the assembler, `headers` already contains a validated `body-len`
    pub(crate) fn from_parts(headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Serializes the message into its wire representation:
    /// `key:value\n` lines, `body-len` last, an empty line, then the raw body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_header_len_hint() + self.body.len());
        for (key, value) in self.headers.iter().filter(|(k, _)| k.as_str() != BODY_LEN) {
            if key.is_empty() || key.contains(':') || key.contains('\n') {
                return Err(Error::protocol(format!("Header key {:?} can not be encoded", key)));
            }
            if value.contains('\n') {
                return Err(Error::protocol(format!(
                    "Value of header \"{}\" contains a line break",
                    key
                )));
            }
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(format!("{}:{}\n\n", BODY_LEN, self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    fn encoded_header_len_hint(&self) -> usize {
        self.headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum::<usize>()
            + BODY_LEN.len()
            + 24
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("headers", &self.headers)
            .field("body", &self.body.as_bstr())
            .finish()
    }
}
