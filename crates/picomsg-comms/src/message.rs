use std::ops::Deref;

use bytes::Bytes;

/// One received message. Owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub(crate) fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text, without the trailing NUL a `send_str` adds.
    pub fn as_str(&self) -> Option<&str> {
        let body = self.payload.strip_suffix(&[0]).unwrap_or(&self.payload);
        std::str::from_utf8(body).ok()
    }
}

impl Deref for Message {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.payload
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}
