use bytes::Bytes;

/// Byte sequence used to delimit [`Message`]s on file and TCP streams.
/// Chosen for its improbability inside real HTTP traffic.
pub const PAYLOAD_SEPARATOR: &[u8] = "\r\n🐵🙈🙉\r\n".as_bytes();

/// One frame crossing any plugin boundary: an ASCII meta header plus an
/// opaque payload. `meta`/`data` are [`Bytes`] rather than `Vec<u8>` so
/// fanning the same message out to N writers is a refcount bump, matching
/// the "Writers MUST NOT mutate it" ownership rule in spec.md §3 — there is
/// no `&mut` path into a shared `Message`.
#[derive(Debug, Clone)]
pub struct Message {
    pub meta: Bytes,
    pub data: Bytes,
}

impl Message {
    pub fn new(meta: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            meta: meta.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.meta.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Truncates `data` in place to at most `max_len` bytes (spec.md §4.2 step 1).
    pub fn truncate_data(&mut self, max_len: usize) {
        if self.data.len() > max_len {
            self.data = self.data.slice(0..max_len);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Request,
    Response,
    ReplayedResponse,
}

impl PayloadType {
    pub fn as_byte(self) -> u8 {
        match self {
            PayloadType::Request => b'1',
            PayloadType::Response => b'2',
            PayloadType::ReplayedResponse => b'3',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'1' => Some(PayloadType::Request),
            b'2' => Some(PayloadType::Response),
            b'3' => Some(PayloadType::ReplayedResponse),
            _ => None,
        }
    }
}

/// A 24-byte correlation identifier: first 20 bytes identify a TCP session,
/// last 4 bytes distinguish request/response pairs within that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid(pub [u8; 24]);

impl Uuid {
    pub fn session(&self) -> &[u8] {
        &self.0[..20]
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &[u8]) -> Option<Self> {
        if s.len() != 48 {
            return None;
        }
        let mut out = [0u8; 24];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Uuid(out))
    }

    /// Generates a fresh random correlation id (used by [`crate::plugin`] test
    /// doubles and the dummy input).
    pub fn random() -> Self {
        let mut buf = [0u8; 24];
        for b in buf.iter_mut() {
            *b = rand::random();
        }
        Uuid(buf)
    }
}

/// Session prefix of a raw meta id, for correlation and sticky routing.
///
/// Captured traffic's meta id is an opaque ASCII byte string, not
/// necessarily the hex encoding [`Uuid::from_hex`] expects — goreplay itself
/// correlates on these raw bytes directly. The first 20 bytes (or the whole
/// id, if shorter) identify the session; callers that need the full id for
/// an exact-match key (e.g. [`crate::filtered_set::FilteredSet`]) should use
/// the id slice as-is instead.
pub fn session_prefix(id: &[u8]) -> &[u8] {
    &id[..id.len().min(20)]
}
