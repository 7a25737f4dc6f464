//! Request construction and wire encoding for the meta protocol.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::parser::Flag;
use crate::error::Error;

/// Maximum key length, in bytes, per the meta protocol.
pub const MAX_KEY_LEN: usize = 250;
/// Maximum opaque correlation token length, in bytes.
pub const MAX_OPAQUE_LEN: usize = 32;

/// A validated cache key: 1..=250 bytes, no whitespace or control characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key(Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, Error> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::BadKey("key must not be empty".to_string()));
        }
        if bytes.len() > MAX_KEY_LEN {
            return Err(Error::BadKey(format!(
                "key length {} exceeds maximum of {MAX_KEY_LEN}",
                bytes.len()
            )));
        }
        if let Some(&b) = bytes.iter().find(|&&b| b < 0x21 || b == 0x7f) {
            return Err(Error::BadKey(format!("key contains disallowed byte 0x{b:02x}")));
        }
        Ok(Key(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// The six meta-protocol commands this crate pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// `mg` — get.
    Get,
    /// `ms` — set.
    Set,
    /// `md` — delete.
    Delete,
    /// `ma` — arithmetic (incr/decr).
    Arith,
    /// `me` — debug.
    Debug,
    /// `mn` — no-op.
    NoOp,
}

impl Command {
    fn wire(self) -> &'static [u8] {
        match self {
            Command::Get => b"mg",
            Command::Set => b"ms",
            Command::Delete => b"md",
            Command::Arith => b"ma",
            Command::Debug => b"me",
            Command::NoOp => b"mn",
        }
    }
}

/// An immutable meta-protocol request, built through the `Request::get` /
/// `set` / ... constructors and `with_*` flag builders.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    command: Command,
    key: Option<Key>,
    value: Option<Bytes>,
    flags: Vec<Flag>,
    opaque: Option<Bytes>,
}

impl Request {
    fn new(command: Command, key: Option<Key>) -> Self {
        Request {
            command,
            key,
            value: None,
            flags: Vec::new(),
            opaque: None,
        }
    }

    pub fn get(key: Key) -> Self {
        Self::new(Command::Get, Some(key))
    }

    pub fn set(key: Key, value: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Command::Set, Some(key));
        request.value = Some(value.into());
        request
    }

    pub fn delete(key: Key) -> Self {
        Self::new(Command::Delete, Some(key))
    }

    pub fn arith(key: Key) -> Self {
        Self::new(Command::Arith, Some(key))
    }

    pub fn debug(key: Key) -> Self {
        Self::new(Command::Debug, Some(key))
    }

    /// A bare `mn\r\n` no-op, used to terminate quiet-mode pipelines.
    pub fn noop() -> Self {
        Self::new(Command::NoOp, None)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn value_ref(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn opaque(&self) -> Option<&Bytes> {
        self.opaque.as_ref()
    }

    pub fn with_bare_flag(mut self, letter: u8) -> Self {
        self.flags.push(Flag::bare(letter));
        self
    }

    pub fn with_flag(mut self, letter: u8, token: impl Into<Bytes>) -> Self {
        self.flags.push(Flag::with_token(letter, token.into()));
        self
    }

    /// Sets the caller's correlation token, echoed back on the response and
    /// cross-checked against it to catch stream desync.
    pub fn with_opaque(mut self, token: impl Into<Bytes>) -> Result<Self, Error> {
        let token = token.into();
        if token.is_empty() || token.len() > MAX_OPAQUE_LEN {
            return Err(Error::Invalid(format!(
                "opaque token must be 1..={MAX_OPAQUE_LEN} bytes, got {}",
                token.len()
            )));
        }
        if !token.iter().all(|&b| b.is_ascii_graphic()) {
            return Err(Error::Invalid("opaque token must be printable ASCII".to_string()));
        }
        self.opaque = Some(token);
        Ok(self)
    }

    pub fn want_value(self) -> Self {
        self.with_bare_flag(b'v')
    }

    pub fn want_key(self) -> Self {
        self.with_bare_flag(b'k')
    }

    pub fn want_size(self) -> Self {
        self.with_bare_flag(b's')
    }

    /// `W` — request anti-stampede "recache winner" semantics on a miss.
    pub fn anti_stampede(self) -> Self {
        self.with_bare_flag(b'W')
    }

    pub fn with_ttl(self, ttl_secs: i64) -> Self {
        self.with_flag(b'T', ttl_secs.to_string())
    }

    /// `N<ttl>` — autovivify: on miss, set a placeholder with this TTL and
    /// return the anti-stampede winner flag to exactly one caller.
    pub fn with_autovivify_ttl(self, ttl_secs: i64) -> Self {
        self.with_flag(b'N', ttl_secs.to_string())
    }

    pub fn with_delta(self, delta: i64) -> Self {
        self.with_flag(b'D', delta.to_string())
    }

    /// Writes the request to `w` field by field with unbuffered `write_all`
    /// calls rather than staging an intermediate buffer — the one exception
    /// is the `ms` data length, which must be known up front and is computed
    /// from the already-owned value slice.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(self.command.wire()).await?;
        if let Some(key) = &self.key {
            w.write_all(b" ").await?;
            w.write_all(key.as_bytes()).await?;
        }
        if self.command == Command::Set {
            let value = self.value.as_deref().unwrap_or(&[]);
            w.write_all(b" ").await?;
            w.write_all(value.len().to_string().as_bytes()).await?;
        }
        for flag in &self.flags {
            w.write_all(b" ").await?;
            w.write_all(&[flag.letter]).await?;
            if let Some(token) = &flag.token {
                w.write_all(token).await?;
            }
        }
        if let Some(opaque) = &self.opaque {
            w.write_all(b" O").await?;
            w.write_all(opaque).await?;
        }
        w.write_all(b"\r\n").await?;
        if self.command == Command::Set {
            w.write_all(self.value.as_deref().unwrap_or(&[])).await?;
            w.write_all(b"\r\n").await?;
        }
        Ok(())
    }
}
