//! Box framing for the worker wire protocol.
//!
//! A *box* is an ordered sequence of (key, value) string pairs. Each key and
//! value is prefixed with a 2-byte big-endian length; a zero-length key
//! terminates the box:
//!
//! ```text
//! | u16 key len | key bytes | u16 value len | value bytes | ... | u16 0 |
//! ```
//!
//! Keys are 1..=255 bytes of UTF-8, values 0..=65535 bytes of UTF-8. The
//! format is shared bit-for-bit by the host and the worker so either side of
//! the pipe can be replaced independently.
//!
//! Parsing is incremental: [`BoxParser`] accumulates fed bytes and yields
//! complete boxes as they become available, which composes with cancel-safe
//! `read_buf` loops. Any malformation (oversized key length, invalid UTF-8,
//! or a stream that ends mid-box) is protocol-fatal: the connection carrying
//! the stream must be torn down.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{CorralError, Result};

/// Maximum length of a single key, in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Maximum encoded size of one box (1 MiB) to prevent memory exhaustion
/// from a misbehaving peer.
pub const MAX_BOX_SIZE: usize = 1024 * 1024;

/// The ordered key/value pairs of one decoded box.
pub type BoxFields = Vec<(String, String)>;

/// Encode a box into its wire representation.
///
/// # Errors
///
/// Returns `InvalidArgument` if a key is empty or longer than
/// [`MAX_KEY_LEN`], a value exceeds `u16::MAX` bytes, or the encoded box
/// would exceed [`MAX_BOX_SIZE`].
pub fn encode_box(fields: &[(String, String)]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    for (key, value) in fields {
        if key.is_empty() {
            return Err(CorralError::InvalidArgument(
                "box key must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(CorralError::InvalidArgument(format!(
                "box key '{}...' exceeds {} bytes",
                &key[..key.len().min(16)],
                MAX_KEY_LEN
            )));
        }
        if value.len() > u16::MAX as usize {
            return Err(CorralError::InvalidArgument(format!(
                "box value for key '{}' exceeds {} bytes",
                key,
                u16::MAX
            )));
        }
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    // zero-length key terminator
    out.extend_from_slice(&0u16.to_be_bytes());
    if out.len() > MAX_BOX_SIZE {
        return Err(CorralError::InvalidArgument(format!(
            "encoded box is {} bytes (max {})",
            out.len(),
            MAX_BOX_SIZE
        )));
    }
    Ok(out)
}

/// Encode and write one box to an async writer, flushing afterwards.
pub async fn write_box<W: AsyncWrite + Unpin>(
    writer: &mut W,
    fields: &[(String, String)],
) -> Result<()> {
    let bytes = encode_box(fields)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental box parser.
///
/// Feed raw bytes with [`feed`](Self::feed) and drain complete boxes with
/// [`next_box`](Self::next_box). Once `next_box` returns an error the
/// stream is unrecoverable and the parser must be discarded.
#[derive(Debug, Default)]
pub struct BoxParser {
    buf: Vec<u8>,
}

impl BoxParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True if the buffer holds a partial box.
    ///
    /// EOF while this is true means the peer closed the stream mid-box,
    /// which is a protocol error.
    pub fn is_mid_box(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Try to parse the next complete box out of the buffer.
    ///
    /// Returns `Ok(None)` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on malformed input: a key length above
    /// [`MAX_KEY_LEN`], invalid UTF-8 in a key or value, or a partial box
    /// that has already outgrown [`MAX_BOX_SIZE`].
    pub fn next_box(&mut self) -> Result<Option<BoxFields>> {
        match try_parse(&self.buf)? {
            Some((fields, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(fields))
            }
            None => {
                if self.buf.len() > MAX_BOX_SIZE {
                    return Err(CorralError::Protocol(format!(
                        "box exceeds {MAX_BOX_SIZE} bytes without terminating"
                    )));
                }
                Ok(None)
            }
        }
    }
}

/// Parse one box from the front of `buf` without consuming it.
///
/// Returns the fields and the number of bytes the box occupied, or `None`
/// if the buffer does not yet hold a complete box.
fn try_parse(buf: &[u8]) -> Result<Option<(BoxFields, usize)>> {
    let mut pos = 0usize;
    let mut fields = BoxFields::new();
    loop {
        let Some(key_len) = read_len(buf, pos) else {
            return Ok(None);
        };
        pos += 2;
        if key_len == 0 {
            return Ok(Some((fields, pos)));
        }
        if key_len > MAX_KEY_LEN {
            return Err(CorralError::Protocol(format!(
                "key length {key_len} exceeds {MAX_KEY_LEN}"
            )));
        }
        if pos + key_len > buf.len() {
            return Ok(None);
        }
        let key = str_field(&buf[pos..pos + key_len], "key")?;
        pos += key_len;

        let Some(value_len) = read_len(buf, pos) else {
            return Ok(None);
        };
        pos += 2;
        if pos + value_len > buf.len() {
            return Ok(None);
        }
        let value = str_field(&buf[pos..pos + value_len], "value")?;
        pos += value_len;

        fields.push((key, value));
    }
}

fn read_len(buf: &[u8], pos: usize) -> Option<usize> {
    if pos + 2 > buf.len() {
        return None;
    }
    Some(u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize)
}

fn str_field(bytes: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CorralError::Protocol(format!("box {what} is not valid UTF-8")))
}
