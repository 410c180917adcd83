//! Binary framing for the store protocol.
//!
//! A frame is a request-type [`Tag`] followed by an ordered list of unique
//! `(key, value)` pairs. Every integer is a big-endian `i32`:
//!
//! ```text
//! tag | pairCount | (keyLen key valLen value) * pairCount
//! ```
//!
//! [`encode`] and [`decode`] work on whole byte slices; [`read_frame`] and
//! [`write_frame`] move one frame at a time over an async stream.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound for a single key or value, in bytes.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Upper bound for the number of pairs in one frame.
pub const MAX_PAIRS: usize = 64 * 1024;

const HEADER_LEN: usize = 8;

/// Request kinds. The numeric codes are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    Auth,
    Register,
    Put,
    Get,
    MultiPut,
    MultiGet,
    GetWhen,
    Logout,
}

impl Tag {
    pub const ALL: [Tag; 8] = [
        Tag::Auth,
        Tag::Register,
        Tag::Put,
        Tag::Get,
        Tag::MultiPut,
        Tag::MultiGet,
        Tag::GetWhen,
        Tag::Logout,
    ];

    pub fn code(self) -> i32 {
        match self {
            Tag::Auth => 1,
            Tag::Register => 2,
            Tag::Put => 3,
            Tag::Get => 4,
            Tag::MultiPut => 5,
            Tag::MultiGet => 6,
            Tag::GetWhen => 7,
            Tag::Logout => 8,
        }
    }

    pub fn from_code(code: i32) -> Option<Tag> {
        Tag::ALL.into_iter().find(|tag| tag.code() == code)
    }
}

impl TryFrom<i32> for Tag {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Tag::from_code(code).ok_or_else(|| Error::malformed(format!("unknown tag {code}")))
    }
}

/// One protocol message. Keys are unique; insertion order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: Tag,
    pairs: Vec<(String, Vec<u8>)>,
}

impl Frame {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            pairs: Vec::new(),
        }
    }

    /// Builds a frame from pairs. A repeated key overwrites the earlier value
    /// but keeps the earlier position.
    pub fn from_pairs<I, K, V>(tag: Tag, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        pairs
            .into_iter()
            .fold(Frame::new(tag), |frame, (key, value)| frame.with_pair(key, value))
    }

    pub fn with_pair(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
        self
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn pairs(&self) -> &[(String, Vec<u8>)] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<(String, Vec<u8>)> {
        self.pairs
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_slice())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self
                .pairs
                .iter()
                .map(|(key, value)| 8 + key.len() + value.len())
                .sum::<usize>()
    }
}

/// Serializes a frame. Fails only when a field exceeds the codec limits.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    check_count(frame.pairs.len())?;
    let mut out = Vec::with_capacity(frame.encoded_len());
    out.extend_from_slice(&frame.tag.code().to_be_bytes());
    out.extend_from_slice(&(frame.pairs.len() as i32).to_be_bytes());
    for (key, value) in &frame.pairs {
        put_field(&mut out, key.as_bytes())?;
        put_field(&mut out, value)?;
    }
    Ok(out)
}

/// Parses exactly one frame from `bytes`. Trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let tag = Tag::try_from(cursor.i32()?)?;
    let count = check_count_field(cursor.i32()?)?;

    let mut pairs = PairCollector::with_capacity(count);
    for _ in 0..count {
        let key_len = check_len(cursor.i32()?, "key")?;
        let key = utf8_key(cursor.take(key_len)?.to_vec())?;
        let value_len = check_len(cursor.i32()?, "value")?;
        let value = cursor.take(value_len)?.to_vec();
        pairs.push(key, value)?;
    }

    if cursor.remaining() != 0 {
        return Err(Error::malformed(format!(
            "{} trailing bytes after frame",
            cursor.remaining()
        )));
    }
    Ok(pairs.finish(tag))
}

/// Reads the next frame from a stream.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames. Running out
/// of bytes inside a frame is a [`Error::MalformedFrame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 4];
    let mut filled = 0;
    while filled < first.len() {
        let n = reader.read(&mut first[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(truncated());
        }
        filled += n;
    }

    let tag = Tag::try_from(i32::from_be_bytes(first))?;
    let count = check_count_field(read_i32(reader).await?)?;

    let mut pairs = PairCollector::with_capacity(count);
    for _ in 0..count {
        let key_len = check_len(read_i32(reader).await?, "key")?;
        let key = utf8_key(read_exact_vec(reader, key_len).await?)?;
        let value_len = check_len(read_i32(reader).await?, "value")?;
        let value = read_exact_vec(reader, value_len).await?;
        pairs.push(key, value)?;
    }
    Ok(Some(pairs.finish(tag)))
}

/// Writes one whole frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Encode up front so a frame is either fully written or not started.
    let encoded = encode(frame)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) -> Result<()> {
    if field.len() > MAX_FIELD_LEN {
        return Err(Error::malformed(format!(
            "field of {} bytes exceeds limit of {MAX_FIELD_LEN}",
            field.len()
        )));
    }
    out.extend_from_slice(&(field.len() as i32).to_be_bytes());
    out.extend_from_slice(field);
    Ok(())
}

fn check_count(count: usize) -> Result<()> {
    if count > MAX_PAIRS {
        return Err(Error::malformed(format!(
            "{count} pairs exceeds limit of {MAX_PAIRS}"
        )));
    }
    Ok(())
}

fn check_count_field(raw: i32) -> Result<usize> {
    let count = usize::try_from(raw)
        .map_err(|_| Error::malformed(format!("negative pair count {raw}")))?;
    check_count(count)?;
    Ok(count)
}

fn check_len(raw: i32, what: &str) -> Result<usize> {
    let len =
        usize::try_from(raw).map_err(|_| Error::malformed(format!("negative {what} length {raw}")))?;
    if len > MAX_FIELD_LEN {
        return Err(Error::malformed(format!(
            "{what} length {len} exceeds limit of {MAX_FIELD_LEN}"
        )));
    }
    Ok(len)
}

fn utf8_key(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|err| Error::malformed(format!("key is not utf-8: {err}")))
}

fn truncated() -> Error {
    Error::malformed("stream ended inside a frame")
}

async fn read_i32<R>(reader: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    reader.read_i32().await.map_err(eof_as_truncated)
}

async fn read_exact_vec<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(eof_as_truncated)?;
    Ok(buf)
}

fn eof_as_truncated(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        truncated()
    } else {
        err.into()
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::malformed(format!(
                "declared length {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

/// Accumulates decoded pairs and rejects repeated keys.
struct PairCollector {
    seen: HashSet<String>,
    pairs: Vec<(String, Vec<u8>)>,
}

impl PairCollector {
    fn with_capacity(count: usize) -> Self {
        // The count is untrusted; cap the preallocation.
        let capacity = count.min(1024);
        Self {
            seen: HashSet::with_capacity(capacity),
            pairs: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, key: String, value: Vec<u8>) -> Result<()> {
        if !self.seen.insert(key.clone()) {
            return Err(Error::malformed(format!("duplicate key {key:?}")));
        }
        self.pairs.push((key, value));
        Ok(())
    }

    fn finish(self, tag: Tag) -> Frame {
        Frame {
            tag,
            pairs: self.pairs,
        }
    }
}
