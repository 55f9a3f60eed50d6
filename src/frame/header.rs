// Copyright 2020 Netwarps Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! The 12-byte yamux frame header.
//!
//! ```text
//! 0      1      2       4          8          12
//! +------+------+-------+----------+----------+
//! | vers | type | flags | streamid | length   |
//! +------+------+-------+----------+----------+
//! ```
//!
//! All multi-byte integers are big-endian.

use std::fmt;
use std::marker::PhantomData;

/// Size of the frame header in bytes.
pub(crate) const HEADER_SIZE: usize = 12;

/// The stream id used by session-level frames (ping, go-away).
pub(crate) const CONNECTION_ID: StreamId = StreamId(0);

/// The type of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
}

/// A set of header flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(u16);

/// Indicates the start of a new stream.
pub const SYN: Flags = Flags(1);

/// Acknowledges the start of a new stream.
pub const ACK: Flags = Flags(2);

/// Indicates the half-closing of a stream.
pub const FIN: Flags = Flags(4);

/// Indicates an immediate stream reset.
pub const RST: Flags = Flags(8);

impl Flags {
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn val(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, other: Flags) -> Self::Output {
        Flags(self.0 | other.0)
    }
}

/// The id of a stream.
///
/// Odd ids belong to client-initiated streams, even ids to server-initiated
/// ones; id 0 is reserved for frames addressing the session itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    pub(crate) fn new(val: u32) -> Self {
        StreamId(val)
    }

    pub fn is_client(self) -> bool {
        self.0 % 2 == 1
    }

    pub fn is_server(self) -> bool {
        !self.is_session() && self.0 % 2 == 0
    }

    pub fn is_session(self) -> bool {
        self == CONNECTION_ID
    }

    pub fn val(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::hash::Hash for StreamId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.0)
    }
}

impl nohash_hasher::IsEnabled for StreamId {}

/// The header of a yamux frame.
///
/// The type parameter tracks what kind of frame this header belongs to; it
/// has no runtime representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header<T> {
    tag: Tag,
    flags: Flags,
    stream_id: StreamId,
    length: u32,
    _marker: PhantomData<T>,
}

impl<T> fmt::Display for Header<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(Header {:?} {} (len {}) (flags {}))",
            self.tag, self.stream_id, self.length, self.flags.val()
        )
    }
}

impl<T> Header<T> {
    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn len(&self) -> u32 {
        self.length
    }

    /// Set the start-of-stream flag.
    pub fn syn(&mut self) {
        self.flags = self.flags | SYN
    }

    /// Set the acknowledgement flag.
    pub fn ack(&mut self) {
        self.flags = self.flags | ACK
    }

    /// Set the half-close flag.
    pub fn fin(&mut self) {
        self.flags = self.flags | FIN
    }

    /// Set the reset flag.
    pub fn rst(&mut self) {
        self.flags = self.flags | RST
    }

    pub(crate) fn cast<U>(self) -> Header<U> {
        Header {
            tag: self.tag,
            flags: self.flags,
            stream_id: self.stream_id,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

/// Data frames.
#[derive(Clone, Copy, Debug)]
pub enum Data {}

/// Window update frames.
#[derive(Clone, Copy, Debug)]
pub enum WindowUpdate {}

/// Ping frames.
#[derive(Clone, Copy, Debug)]
pub enum Ping {}

/// Go-away frames.
#[derive(Clone, Copy, Debug)]
pub enum GoAway {}

impl Header<Data> {
    pub fn data(id: StreamId, len: u32) -> Self {
        Header {
            tag: Tag::Data,
            flags: Flags(0),
            stream_id: id,
            length: len,
            _marker: PhantomData,
        }
    }
}

impl Header<WindowUpdate> {
    pub fn window_update(id: StreamId, credit: u32) -> Self {
        Header {
            tag: Tag::WindowUpdate,
            flags: Flags(0),
            stream_id: id,
            length: credit,
            _marker: PhantomData,
        }
    }

    /// The credit this window update grants.
    pub fn credit(&self) -> u32 {
        self.length
    }
}

impl Header<Ping> {
    pub fn ping(nonce: u32) -> Self {
        Header {
            tag: Tag::Ping,
            flags: Flags(0),
            stream_id: CONNECTION_ID,
            length: nonce,
            _marker: PhantomData,
        }
    }

    /// The opaque value echoed back by the ping answer.
    pub fn nonce(&self) -> u32 {
        self.length
    }
}

impl Header<GoAway> {
    pub fn go_away(code: u32) -> Self {
        Header {
            tag: Tag::GoAway,
            flags: Flags(0),
            stream_id: CONNECTION_ID,
            length: code,
            _marker: PhantomData,
        }
    }

    /// The reason code of this termination frame.
    pub fn reason(&self) -> u32 {
        self.length
    }
}

/// Serialize a header into its 12-byte wire representation.
pub(crate) fn encode<T>(hdr: &Header<T>) -> [u8; HEADER_SIZE] {
    let mut buf = [0; HEADER_SIZE];
    buf[1] = hdr.tag as u8;
    buf[2..4].copy_from_slice(&hdr.flags.0.to_be_bytes());
    buf[4..8].copy_from_slice(&hdr.stream_id.0.to_be_bytes());
    buf[8..HEADER_SIZE].copy_from_slice(&hdr.length.to_be_bytes());
    buf
}

/// Parse a 12-byte buffer into a frame header.
pub(crate) fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Header<()>, HeaderDecodeError> {
    if buf[0] != 0 {
        return Err(HeaderDecodeError::Version(buf[0]));
    }
    let tag = match buf[1] {
        0 => Tag::Data,
        1 => Tag::WindowUpdate,
        2 => Tag::Ping,
        3 => Tag::GoAway,
        t => return Err(HeaderDecodeError::Type(t)),
    };
    let mut be16 = [0; 2];
    let mut be32 = [0; 4];
    be16.copy_from_slice(&buf[2..4]);
    let flags = Flags(u16::from_be_bytes(be16));
    be32.copy_from_slice(&buf[4..8]);
    let stream_id = StreamId(u32::from_be_bytes(be32));
    be32.copy_from_slice(&buf[8..HEADER_SIZE]);
    let length = u32::from_be_bytes(be32);
    Ok(Header {
        tag,
        flags,
        stream_id,
        length,
        _marker: PhantomData,
    })
}

/// Possible errors while decoding a frame header.
#[non_exhaustive]
#[derive(Debug)]
pub enum HeaderDecodeError {
    /// Unsupported protocol version.
    Version(u8),
    /// Unknown frame type.
    Type(u8),
}

impl std::fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HeaderDecodeError::Version(v) => write!(f, "unknown version: {}", v),
            HeaderDecodeError::Type(t) => write!(f, "unknown frame type: {}", t),
        }
    }
}

impl std::error::Error for HeaderDecodeError {}
