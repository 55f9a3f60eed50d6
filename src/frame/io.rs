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

use std::io;

use crate::connection::Id;
use crate::frame::header::{self, Header, Tag, HEADER_SIZE};
use crate::frame::Frame;
use futures::prelude::*;

/// Reads frames off the receiving half of the transport.
///
/// Partial reads survive across calls: `read_frame` may be dropped by a
/// `select!` at any await point and the next call resumes where the previous
/// one left off, so the byte stream never desynchronizes.
pub(crate) struct FrameReader<T> {
    id: Id,
    io: T,
    max_body_len: usize,
    header_buf: [u8; HEADER_SIZE],
    header_read: usize,
    header: Option<Header<()>>,
    body: Vec<u8>,
    body_read: usize,
}

impl<T> FrameReader<T>
where
    T: AsyncRead + Unpin,
{
    pub(crate) fn new(id: Id, io: T, max_body_len: usize) -> Self {
        FrameReader {
            id,
            io,
            max_body_len,
            header_buf: [0; HEADER_SIZE],
            header_read: 0,
            header: None,
            body: Vec::new(),
            body_read: 0,
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` signals a clean end of the byte stream at a frame
    /// boundary, i.e. the remote has closed the transport.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame<()>>, FrameDecodeError> {
        if self.header.is_none() {
            while self.header_read < HEADER_SIZE {
                let n = self.io.read(&mut self.header_buf[self.header_read..]).await?;
                if n == 0 {
                    if self.header_read == 0 {
                        return Ok(None);
                    }
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                self.header_read += n
            }
            let header = header::decode(&self.header_buf)?;
            log::trace!("{}: read header: {}", self.id, header);
            self.header_read = 0;
            if header.tag() == Tag::Data {
                let len = header.len() as usize;
                if len > self.max_body_len {
                    return Err(FrameDecodeError::BodyTooLarge(len));
                }
                self.body = vec![0; len];
                self.body_read = 0
            }
            self.header = Some(header)
        }

        if self.header.map(|h| h.tag()) == Some(Tag::Data) {
            while self.body_read < self.body.len() {
                let n = self.io.read(&mut self.body[self.body_read..]).await?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                self.body_read += n
            }
        }

        let header = self.header.take().expect("header was set above");
        let body = std::mem::replace(&mut self.body, Vec::new());
        self.body_read = 0;
        Ok(Some(Frame { header, body }))
    }
}

/// Writes frames onto the sending half of the transport, one at a time.
pub(crate) struct FrameWriter<T> {
    id: Id,
    io: T,
}

impl<T> FrameWriter<T>
where
    T: AsyncWrite + Unpin,
{
    pub(crate) fn new(id: Id, io: T) -> Self {
        FrameWriter { id, io }
    }

    /// Write a single frame to completion and flush it.
    pub(crate) async fn write_frame(&mut self, frame: &Frame<()>) -> io::Result<()> {
        log::trace!("{}: write frame: {}, len {}", self.id, frame.header(), frame.body().len());
        let header = header::encode(frame.header());
        self.io.write_all(&header).await?;
        if !frame.body().is_empty() {
            self.io.write_all(frame.body()).await?;
        }
        self.io.flush().await
    }

    pub(crate) async fn close(&mut self) -> io::Result<()> {
        self.io.close().await
    }
}

/// Why reading the next frame off the transport failed.
#[non_exhaustive]
#[derive(Debug)]
pub enum FrameDecodeError {
    /// Reading from the transport failed.
    Io(io::Error),
    /// The fixed 12-byte header did not parse.
    Header(header::HeaderDecodeError),
    /// A data frame announced a body longer than our receive window, which
    /// no sender honouring its credit can ever need.
    BodyTooLarge(usize),
}

impl std::fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameDecodeError::Io(e) => write!(f, "read failed: {}", e),
            FrameDecodeError::Header(e) => write!(f, "invalid frame header: {}", e),
            FrameDecodeError::BodyTooLarge(n) => {
                write!(f, "data frame body of {} bytes exceeds the receive window", n)
            }
        }
    }
}

impl std::error::Error for FrameDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameDecodeError::Io(e) => Some(e),
            FrameDecodeError::Header(e) => Some(e),
            FrameDecodeError::BodyTooLarge(_) => None,
        }
    }
}

impl From<io::Error> for FrameDecodeError {
    fn from(e: io::Error) -> Self {
        FrameDecodeError::Io(e)
    }
}

impl From<header::HeaderDecodeError> for FrameDecodeError {
    fn from(e: header::HeaderDecodeError) -> Self {
        FrameDecodeError::Header(e)
    }
}
