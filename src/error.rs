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

use crate::frame::io::FrameDecodeError;
use std::io;

/// Errors terminating a session or failing a session-level operation.
///
/// Errors of individual streams surface as `std::io::Error` through their
/// `AsyncRead`/`AsyncWrite` implementations and never affect other streams.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectionError {
    /// An I/O error on the underlying transport.
    Io(io::Error),
    /// Decoding an inbound frame failed.
    Decode(FrameDecodeError),
    /// The remote violated the protocol.
    Protocol(&'static str),
    /// The stream id space of this session is exhausted.
    NoMoreStreamIds,
    /// The session is closed.
    Closed,
    /// Too many concurrent streams.
    TooManyStreams,
    /// The remote reset the stream while it was being opened.
    StreamReset,
    /// The remote did not acknowledge a new stream in time.
    StreamOpenTimeout,
    /// Too many keep-alive pings went unanswered.
    KeepAliveTimeout,
    /// The remote terminated the session with the given go-away code.
    RemoteGoAway(u32),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "i/o error: {}", e),
            ConnectionError::Decode(e) => write!(f, "frame decode error: {}", e),
            ConnectionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnectionError::NoMoreStreamIds => f.write_str("number of stream ids has been exhausted"),
            ConnectionError::Closed => f.write_str("connection is closed"),
            ConnectionError::TooManyStreams => f.write_str("maximum number of streams reached"),
            ConnectionError::StreamReset => f.write_str("stream reset while opening"),
            ConnectionError::StreamOpenTimeout => f.write_str("opening a new stream timed out"),
            ConnectionError::KeepAliveTimeout => f.write_str("keep-alive timed out"),
            ConnectionError::RemoteGoAway(code) => write!(f, "remote terminated the session (go away code {})", code),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<FrameDecodeError> for ConnectionError {
    fn from(e: FrameDecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<futures::channel::oneshot::Canceled> for ConnectionError {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        ConnectionError::Closed
    }
}

impl From<futures::channel::mpsc::SendError> for ConnectionError {
    fn from(_: futures::channel::mpsc::SendError) -> Self {
        ConnectionError::Closed
    }
}
