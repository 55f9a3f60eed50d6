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

pub mod header;
pub mod io;

use header::{Data, GoAway, Header, Ping, StreamId, WindowUpdate};

/// Go-away code for normal termination.
pub const CODE_TERM: u32 = 0;

/// Go-away code for protocol errors.
pub const CODE_PROTOCOL_ERROR: u32 = 1;

/// Go-away code for internal errors.
pub const CODE_INTERNAL_ERROR: u32 = 2;

/// A yamux frame: a typed header and, for data frames, a payload.
///
/// Non-data frames carry their value in the header's length field and
/// have an empty body.
#[derive(Clone, Debug)]
pub struct Frame<T> {
    header: Header<T>,
    body: Vec<u8>,
}

impl<T> Frame<T> {
    pub fn new(header: Header<T>) -> Self {
        Frame { header, body: Vec::new() }
    }

    pub fn header(&self) -> &Header<T> {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header<T> {
        &mut self.header
    }

    pub(crate) fn cast<U>(self) -> Frame<U> {
        Frame {
            header: self.header.cast(),
            body: self.body,
        }
    }
}

impl Frame<()> {
    pub(crate) fn into_data(self) -> Frame<Data> {
        self.cast()
    }

    pub(crate) fn into_window_update(self) -> Frame<WindowUpdate> {
        self.cast()
    }

    pub(crate) fn into_ping(self) -> Frame<Ping> {
        self.cast()
    }

    pub(crate) fn into_go_away(self) -> Frame<GoAway> {
        self.cast()
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }
}

impl Frame<Data> {
    /// A data frame carrying `body`.
    ///
    /// The caller is responsible for keeping `body` within the negotiated
    /// maximum frame size; the length field cannot express more than
    /// `u32::MAX` bytes.
    pub fn data(id: StreamId, body: Vec<u8>) -> Self {
        debug_assert!(body.len() <= u32::max_value() as usize);
        Frame {
            header: Header::data(id, body.len() as u32),
            body,
        }
    }

    /// An empty data frame with the FIN flag, half-closing a stream.
    pub fn close_stream(id: StreamId) -> Self {
        let mut header = Header::data(id, 0);
        header.fin();
        Frame::new(header)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> u32 {
        self.body.len() as u32
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

impl Frame<WindowUpdate> {
    /// A window update granting `credit` more bytes.
    pub fn window_update(id: StreamId, credit: u32) -> Self {
        Frame::new(Header::window_update(id, credit))
    }

    /// An empty window update with the RST flag, resetting a stream.
    pub fn reset_stream(id: StreamId) -> Self {
        let mut header = Header::window_update(id, 0);
        header.rst();
        Frame::new(header)
    }
}

impl Frame<Ping> {
    pub fn ping(nonce: u32) -> Self {
        Frame::new(Header::ping(nonce))
    }
}

impl Frame<GoAway> {
    /// Normal session termination.
    pub fn term() -> Self {
        Frame::new(Header::go_away(CODE_TERM))
    }

    /// Session termination due to a protocol violation of the remote.
    pub fn protocol_error() -> Self {
        Frame::new(Header::go_away(CODE_PROTOCOL_ERROR))
    }

    /// Session termination due to a local failure.
    pub fn internal_error() -> Self {
        Frame::new(Header::go_away(CODE_INTERNAL_ERROR))
    }
}

#[cfg(test)]
mod tests {
    use super::header::{self, StreamId};
    use super::*;

    #[test]
    fn data_frame_sets_length_from_body() {
        let frame = Frame::data(StreamId::new(7), vec![1, 2, 3, 4, 5]);
        assert_eq!(5, frame.header().len());
        assert_eq!(5, frame.body_len());
        assert_eq!(header::Tag::Data, frame.header().tag())
    }

    #[test]
    fn close_frame_is_empty_fin() {
        let frame = Frame::close_stream(StreamId::new(3));
        assert_eq!(0, frame.header().len());
        assert!(frame.header().flags().contains(header::FIN));
        assert!(!frame.header().flags().contains(header::RST))
    }

    #[test]
    fn reset_frame_is_window_update_rst() {
        let frame = Frame::reset_stream(StreamId::new(3));
        assert_eq!(header::Tag::WindowUpdate, frame.header().tag());
        assert_eq!(0, frame.header().len());
        assert!(frame.header().flags().contains(header::RST))
    }

    #[test]
    fn go_away_reason_codes() {
        assert_eq!(CODE_TERM, Frame::term().header().reason());
        assert_eq!(CODE_PROTOCOL_ERROR, Frame::protocol_error().header().reason());
        assert_eq!(CODE_INTERNAL_ERROR, Frame::internal_error().header().reason())
    }
}
