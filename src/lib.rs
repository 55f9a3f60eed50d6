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

//! An implementation of the [yamux 1.0 protocol](https://github.com/hashicorp/yamux/blob/master/spec.md),
//! multiplexing independent, credit-flow-controlled streams over a single
//! secured, reliable, ordered byte transport.
//!
//! Create a [`Connection`] over the transport, drive it from one task via
//! [`Connection::next_stream`], and use [`Control`] handles to open, accept
//! and close streams. Streams implement `AsyncRead`/`AsyncWrite` and support
//! half-close: closing the writing end leaves already-buffered inbound data
//! readable until the remote closes too.

mod chunks;
pub mod connection;
pub mod error;
pub mod frame;

pub use connection::{control::Control, stream::State, stream::Stream, Connection, Mode};
pub use error::ConnectionError;
pub use frame::header::{HeaderDecodeError, StreamId};
pub use frame::io::FrameDecodeError;

use std::time::Duration;

/// The protocol id advertised during multiplexer negotiation.
pub const PROTOCOL_ID: &[u8] = b"/yamux/1.0.0";

/// The initial send and receive credit every stream starts with, implied by
/// the protocol. Receive windows beyond this are advertised as deltas.
pub(crate) const DEFAULT_CREDIT: u32 = 256 * 1024;

/// Bound on the command queue between streams (or controls) and their
/// connection. Writers wait for a slot once this many commands are queued.
pub(crate) const MAX_COMMAND_BACKLOG: usize = 50;

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Yamux configuration.
///
/// The default configuration values are as follows:
///
/// - initial window size = 256 KiB
/// - max. number of streams = 256
/// - max. frame body size = 16 KiB
/// - window update threshold = 32 KiB
/// - keep-alive interval = 30 s
/// - stream open timeout = 10 s
/// - ping timeout = 30 s, threshold = 5 lost pings
#[derive(Debug, Clone)]
pub struct Config {
    initial_window_size: u32,
    max_streams: usize,
    max_frame_size: usize,
    window_update_threshold: u32,
    keepalive_interval: Duration,
    stream_open_timeout: Duration,
    ping_timeout: Duration,
    ping_timeout_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_window_size: DEFAULT_CREDIT,
            max_streams: 256,
            max_frame_size: 16 * 1024,
            window_update_threshold: 32 * 1024,
            keepalive_interval: Duration::from_secs(30),
            stream_open_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
            ping_timeout_threshold: 5,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Set the initial per-stream window size (must be >= 256 KiB).
    ///
    /// The protocol fixes the initial credit at 256 KiB; only windows
    /// beyond that can be advertised to the remote.
    ///
    /// # Panics
    ///
    /// If the given window size is < 256 KiB.
    pub fn set_initial_window_size(&mut self, n: u32) -> &mut Self {
        assert!(n >= DEFAULT_CREDIT);
        self.initial_window_size = n;
        self
    }

    /// Set the max. number of concurrent streams per connection.
    pub fn set_max_streams(&mut self, n: usize) -> &mut Self {
        self.max_streams = n;
        self
    }

    /// Set the max. body size of a single data frame.
    pub fn set_max_frame_size(&mut self, n: usize) -> &mut Self {
        assert!(n > 0 && n <= DEFAULT_CREDIT as usize);
        self.max_frame_size = n;
        self
    }

    /// Set how many bytes the application must consume before the freed
    /// window is advertised back to the remote.
    pub fn set_window_update_threshold(&mut self, n: u32) -> &mut Self {
        assert!(n > 0 && n <= self.initial_window_size);
        self.window_update_threshold = n;
        self
    }

    /// Set the keep-alive ping interval. A zero duration disables
    /// keep-alive entirely.
    pub fn set_keepalive_interval(&mut self, d: Duration) -> &mut Self {
        self.keepalive_interval = d;
        self
    }

    /// Set how long to wait for the remote to acknowledge a new stream.
    pub fn set_stream_open_timeout(&mut self, d: Duration) -> &mut Self {
        self.stream_open_timeout = d;
        self
    }

    /// Set the time after which an unanswered ping counts as lost.
    pub fn set_ping_timeout(&mut self, d: Duration) -> &mut Self {
        self.ping_timeout = d;
        self
    }

    /// Set the number of consecutively lost pings that terminates the
    /// connection.
    pub fn set_ping_timeout_threshold(&mut self, n: u32) -> &mut Self {
        assert!(n > 0);
        self.ping_timeout_threshold = n;
        self
    }
}
