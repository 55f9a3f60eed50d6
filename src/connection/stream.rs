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

use crate::chunks::Chunks;
use crate::connection::{self, StreamCommand};
use crate::frame::header::StreamId;
use crate::frame::Frame;
use crate::Config;
use futures::channel::mpsc;
use futures::{Future, SinkExt};
use futures_timer::Delay;
use parking_lot::{Mutex, MutexGuard};
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Instant,
};

/// The state of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Open bidirectionally.
    Open,
    /// We half-closed; data from the remote is still readable.
    SendClosed,
    /// The remote half-closed; buffered data is still readable and we may
    /// still write.
    RecvClosed,
    /// Both directions closed and everything drained (terminal).
    Closed,
    /// Abnormally terminated (terminal).
    Reset,
}

/// A single bidirectional stream multiplexed over a session.
///
/// Created outbound via [`crate::Control::open_stream`] or inbound via
/// [`crate::Control::accept_stream`]. Implements [`AsyncRead`] and
/// [`AsyncWrite`]; closing the writer half-closes the stream, the reading
/// direction stays usable until the remote half-closes too.
///
/// [`AsyncRead`]: futures::io::AsyncRead
/// [`AsyncWrite`]: futures::io::AsyncWrite
pub struct Stream {
    id: StreamId,
    conn: connection::Id,
    config: Arc<Config>,
    sender: mpsc::Sender<StreamCommand>,
    pending_update: Option<Frame<()>>,
    deadline: Option<Instant>,
    timer: Option<Delay>,
    shared: Arc<Mutex<Shared>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id.val())
            .field("connection", &self.conn)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(Stream {}/{})", self.conn, self.id.val())
    }
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        conn: connection::Id,
        config: Arc<Config>,
        window: u32,
        credit: u32,
        sender: mpsc::Sender<StreamCommand>,
    ) -> Self {
        Stream {
            id,
            conn,
            config,
            sender,
            pending_update: None,
            deadline: None,
            timer: None,
            shared: Arc::new(Mutex::new(Shared::new(window, credit))),
        }
    }

    /// Get this stream's identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get this stream's state.
    pub fn state(&self) -> State {
        self.shared().state()
    }

    /// Set or clear the instant after which pending reads and writes fail
    /// with a timeout.
    ///
    /// An expired operation leaves the stream itself untouched; it remains
    /// usable if the caller decides to continue.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        self.timer = None
    }

    /// Close the reading direction locally.
    ///
    /// Any pending and all future reads return EOF. The remote is not
    /// notified and may keep sending until its credit runs out.
    pub fn close_read(&mut self) {
        let mut shared = self.shared();
        if !shared.read_closed {
            log::trace!("{}/{}: close read", self.conn, self.id);
            shared.read_closed = true;
            if let Some(w) = shared.reader.take() {
                w.wake()
            }
        }
    }

    /// Abort this stream.
    ///
    /// Pending reads and writes fail, buffered data is discarded, and a
    /// best-effort reset frame tells the remote. The local transition
    /// happens regardless of whether the frame can still be sent.
    pub async fn reset(&mut self) {
        let send_rst = {
            let mut shared = self.shared();
            match shared.state() {
                State::Closed | State::Reset => false,
                _ => {
                    shared.reset = true;
                    shared.buffer.clear();
                    shared.wake_both();
                    true
                }
            }
        };
        if send_rst {
            log::trace!("{}/{}: reset", self.conn, self.id);
            if self.sender.send(StreamCommand::ResetStream(self.id)).await.is_err() {
                log::debug!("{}/{}: connection is gone, reset is local only", self.conn, self.id)
            }
        }
    }

    pub(crate) fn clone(&self) -> Self {
        Stream {
            id: self.id,
            conn: self.conn,
            config: self.config.clone(),
            sender: self.sender.clone(),
            pending_update: None,
            deadline: None,
            timer: None,
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub(crate) fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    /// Hand a deferred window update to the connection if the command
    /// channel has capacity; otherwise keep it for the next poll.
    fn flush_pending_update(&mut self, cx: &mut Context) {
        if self.pending_update.is_none() {
            return;
        }
        match self.sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let frame = self.pending_update.take().expect("pending_update.is_some()");
                if self.sender.start_send(StreamCommand::SendFrame(frame)).is_err() {
                    log::debug!("{}/{}: connection is gone, dropping window update", self.conn, self.id)
                }
            }
            Poll::Ready(Err(_)) => self.pending_update = None,
            Poll::Pending => {}
        }
    }

    fn poll_deadline(&mut self, cx: &mut Context) -> Poll<()> {
        let deadline = match self.deadline {
            Some(d) => d,
            None => return Poll::Pending,
        };
        let timer = self
            .timer
            .get_or_insert_with(|| Delay::new(deadline.saturating_duration_since(Instant::now())));
        Pin::new(timer).poll(cx)
    }

    fn conn_closed_err(&self) -> io::Error {
        let msg = format!("{}/{}: connection is closed", self.conn, self.id);
        io::Error::new(io::ErrorKind::WriteZero, msg)
    }

    fn closed_err(&self) -> io::Error {
        let msg = format!("{}/{}: stream is closed", self.conn, self.id);
        io::Error::new(io::ErrorKind::BrokenPipe, msg)
    }

    fn reset_err(&self) -> io::Error {
        let msg = format!("{}/{}: stream reset", self.conn, self.id);
        io::Error::new(io::ErrorKind::ConnectionReset, msg)
    }
}

impl futures::io::AsyncRead for Stream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // A window update deferred by an earlier poll goes out first.
        this.flush_pending_update(cx);

        let n = {
            let mut shared = this.shared.lock();
            if shared.reset {
                return Poll::Ready(Err(this.reset_err()));
            }
            if shared.read_closed {
                return Poll::Ready(Ok(0));
            }
            if shared.buffer.is_empty() {
                if shared.fin_received {
                    if shared.fin_sent {
                        // Fully closed; a single EOF, then errors.
                        if shared.eof_delivered {
                            return Poll::Ready(Err(this.closed_err()));
                        }
                        shared.eof_delivered = true
                    }
                    log::trace!("{}/{}: eof", this.conn, this.id);
                    return Poll::Ready(Ok(0));
                }
                shared.reader = Some(cx.waker().clone());
                drop(shared);
                if this.poll_deadline(cx).is_ready() {
                    return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
                }
                return Poll::Pending;
            }
            let n = shared.buffer.read_into(buf);
            shared.consumed += n as u32;
            if shared.consumed >= this.config.window_update_threshold && !shared.fin_received {
                // Return the consumed credit to the remote.
                let delta = shared.consumed;
                shared.consumed = 0;
                shared.window += delta;
                this.pending_update = Some(Frame::window_update(this.id, delta).cast())
            }
            n
        };

        this.flush_pending_update(cx);
        log::trace!("{}/{}: read {} bytes", this.conn, this.id, n);
        Poll::Ready(Ok(n))
    }
}

impl futures::io::AsyncWrite for Stream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        match this.sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(this.conn_closed_err())),
            Poll::Pending => {
                if this.poll_deadline(cx).is_ready() {
                    return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
                }
                return Poll::Pending;
            }
        }

        let (frame, n) = {
            let mut shared = this.shared.lock();
            if shared.reset {
                return Poll::Ready(Err(this.reset_err()));
            }
            if !shared.can_write() {
                log::debug!("{}/{}: can no longer write", this.conn, this.id);
                let msg = format!("{}/{}: stream is closed for writing", this.conn, this.id);
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, msg)));
            }
            if shared.credit == 0 {
                log::debug!("{}/{}: no more credit left", this.conn, this.id);
                shared.writer = Some(cx.waker().clone());
                drop(shared);
                if this.poll_deadline(cx).is_ready() {
                    return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
                }
                return Poll::Pending;
            }
            let mut k = std::cmp::min(buf.len(), shared.credit as usize);
            k = std::cmp::min(k, this.config.max_frame_size);
            shared.credit -= k as u32;
            (Frame::data(this.id, buf[..k].to_vec()).cast(), k)
        };

        if this.sender.start_send(StreamCommand::SendFrame(frame)).is_err() {
            return Poll::Ready(Err(this.conn_closed_err()));
        }
        log::trace!("{}/{}: write {} bytes", this.conn, this.id, n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context) -> Poll<io::Result<()>> {
        // Frames are written and flushed one at a time by the connection.
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = &mut *self;

        {
            let shared = this.shared.lock();
            if shared.reset || shared.fin_sent {
                return Poll::Ready(Ok(()));
            }
        }
        match this.sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            // The connection is gone; there is nothing left to close.
            Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
        if this.sender.start_send(StreamCommand::CloseStream(this.id)).is_err() {
            return Poll::Ready(Ok(()));
        }
        log::trace!("{}/{}: close", this.conn, this.id);
        this.shared.lock().fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    /// Receive credit we have granted to the remote.
    pub(crate) window: u32,
    /// Send credit granted to us by the remote.
    pub(crate) credit: u32,
    pub(crate) buffer: Chunks,
    /// Bytes consumed by the application since the last window update.
    pub(crate) consumed: u32,
    pub(crate) fin_sent: bool,
    pub(crate) fin_received: bool,
    pub(crate) read_closed: bool,
    pub(crate) reset: bool,
    eof_delivered: bool,
    pub(crate) reader: Option<Waker>,
    pub(crate) writer: Option<Waker>,
}

impl Shared {
    fn new(window: u32, credit: u32) -> Self {
        Shared {
            window,
            credit,
            buffer: Chunks::new(),
            consumed: 0,
            fin_sent: false,
            fin_received: false,
            read_closed: false,
            reset: false,
            eof_delivered: false,
            reader: None,
            writer: None,
        }
    }

    /// The stream state as implied by the flags and the buffer.
    ///
    /// `Closed` is only reached once both sides half-closed *and* the
    /// receive buffer has been drained; closing earlier would lose data
    /// the application has not read yet.
    pub(crate) fn state(&self) -> State {
        if self.reset {
            State::Reset
        } else if self.fin_sent && self.fin_received && self.buffer.is_empty() {
            State::Closed
        } else if self.fin_received {
            State::RecvClosed
        } else if self.fin_sent {
            State::SendClosed
        } else {
            State::Open
        }
    }

    pub(crate) fn can_write(&self) -> bool {
        !self.reset && !self.fin_sent
    }

    /// Transition to `Reset`, discarding buffered data and failing any
    /// pending read or write.
    pub(crate) fn force_reset(&mut self) {
        if !self.reset {
            self.reset = true;
            self.buffer.clear()
        }
        self.wake_both()
    }

    pub(crate) fn wake_both(&mut self) {
        if let Some(w) = self.reader.take() {
            w.wake()
        }
        if let Some(w) = self.writer.take() {
            w.wake()
        }
    }
}
