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

//! A session multiplexing many streams over one secured transport.
//!
//! The `Connection` owns the transport. Reads happen on the task driving
//! [`Connection::next_stream`], which decodes frames and dispatches them to
//! streams and waiters. All writes funnel through a single writer task that
//! transmits one frame at a time: the secured transport beneath us derives a
//! fresh AEAD nonce per record, so two interleaved encodes would desynchronize
//! the remote's decryption. Handlers running on the read path therefore only
//! *post* frames to the writer and never await their transmission, which also
//! keeps the dispatch loop responsive under write congestion.
//!
//! [`Control`] handles talk to the dispatch loop over a bounded command
//! channel, as do the streams themselves. A keep-alive task ticks the loop
//! periodically; unanswered pings beyond the configured threshold terminate
//! the session.

pub mod control;
pub mod stream;

use crate::error::ConnectionError;
use crate::frame::header::{self, GoAway, Ping, StreamId, Tag, WindowUpdate};
use crate::frame::io::{FrameDecodeError, FrameReader, FrameWriter};
use crate::frame::{self, Frame};
use crate::{Config, Result, DEFAULT_CREDIT, MAX_COMMAND_BACKLOG};
use async_std::task;
use control::Control;
use futures::channel::{mpsc, oneshot};
use futures::io::{ReadHalf, WriteHalf};
use futures::prelude::*;
use nohash_hasher::IntMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, io};
use stream::Stream;

/// How many unclaimed inbound streams may queue up before further ones
/// are refused.
const ACCEPT_BACKLOG: usize = 32;

/// How the connection is used.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Mode {
    /// Client to server connection; we allocate odd stream ids.
    Client,
    /// Server to client connection; we allocate even stream ids.
    Server,
}

/// The connection identifier.
///
/// Randomly generated, this is mainly intended to improve log output.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Id(u32);

impl Id {
    pub(crate) fn random() -> Self {
        Id(rand::random())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// `Stream` to `Connection` commands.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// A frame to be sent to the remote.
    SendFrame(Frame<()>),
    /// Half-close the given stream.
    CloseStream(StreamId),
    /// Abort the given stream.
    ResetStream(StreamId),
}

/// `Control` to `Connection` commands.
pub(crate) enum ControlCommand {
    /// Open a new stream to the remote.
    OpenStream(OpenReply),
    /// Accept a stream opened by the remote.
    AcceptStream(oneshot::Sender<Result<Stream>>),
    /// Close the whole connection.
    Close(oneshot::Sender<()>),
    /// A keep-alive tick; check pending pings and send a new one.
    Keepalive,
}

/// Reply to an open request: the new stream plus a waiter for the
/// remote's acknowledgement.
type OpenReply = oneshot::Sender<Result<(Stream, oneshot::Receiver<Result<()>>)>>;

/// What woke the dispatch loop up.
enum Event {
    Command(Option<ControlCommand>),
    Stream(Option<StreamCommand>),
    Frame(std::result::Result<Option<Frame<()>>, FrameDecodeError>),
    WriterGone(std::result::Result<io::Error, oneshot::Canceled>),
}

/// A yamux connection object.
///
/// Wraps the underlying secured I/O resource and multiplexes [`Stream`]s
/// over it. Makes progress via [`Connection::next_stream`], which one task
/// must drive until it returns an error or the session is closed.
pub struct Connection<T> {
    id: Id,
    mode: Mode,
    config: Arc<Config>,
    reader: FrameReader<ReadHalf<T>>,
    frame_tx: mpsc::UnboundedSender<Frame<()>>,
    writer_failure: oneshot::Receiver<io::Error>,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: mpsc::Receiver<ControlCommand>,
    stream_tx: mpsc::Sender<StreamCommand>,
    stream_rx: mpsc::Receiver<StreamCommand>,
    next_id: u32,
    streams: IntMap<StreamId, Stream>,
    /// ACK waiters of locally initiated streams, keyed by stream id.
    pending_open: IntMap<StreamId, oneshot::Sender<Result<()>>>,
    /// Inbound streams nobody has accepted yet.
    pending_streams: VecDeque<Stream>,
    /// Accept callers waiting for an inbound stream.
    waiting_accepts: VecDeque<oneshot::Sender<Result<Stream>>>,
    pending_close: Vec<oneshot::Sender<()>>,
    /// Unanswered pings, keyed by nonce.
    pending_pings: IntMap<u32, Instant>,
    next_ping_id: u32,
    lost_pings: u32,
    closed: bool,
    cleanup_started: bool,
    keepalive_running: Arc<AtomicBool>,
    dropped_streams: Vec<StreamId>,
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("streams", &self.streams.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<T> fmt::Display for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(Connection {} {:?} (streams {}))", self.id, self.mode, self.streams.len())
    }
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection<T> {
    /// Create a new connection from the given secured I/O resource.
    ///
    /// Spawns the writer and keep-alive tasks; the caller must drive
    /// [`Connection::next_stream`] from exactly one task to make progress.
    pub fn new(socket: T, cfg: Config, mode: Mode) -> Self {
        let id = Id::random();
        log::debug!("new connection: {} ({:?})", id, mode);

        let config = Arc::new(cfg);
        let (read_half, write_half) = socket.split();
        let reader = FrameReader::new(id, read_half, config.initial_window_size as usize);
        let writer = FrameWriter::new(id, write_half);

        let (frame_tx, frame_rx) = mpsc::unbounded();
        let (failure_tx, failure_rx) = oneshot::channel();
        task::spawn(send_loop(id, writer, frame_rx, failure_tx));

        let (control_tx, control_rx) = mpsc::channel(MAX_COMMAND_BACKLOG);
        let (stream_tx, stream_rx) = mpsc::channel(MAX_COMMAND_BACKLOG);

        let keepalive_running = Arc::new(AtomicBool::new(true));
        if config.keepalive_interval > Duration::from_secs(0) {
            task::spawn(keepalive_loop(
                id,
                config.keepalive_interval,
                control_tx.clone(),
                keepalive_running.clone(),
            ));
        }

        Connection {
            id,
            mode,
            config,
            reader,
            frame_tx,
            writer_failure: failure_rx,
            control_tx,
            control_rx,
            stream_tx,
            stream_rx,
            next_id: match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            },
            streams: IntMap::default(),
            pending_open: IntMap::default(),
            pending_streams: VecDeque::new(),
            waiting_accepts: VecDeque::new(),
            pending_close: Vec::new(),
            pending_pings: IntMap::default(),
            next_ping_id: 0,
            lost_pings: 0,
            closed: false,
            cleanup_started: false,
            keepalive_running,
            dropped_streams: Vec::new(),
        }
    }

    /// Get a controller to open and accept streams and to close the
    /// connection. May be cloned freely.
    pub fn control(&self) -> Control {
        Control::new(self.control_tx.clone(), self.config.stream_open_timeout)
    }

    /// Drive the connection until it terminates.
    ///
    /// Returns `Ok(())` once the connection was closed locally; any other
    /// termination yields the error that caused it. After termination every
    /// further call returns [`ConnectionError::Closed`].
    pub async fn next_stream(&mut self) -> Result<()> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let result = self.run().await;
        self.closed = true;
        if let Err(e) = &result {
            if let Some(frame) = goaway_frame(e) {
                self.send_frame(frame.cast())
            }
        }
        self.cleanup();
        match &result {
            Ok(()) => log::debug!("{}: session closed", self.id),
            Err(e) => log::debug!("{}: session terminated: {}", self.id, e),
        }
        result
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            self.garbage_collect();

            let event = {
                let next_frame = self.reader.read_frame().fuse();
                futures::pin_mut!(next_frame);
                futures::select! {
                    command = self.control_rx.next() => Event::Command(command),
                    command = self.stream_rx.next() => Event::Stream(command),
                    frame = next_frame => Event::Frame(frame),
                    error = &mut self.writer_failure => Event::WriterGone(error),
                }
            };

            match event {
                Event::Command(Some(ControlCommand::OpenStream(reply))) => self.on_open_stream(reply),
                Event::Command(Some(ControlCommand::AcceptStream(reply))) => self.on_accept_stream(reply),
                Event::Command(Some(ControlCommand::Close(reply))) => {
                    log::trace!("{}: closing connection", self.id);
                    self.pending_close.push(reply);
                    self.send_frame(Frame::term().cast());
                    return Ok(());
                }
                Event::Command(Some(ControlCommand::Keepalive)) => self.on_keepalive()?,
                Event::Command(None) => return Err(ConnectionError::Closed),
                Event::Stream(Some(command)) => self.on_stream_command(command),
                Event::Stream(None) => return Err(ConnectionError::Closed),
                Event::Frame(Ok(Some(frame))) => self.on_frame(frame)?,
                Event::Frame(Ok(None)) => {
                    log::debug!("{}: remote closed the transport", self.id);
                    return Err(ConnectionError::Closed);
                }
                Event::Frame(Err(e)) => return Err(e.into()),
                Event::WriterGone(Ok(e)) => return Err(ConnectionError::Io(e)),
                Event::WriterGone(Err(_)) => return Err(ConnectionError::Closed),
            }
        }
    }

    fn on_open_stream(&mut self, reply: OpenReply) {
        if self.streams.len() >= self.config.max_streams {
            log::error!("{}: maximum number of streams reached", self.id);
            let _ = reply.send(Err(ConnectionError::TooManyStreams));
            return;
        }
        let id = match self.next_stream_id() {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        // Any window beyond the protocol's implicit initial credit is
        // advertised as a delta together with the SYN.
        let mut syn = Frame::window_update(id, self.config.initial_window_size - DEFAULT_CREDIT);
        syn.header_mut().syn();
        self.send_frame(syn.cast());

        let stream = self.make_stream(id);
        self.streams.insert(id, stream.clone());
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_open.insert(id, ack_tx);
        log::debug!("{}: new outbound {} of {}", self.id, stream, self);

        if reply.send(Ok((stream, ack_rx))).is_err() {
            log::debug!("{}/{}: open_stream caller went away", self.id, id);
            self.pending_open.remove(&id);
            if let Some(s) = self.streams.remove(&id) {
                s.shared().force_reset()
            }
            self.send_frame(Frame::reset_stream(id).cast())
        }
    }

    fn on_accept_stream(&mut self, reply: oneshot::Sender<Result<Stream>>) {
        if let Some(stream) = self.pending_streams.pop_front() {
            let _ = reply.send(Ok(stream));
        } else {
            self.waiting_accepts.push_back(reply)
        }
    }

    fn on_stream_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::SendFrame(frame) => self.send_frame(frame),
            StreamCommand::CloseStream(id) => self.send_frame(Frame::close_stream(id).cast()),
            StreamCommand::ResetStream(id) => {
                self.send_frame(Frame::reset_stream(id).cast());
                self.pending_open.remove(&id);
                self.pending_streams.retain(|s| s.id() != id);
                self.streams.remove(&id);
            }
        }
    }

    fn on_frame(&mut self, frame: Frame<()>) -> Result<()> {
        match frame.header().tag() {
            Tag::Data => self.on_data(frame.into_data()),
            Tag::WindowUpdate => self.on_window_update(frame.into_window_update()),
            Tag::Ping => {
                self.on_ping(frame.into_ping());
                Ok(())
            }
            Tag::GoAway => self.on_go_away(frame.into_go_away()),
        }
    }

    fn on_data(&mut self, frame: Frame<header::Data>) -> Result<()> {
        let stream_id = frame.header().stream_id();
        let flags = frame.header().flags();

        if flags.contains(header::RST) {
            self.on_stream_reset(stream_id);
            return Ok(());
        }
        if flags.contains(header::ACK) {
            self.on_ack(stream_id)
        }
        let is_fin = flags.contains(header::FIN);
        if flags.contains(header::SYN) {
            // Some peers open lazily and carry the SYN on their first data frame.
            return self.on_inbound_stream(stream_id, 0, is_fin, Some(frame));
        }

        if let Some(stream) = self.streams.get(&stream_id) {
            let mut shared = stream.shared();
            if shared.reset {
                // Race with a reset of ours that the remote has not seen yet.
                return Ok(());
            }
            if shared.fin_received {
                log::error!("{}/{}: data after half-close", self.id, stream_id);
                return Err(ConnectionError::Protocol("data frame after half-close"));
            }
            let len = frame.body_len();
            if len > shared.window {
                log::error!("{}/{}: frame body larger than the remaining window", self.id, stream_id);
                return Err(ConnectionError::Protocol("receive window exceeded"));
            }
            shared.window -= len;
            if is_fin {
                shared.fin_received = true
            }
            let body = frame.into_body();
            if !body.is_empty() {
                shared.buffer.push(body)
            }
            if let Some(w) = shared.reader.take() {
                w.wake()
            }
        } else {
            // Possibly frames of a stream dropped or reset on our side that
            // were already in flight; a reset in return would interfere with
            // a new stream reusing nothing here, so stay silent.
            log::trace!("{}/{}: data frame for unknown stream", self.id, stream_id);
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: Frame<WindowUpdate>) -> Result<()> {
        let stream_id = frame.header().stream_id();
        let flags = frame.header().flags();

        if flags.contains(header::RST) {
            self.on_stream_reset(stream_id);
            return Ok(());
        }
        if flags.contains(header::ACK) {
            self.on_ack(stream_id)
        }
        let is_fin = flags.contains(header::FIN);
        if flags.contains(header::SYN) {
            return self.on_inbound_stream(stream_id, frame.header().credit(), is_fin, None);
        }

        if let Some(stream) = self.streams.get(&stream_id) {
            let mut shared = stream.shared();
            if shared.reset {
                return Ok(());
            }
            shared.credit = shared.credit.saturating_add(frame.header().credit());
            if is_fin {
                shared.fin_received = true
            }
            shared.wake_both()
        } else {
            log::trace!("{}/{}: window update for unknown stream", self.id, stream_id);
        }
        Ok(())
    }

    fn on_inbound_stream(
        &mut self,
        id: StreamId,
        extra_credit: u32,
        is_fin: bool,
        first_data: Option<Frame<header::Data>>,
    ) -> Result<()> {
        if !self.is_valid_remote_id(id) {
            log::error!("{}: invalid stream id {} from remote", self.id, id);
            return Err(ConnectionError::Protocol("invalid stream id"));
        }
        if self.streams.contains_key(&id) {
            log::error!("{}/{}: stream already exists", self.id, id);
            return Err(ConnectionError::Protocol("stream id already in use"));
        }
        if self.streams.len() >= self.config.max_streams {
            log::warn!("{}: maximum number of streams reached, refusing {}", self.id, id);
            self.send_frame(Frame::reset_stream(id).cast());
            return Ok(());
        }
        if self.waiting_accepts.is_empty() && self.pending_streams.len() >= ACCEPT_BACKLOG {
            log::warn!("{}: accept backlog is full, refusing {}", self.id, id);
            self.send_frame(Frame::reset_stream(id).cast());
            return Ok(());
        }

        let stream = self.make_stream(id);
        {
            let mut shared = stream.shared();
            shared.credit = shared.credit.saturating_add(extra_credit);
            if let Some(frame) = first_data {
                let len = frame.body_len();
                if len > shared.window {
                    log::error!("{}/{}: first frame body larger than the window", self.id, id);
                    return Err(ConnectionError::Protocol("receive window exceeded"));
                }
                shared.window -= len;
                let body = frame.into_body();
                if !body.is_empty() {
                    shared.buffer.push(body)
                }
            }
            if is_fin {
                shared.fin_received = true
            }
        }

        // Acknowledge with ACK alone; deployed peers reject SYN|ACK. Our
        // extra receive window, if any, rides along as the credit delta.
        let mut ack = Frame::window_update(id, self.config.initial_window_size - DEFAULT_CREDIT);
        ack.header_mut().ack();
        self.send_frame(ack.cast());

        self.streams.insert(id, stream.clone());
        log::debug!("{}: new inbound {} of {}", self.id, stream, self);

        // Hand the stream to a waiting accept directly, if there is one;
        // otherwise it queues until somebody accepts.
        let mut stream = stream;
        while let Some(waiter) = self.waiting_accepts.pop_front() {
            match waiter.send(Ok(stream)) {
                Ok(()) => return Ok(()),
                Err(Ok(s)) => stream = s,
                Err(Err(_)) => return Ok(()),
            }
        }
        self.pending_streams.push_back(stream);
        Ok(())
    }

    fn on_stream_reset(&mut self, id: StreamId) {
        if let Some(tx) = self.pending_open.remove(&id) {
            let _ = tx.send(Err(ConnectionError::StreamReset));
        }
        if let Some(stream) = self.streams.remove(&id) {
            log::debug!("{}/{}: remote reset", self.id, id);
            stream.shared().force_reset()
        }
        self.pending_streams.retain(|s| s.id() != id);
    }

    fn on_ack(&mut self, id: StreamId) {
        if let Some(tx) = self.pending_open.remove(&id) {
            if tx.send(Ok(())).is_err() {
                // The opener stopped waiting; it resets the stream itself.
                log::debug!("{}/{}: ack for an abandoned open", self.id, id);
            }
        }
    }

    fn on_ping(&mut self, frame: Frame<Ping>) {
        let flags = frame.header().flags();
        let nonce = frame.header().nonce();
        if flags.contains(header::ACK) {
            if let Some(sent) = self.pending_pings.remove(&nonce) {
                self.lost_pings = 0;
                log::debug!("{}: ping {} answered in {:?}", self.id, nonce, sent.elapsed());
            }
            return;
        }
        // A request carries SYN or, depending on the peer, no flags at all.
        // Answered via the writer queue without awaiting transmission.
        let mut pong = Frame::ping(nonce);
        pong.header_mut().ack();
        self.send_frame(pong.cast())
    }

    fn on_go_away(&mut self, frame: Frame<GoAway>) -> Result<()> {
        let code = frame.header().reason();
        log::debug!("{}: received go away (code {})", self.id, code);
        match code {
            frame::CODE_TERM => Err(ConnectionError::Closed),
            frame::CODE_PROTOCOL_ERROR | frame::CODE_INTERNAL_ERROR => Err(ConnectionError::RemoteGoAway(code)),
            _ => Err(ConnectionError::Protocol("unknown go away code")),
        }
    }

    fn on_keepalive(&mut self) -> Result<()> {
        let timeout = self.config.ping_timeout;
        let before = self.pending_pings.len();
        self.pending_pings.retain(|_, sent| sent.elapsed() < timeout);
        self.lost_pings += (before - self.pending_pings.len()) as u32;
        if self.lost_pings >= self.config.ping_timeout_threshold {
            log::warn!("{}: {} keep-alive pings lost, terminating", self.id, self.lost_pings);
            return Err(ConnectionError::KeepAliveTimeout);
        }
        let nonce = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending_pings.insert(nonce, Instant::now());
        let mut ping = Frame::ping(nonce);
        ping.header_mut().syn();
        self.send_frame(ping.cast());
        Ok(())
    }

    fn make_stream(&self, id: StreamId) -> Stream {
        Stream::new(
            id,
            self.id,
            self.config.clone(),
            self.config.initial_window_size,
            DEFAULT_CREDIT,
            self.stream_tx.clone(),
        )
    }

    fn next_stream_id(&mut self) -> Result<StreamId> {
        let proposed = StreamId::new(self.next_id);
        self.next_id = self.next_id.checked_add(2).ok_or(ConnectionError::NoMoreStreamIds)?;
        match self.mode {
            Mode::Client => assert!(proposed.is_client()),
            Mode::Server => assert!(proposed.is_server()),
        }
        Ok(proposed)
    }

    // Check that a remote stream id respects the remote's role parity. A
    // remote "responding" with ids of our own parity would be spoofing into
    // our id space, which is a protocol violation, not a recoverable event.
    fn is_valid_remote_id(&self, id: StreamId) -> bool {
        match self.mode {
            Mode::Client => id.is_server(),
            Mode::Server => id.is_client(),
        }
    }

    fn send_frame(&mut self, frame: Frame<()>) {
        if self.frame_tx.unbounded_send(frame).is_err() {
            // The writer is gone; its failure surfaces on the next loop turn.
            log::debug!("{}: writer task is gone, dropping frame", self.id)
        }
    }

    /// Remove streams whose handles were dropped without a proper close,
    /// telling the remote where necessary.
    fn garbage_collect(&mut self) {
        let mut frames = Vec::new();
        for stream in self.streams.values() {
            if stream.strong_count() > 1 {
                continue;
            }
            let id = stream.id();
            log::trace!("{}: removing dropped {}", self.id, stream);
            let mut shared = stream.shared();
            if shared.reset || (shared.fin_sent && shared.fin_received) {
                // Already terminated in both directions.
            } else if shared.fin_received {
                // The remote is done sending; finish our side for good.
                shared.fin_sent = true;
                frames.push(Frame::close_stream(id).cast())
            } else {
                // Dropped while the remote may still send or may be waiting
                // for credit we will never grant.
                shared.force_reset();
                frames.push(Frame::reset_stream(id).cast())
            }
            drop(shared);
            self.dropped_streams.push(id)
        }
        for frame in frames {
            self.send_frame(frame)
        }
        for id in self.dropped_streams.drain(..) {
            self.streams.remove(&id);
        }
    }
}

impl<T> Connection<T> {
    /// Release every waiter and stream and shut the writer down.
    ///
    /// No more frames are sent from here on; the transport is closed by the
    /// writer task once its queue has drained.
    fn cleanup(&mut self) {
        if self.cleanup_started {
            return;
        }
        self.cleanup_started = true;
        log::trace!("{}: cleaning up", self.id);

        self.keepalive_running.store(false, Ordering::Relaxed);

        self.control_rx.close();
        while let Ok(Some(command)) = self.control_rx.try_next() {
            match command {
                ControlCommand::OpenStream(reply) => {
                    let _ = reply.send(Err(ConnectionError::Closed));
                }
                ControlCommand::AcceptStream(reply) => {
                    let _ = reply.send(Err(ConnectionError::Closed));
                }
                ControlCommand::Close(reply) => self.pending_close.push(reply),
                ControlCommand::Keepalive => {}
            }
        }
        self.stream_rx.close();
        while let Ok(Some(_)) = self.stream_rx.try_next() {}

        for (_, tx) in self.pending_open.drain() {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        for tx in self.waiting_accepts.drain(..) {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        self.pending_streams.clear();
        for (id, stream) in self.streams.drain() {
            log::trace!("{}/{}: resetting stream", self.id, id);
            stream.shared().force_reset()
        }
        self.pending_pings.clear();
        for tx in self.pending_close.drain(..) {
            let _ = tx.send(());
        }
        self.frame_tx.close_channel();
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        if !self.cleanup_started {
            log::debug!("{}: connection dropped", self.id);
            self.cleanup()
        }
    }
}

/// Map a terminal error to the go-away frame announcing it, if announcing
/// it still makes sense.
fn goaway_frame(e: &ConnectionError) -> Option<Frame<GoAway>> {
    match e {
        ConnectionError::Protocol(_) => Some(Frame::protocol_error()),
        ConnectionError::Decode(FrameDecodeError::Io(_)) => None,
        ConnectionError::Decode(_) => Some(Frame::protocol_error()),
        // The transport itself failed; a frame would not get through.
        ConnectionError::Io(_) => None,
        ConnectionError::Closed | ConnectionError::RemoteGoAway(_) => None,
        _ => Some(Frame::internal_error()),
    }
}

/// The writer task: the single owner of the transport's sending half.
///
/// One frame is dequeued, written to completion and flushed before the
/// next one is looked at, so record boundaries on the secured transport
/// are a strict serialization of the submissions.
async fn send_loop<T: AsyncWrite + Unpin>(
    id: Id,
    mut io: FrameWriter<WriteHalf<T>>,
    mut queue: mpsc::UnboundedReceiver<Frame<()>>,
    failure: oneshot::Sender<io::Error>,
) {
    while let Some(frame) = queue.next().await {
        if let Err(e) = io.write_frame(&frame).await {
            log::debug!("{}: frame write failed: {}", id, e);
            let _ = failure.send(e);
            return;
        }
    }
    if let Err(e) = io.close().await {
        log::debug!("{}: closing the transport failed: {}", id, e);
    }
    log::trace!("{}: writer task exiting", id)
}

/// The keep-alive task; ticks the dispatch loop every interval.
async fn keepalive_loop(id: Id, interval: Duration, mut sender: mpsc::Sender<ControlCommand>, running: Arc<AtomicBool>) {
    loop {
        task::sleep(interval).await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if sender.send(ControlCommand::Keepalive).await.is_err() {
            break;
        }
    }
    log::trace!("{}: keep-alive task exiting", id)
}
