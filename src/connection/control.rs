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

use crate::connection::{stream::Stream, ControlCommand};
use crate::error::ConnectionError;
use crate::Result;
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use std::time::Duration;

/// A handle to a [`crate::Connection`].
///
/// May be cloned; every clone talks to the same connection.
#[derive(Clone)]
pub struct Control {
    sender: mpsc::Sender<ControlCommand>,
    open_timeout: Duration,
}

impl Control {
    pub(crate) fn new(sender: mpsc::Sender<ControlCommand>, open_timeout: Duration) -> Self {
        Control { sender, open_timeout }
    }

    /// Open a new stream to the remote.
    ///
    /// Resolves once the remote has acknowledged the stream. If it fails to
    /// do so within the configured timeout, the half-opened stream is reset
    /// and [`ConnectionError::StreamOpenTimeout`] is returned.
    pub async fn open_stream(&mut self) -> Result<Stream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ControlCommand::OpenStream(reply_tx))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        let (mut stream, ack) = reply_rx.await??;
        match async_std::future::timeout(self.open_timeout, ack).await {
            Ok(Ok(Ok(()))) => {
                log::trace!("{}: remote acknowledged", stream);
                Ok(stream)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(oneshot::Canceled)) => Err(ConnectionError::Closed),
            Err(_) => {
                log::debug!("{}: open timed out", stream);
                stream.reset().await;
                Err(ConnectionError::StreamOpenTimeout)
            }
        }
    }

    /// Accept the next stream opened by the remote.
    pub async fn accept_stream(&mut self) -> Result<Stream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ControlCommand::AcceptStream(reply_tx))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        reply_rx.await?
    }

    /// Close the connection.
    ///
    /// Idempotent: closing an already closed connection succeeds.
    pub async fn close(&mut self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send(ControlCommand::Close(reply_tx)).await.is_err() {
            // Already closed.
            return Ok(());
        }
        // A dropped reply also means the connection is gone by now.
        let _ = reply_rx.await;
        Ok(())
    }
}
