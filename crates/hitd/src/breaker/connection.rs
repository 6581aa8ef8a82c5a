//! Viewer connections.
//!
//! A connection is split in two:
//! - the read side stays with the owner of [`ViewerConnection`] and is
//!   framed by a length-limited `LinesCodec`
//! - the write side is owned by a pump task that drains the connection's
//!   bounded outbox, so a stalled peer only ever blocks its own pump

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pool::Registry;
use super::sink::{report, BreakerFailure, ErrorSink};
use super::{Breaker, ConnectionError, ConnectionId, Message};

/// A viewer's live channel.
///
/// Reads go through [`next_frame`](Self::next_frame); writes (replies and
/// broadcasts alike) go through the outbox in FIFO order. Once closed, the
/// connection is never read from again.
pub struct ViewerConnection<R> {
    id: ConnectionId,
    frames: FramedRead<R, LinesCodec>,

    /// `None` once the connection has been finished
    outbox: Option<mpsc::Sender<Message>>,

    token: CancellationToken,
    breaker: Breaker,
    pump: Option<JoinHandle<()>>,
    max_read: usize,
    write_timeout: Duration,
}

impl<R> ViewerConnection<R>
where
    R: AsyncRead + Unpin,
{
    pub(super) fn open<W>(
        breaker: Breaker,
        id: ConnectionId,
        reader: R,
        writer: W,
        token: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let config = breaker.config();
        let max_read = config.max_read_bytes;
        let write_timeout = config.write_timeout;
        let (outbox, rx) = mpsc::channel(config.outbox_capacity);

        let pump = tokio::spawn(pump(
            id,
            writer,
            rx,
            token.clone(),
            breaker.registry(),
            breaker.sink(),
            write_timeout,
        ));

        Self {
            id,
            frames: FramedRead::new(reader, LinesCodec::new_with_max_length(max_read)),
            outbox: Some(outbox),
            token,
            breaker,
            pump: Some(pump),
            max_read,
            write_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_none() || self.token.is_cancelled()
    }

    pub(super) fn outbox(&self) -> Option<&mpsc::Sender<Message>> {
        self.outbox.as_ref()
    }

    pub(super) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Reads the next newline-delimited frame.
    ///
    /// # Errors
    ///
    /// - `Violation` if the frame is over the read limit; the connection is
    ///   closed and unregistered before this returns
    /// - `Io` on a read error; the connection is closed as well
    /// - `Eof` when the peer closes its end
    /// - `Closed` if the connection was closed locally
    ///
    /// `Violation` and `Io` are also reported to the breaker's error sink.
    pub async fn next_frame(&mut self) -> Result<String, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let frame = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(ConnectionError::Closed),
            frame = self.frames.next() => frame,
        };

        match frame {
            Some(Ok(line)) => Ok(line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(
                    connection = %self.id,
                    max = self.max_read,
                    "Inbound frame too large, closing connection"
                );
                self.fail(ConnectionError::Violation { max: self.max_read }).await
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(connection = %self.id, error = %e, "Read from viewer failed");
                self.fail(ConnectionError::Io(e.to_string())).await
            }
            None => Err(ConnectionError::Eof),
        }
    }

    /// Queues `message` for this connection only.
    ///
    /// Waits for outbox space; the pump's write timeout bounds the wait.
    pub async fn send(&self, message: impl Into<Message>) -> Result<(), ConnectionError> {
        let Some(outbox) = self.outbox.as_ref() else {
            return Err(ConnectionError::Closed);
        };
        if self.token.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        outbox
            .send(message.into())
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn fail(&mut self, error: ConnectionError) -> Result<String, ConnectionError> {
        self.close().await;
        self.breaker.report(BreakerFailure::Connection {
            id: self.id,
            error: error.clone(),
        });
        Err(error)
    }

    /// Closes the connection immediately. Queued output is discarded.
    pub async fn close(&mut self) {
        self.token.cancel();
        self.breaker.unregister(self.id).await;
    }

    /// Unregisters, flushes queued output and closes the write side.
    pub async fn finish(mut self) {
        self.breaker.unregister(self.id).await;

        // The pump sees the end of the outbox once our sender is gone
        self.outbox = None;

        if let Some(pump) = self.pump.take() {
            match timeout(self.write_timeout, pump).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(connection = %self.id, error = %e, "Writer pump ended abnormally"),
                Err(_) => debug!(connection = %self.id, "Writer pump did not drain in time"),
            }
        }
    }
}

impl<R> Drop for ViewerConnection<R> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Writes outbox messages to the peer until the connection closes.
///
/// On exit the connection is removed from the registry and the write side is
/// shut down. A failed write is reported to `sink` unless the connection had
/// already been closed.
async fn pump<W>(
    id: ConnectionId,
    writer: W,
    mut outbox: mpsc::Receiver<Message>,
    token: CancellationToken,
    registry: Registry,
    sink: Arc<dyn ErrorSink>,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            message = outbox.recv() => message,
        };

        let Some(message) = next else {
            break;
        };

        if let Err(e) = write_line(&mut writer, &message, write_timeout).await {
            debug!(connection = %id, error = %e, "Write to viewer failed");
            if !token.is_cancelled() {
                token.cancel();
                report(sink.as_ref(), BreakerFailure::Connection { id, error: e });
            }
            break;
        }
    }

    if registry.write().await.remove(&id).is_some() {
        debug!(connection = %id, "Removed closed connection");
    }

    if timeout(write_timeout, writer.shutdown()).await.is_err() {
        debug!(connection = %id, "Timed out shutting down viewer writer");
    }
}

async fn write_line<W>(
    writer: &mut BufWriter<W>,
    line: &str,
    write_timeout: Duration,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(write_timeout, async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}
