//! Line-delimited TCP message bus.
//!
//! Each line on a connection is one raw payload. The subscriber hands it to a
//! [`MessageHandler`] and moves on: there is no acknowledgement, no retry and
//! no redelivery. Lines on one connection are handled in arrival order;
//! separate connections are handled concurrently.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::OrderService;
use crate::store::OrderStore;

/// Receives raw payloads delivered by the bus. Runs on a blocking thread.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, payload: &[u8]);
}

impl<S: OrderStore + 'static> MessageHandler for OrderService<S> {
    fn handle(&self, payload: &[u8]) {
        if let Err(e) = self.handle_message(payload) {
            debug!(error = %e, "message dropped");
        }
    }
}

// ── Subscriber ──

/// Default upper bound on one payload, excluding the line terminator.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Accepts publisher connections and dispatches every received line.
pub struct BusSubscriber<H> {
    listener: TcpListener,
    handler: Arc<H>,
    shutdown: CancellationToken,
    max_message_bytes: usize,
}

impl<H: MessageHandler> BusSubscriber<H> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind message bus listener")?;
        Ok(Self {
            listener,
            handler,
            shutdown,
            max_message_bytes: MAX_MESSAGE_BYTES,
        })
    }

    /// Lines longer than `max` bytes are logged and skipped.
    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown token is cancelled, then wait for open
    /// connections to finish the message they are handling.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "message bus listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "publisher connected");
                        connections.spawn(read_messages(
                            stream,
                            peer,
                            Arc::clone(&self.handler),
                            self.shutdown.clone(),
                            self.max_message_bytes,
                        ));
                    }
                    Err(e) => warn!(error = %e, "failed to accept bus connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "bus connection task failed");
                    }
                }
            }
        }

        while connections.join_next().await.is_some() {}
        info!("message bus stopped");
        Ok(())
    }
}

async fn read_messages<H: MessageHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    shutdown: CancellationToken,
    max_message_bytes: usize,
) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = read_line_capped(&mut reader, &mut line, max_message_bytes) => read,
        };

        match read {
            Ok(Line::Eof) => break,
            Ok(Line::Oversized) => {
                warn!(%peer, max_bytes = max_message_bytes, "skipping oversized bus message");
            }
            Ok(Line::Message) => {
                let payload = trim_line(&line);
                if payload.is_empty() {
                    continue;
                }
                let payload = payload.to_vec();
                let handler = Arc::clone(&handler);
                if let Err(e) = tokio::task::spawn_blocking(move || handler.handle(&payload)).await
                {
                    warn!(%peer, error = %e, "message handler panicked");
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "bus connection read failed");
                break;
            }
        }
    }
    debug!(%peer, "publisher disconnected");
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Message,
    Oversized,
    Eof,
}

/// Read one line into `line`, buffering at most `max` payload bytes.
///
/// An oversized line is drained up to and including its newline without
/// being buffered.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Line> {
    // Room for the payload plus "\r\n".
    let limit = max as u64 + 2;
    let read = (&mut *reader).take(limit).read_until(b'\n', line).await?;
    if read == 0 {
        return Ok(Line::Eof);
    }
    if line.ends_with(b"\n") {
        return Ok(if trim_line(line).len() > max {
            Line::Oversized
        } else {
            Line::Message
        });
    }
    if (read as u64) < limit {
        // Final line without a terminator.
        return Ok(if line.len() > max {
            Line::Oversized
        } else {
            Line::Message
        });
    }

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(Line::Oversized);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(Line::Oversized);
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

// ── Publisher ──

/// Client side of the bus: writes one payload per line.
pub struct BusPublisher {
    writer: BufWriter<TcpStream>,
}

impl BusPublisher {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to message bus")?;
        Ok(Self {
            writer: BufWriter::new(stream),
        })
    }

    /// Send one payload. Payloads must not contain a newline.
    pub async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        anyhow::ensure!(
            !payload.contains(&b'\n'),
            "bus payload must not contain a newline"
        );
        self.writer.write_all(payload).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await.context("failed to publish message")?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, payload: &[u8]) {
            self.payloads.lock().push(payload.to_vec());
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.payloads.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages not delivered in time");
    }

    #[test]
    fn test_trim_line() {
        assert_eq!(trim_line(b"abc\n"), b"abc");
        assert_eq!(trim_line(b"abc\r\n"), b"abc");
        assert_eq!(trim_line(b"abc"), b"abc");
        assert_eq!(trim_line(b"\n"), b"");
    }

    async fn read_all(input: &[u8], max: usize) -> Vec<(Line, Vec<u8>)> {
        let mut reader = input;
        let mut out = Vec::new();
        loop {
            let mut line = Vec::new();
            match read_line_capped(&mut reader, &mut line, max).await.unwrap() {
                Line::Eof => return out,
                kind => out.push((kind, trim_line(&line).to_vec())),
            }
        }
    }

    #[tokio::test]
    async fn test_read_line_capped_skips_only_long_lines() {
        let lines = read_all(b"ok\r\n0123456789abc\nfine\nexact\ntail", 5).await;
        let kinds: Vec<&Line> = lines.iter().map(|(kind, _)| kind).collect();
        assert_eq!(
            kinds,
            vec![
                &Line::Message,
                &Line::Oversized,
                &Line::Message,
                &Line::Message,
                &Line::Message
            ]
        );
        assert_eq!(lines[0].1, b"ok");
        assert_eq!(lines[2].1, b"fine");
        assert_eq!(lines[3].1, b"exact");
        assert_eq!(lines[4].1, b"tail");
    }

    #[tokio::test]
    async fn test_read_line_capped_unterminated_long_tail() {
        let lines = read_all(b"ok\n0123456789", 5).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].0, Line::Oversized);
    }

    #[tokio::test]
    async fn test_oversized_message_skipped_and_connection_kept() {
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let subscriber = BusSubscriber::bind("127.0.0.1:0", Arc::clone(&recorder), shutdown.clone())
            .await
            .unwrap()
            .with_max_message_bytes(16);
        let addr = subscriber.local_addr().unwrap();
        let server = tokio::spawn(subscriber.run());

        let mut publisher = BusPublisher::connect(addr).await.unwrap();
        publisher.publish(&[b'x'; 4096]).await.unwrap();
        publisher.publish(b"after").await.unwrap();
        wait_for(&recorder, 1).await;

        assert_eq!(*recorder.payloads.lock(), vec![b"after".to_vec()]);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_delivers_lines_in_order() {
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let subscriber = BusSubscriber::bind("127.0.0.1:0", Arc::clone(&recorder), shutdown.clone())
            .await
            .unwrap();
        let addr = subscriber.local_addr().unwrap();
        let server = tokio::spawn(subscriber.run());

        let mut publisher = BusPublisher::connect(addr).await.unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            publisher.publish(payload).await.unwrap();
        }
        wait_for(&recorder, 3).await;

        assert_eq!(
            *recorder.payloads.lock(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_multiple_publishers() {
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let subscriber = BusSubscriber::bind("127.0.0.1:0", Arc::clone(&recorder), shutdown.clone())
            .await
            .unwrap();
        let addr = subscriber.local_addr().unwrap();
        let server = tokio::spawn(subscriber.run());

        let mut a = BusPublisher::connect(addr).await.unwrap();
        let mut b = BusPublisher::connect(addr).await.unwrap();
        a.publish(b"from-a").await.unwrap();
        b.publish(b"from-b").await.unwrap();
        a.close().await.unwrap();
        wait_for(&recorder, 2).await;

        let mut got = recorder.payloads.lock().clone();
        got.sort();
        assert_eq!(got, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_rejects_embedded_newline() {
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let subscriber = BusSubscriber::bind("127.0.0.1:0", recorder, shutdown.clone())
            .await
            .unwrap();
        let addr = subscriber.local_addr().unwrap();
        let server = tokio::spawn(subscriber.run());

        let mut publisher = BusPublisher::connect(addr).await.unwrap();
        assert!(publisher.publish(b"two\nlines").await.is_err());

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_without_connections() {
        let shutdown = CancellationToken::new();
        let subscriber =
            BusSubscriber::bind("127.0.0.1:0", Arc::new(Recorder::default()), shutdown.clone())
                .await
                .unwrap();
        let server = tokio::spawn(subscriber.run());
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
