//! # Connection Wrapper
//!
//! Owns one upgraded duplex stream. All outbound frames for the stream pass
//! through a single queue drained by the read/write loop in [`Connection::run`],
//! so writes reach the wire in the order they were submitted no matter which
//! task produced them. Other components hold an `Arc<ConnectionHandle>` (or a
//! `Weak` to it) to write, inspect counters, or close.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{Decoded, Frame, FrameCodec, Opcode};
use super::message::Message;
use crate::error::ProtocolError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared face of a live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    remote_address: Option<SocketAddr>,
    codec: FrameCodec,
    upgraded: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    pub fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::Release);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queues `message` as one text frame.
    pub fn write(&self, message: &Message) -> Result<(), ProtocolError> {
        self.write_text(&message.to_json())
    }

    /// Queues `text` as one text frame. An oversized payload is refused here,
    /// before anything is queued.
    pub fn write_text(&self, text: &str) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let frame = self.codec.encode(text.as_bytes(), Opcode::Text)?;
        self.outbound.send(frame).map_err(|_| ProtocolError::Closed)
    }

    /// Asks the loop to flush what is queued and shut the stream down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Short human-readable description for logs.
    pub fn details(&self) -> String {
        let peer = self
            .remote_address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown peer".to_string());
        format!(
            "#{} {} (upgraded: {}, read: {}B, written: {}B)",
            self.id,
            peer,
            self.is_upgraded(),
            self.bytes_read(),
            self.bytes_written()
        )
    }
}

/// The owned half of a connection: the stream and the outbound queue.
pub struct Connection<S> {
    stream: S,
    handle: Arc<ConnectionHandle>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote_address: Option<SocketAddr>, codec: FrameCodec) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_address,
            codec,
            upgraded: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            outbound: tx,
            closed: CancellationToken::new(),
        });
        Self {
            stream,
            handle,
            outbound: rx,
        }
    }

    pub fn handle(&self) -> Arc<ConnectionHandle> {
        Arc::clone(&self.handle)
    }

    /// Drives the connection until the peer closes, a close frame arrives,
    /// the handle is closed, or the transport fails.
    ///
    /// `on_frame` sees every text and binary frame in arrival order. Frames
    /// over the ceiling are logged and their payload skipped; the connection
    /// stays open.
    pub async fn run<F, Fut>(self, mut on_frame: F) -> Result<(), ProtocolError>
    where
        F: FnMut(Frame) -> Fut,
        Fut: Future<Output = ()>,
    {
        let Connection {
            stream,
            handle,
            mut outbound,
        } = self;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut discard: u64 = 0;

        let result = 'io: loop {
            tokio::select! {
                _ = handle.closed.cancelled() => {
                    debug!("Connection {} closed locally", handle.id);
                    break 'io Ok(());
                }
                Some(frame) = outbound.recv() => {
                    if let Err(e) = writer.write_all(&frame).await {
                        break 'io Err(ProtocolError::Io(e));
                    }
                    handle.bytes_written.fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!("Connection {} ended by peer", handle.id);
                            break 'io Ok(());
                        }
                        Ok(n) => {
                            handle.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) => break 'io Err(ProtocolError::Io(e)),
                    }

                    loop {
                        if discard > 0 {
                            let skip = discard.min(buf.len() as u64);
                            buf.advance(skip as usize);
                            discard -= skip;
                            if discard > 0 {
                                break;
                            }
                        }

                        let Some((decoded, used)) = handle.codec.decode(&buf) else {
                            break;
                        };
                        buf.advance(used);

                        match decoded {
                            Decoded::Frame(frame) => on_frame(frame).await,
                            Decoded::Close => {
                                info!("Connection {} received close", handle.id);
                                break 'io Ok(());
                            }
                            Decoded::Skipped => {}
                            Decoded::Oversized { payload_length } => {
                                let err = ProtocolError::PayloadTooLarge {
                                    size: payload_length,
                                    max: handle.codec.max_message_length(),
                                };
                                warn!("Connection {}: {}; discarding", handle.id, err);
                                discard = payload_length;
                            }
                        }
                    }
                }
            }
        };

        handle.closed.cancel();
        while let Ok(frame) = outbound.try_recv() {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
            handle.bytes_written.fetch_add(frame.len() as u64, Ordering::Relaxed);
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Connection {} shutdown: {}", handle.id, e);
        }
        info!("Connection closed: {}", handle.details());

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    const KEY: [u8; 4] = [9, 8, 7, 6];

    async fn read_one_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Frame {
        let codec = FrameCodec::default();
        let mut buf = Vec::new();
        loop {
            if let Some((Decoded::Frame(frame), _)) = codec.decode(&buf) {
                return frame;
            }
            let mut chunk = [0u8; 1024];
            let n = reader.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream ended before a frame arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_frames_are_delivered_until_close() {
        let (server, mut client) = duplex(64 * 1024);
        let connection = Connection::new(server, None, FrameCodec::default());
        let handle = connection.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let task = tokio::spawn(connection.run(move |frame| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(frame.text().unwrap_or_default().to_string());
            }
        }));

        let codec = FrameCodec::default();
        let mut bytes = codec.encode_masked(b"first", Opcode::Text, KEY).unwrap();
        bytes.extend(codec.encode_masked(b"ping", Opcode::Ping, KEY).unwrap());
        bytes.extend(codec.encode_masked(b"second", Opcode::Text, KEY).unwrap());
        bytes.extend(codec.encode_masked(&[], Opcode::Close, KEY).unwrap());
        client.write_all(&bytes).await.unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(handle.bytes_read(), bytes.len() as u64);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_writes_reach_the_peer_as_text_frames() {
        let (server, mut client) = duplex(64 * 1024);
        let connection = Connection::new(server, None, FrameCodec::default());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run(|_| async {}));

        handle
            .write(&Message::async_error("first"))
            .unwrap();
        handle.write_text("second").unwrap();

        let frame = read_one_frame(&mut client).await;
        let value: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(value["Value"], json!("first"));
        assert!(!frame.masked);

        handle.close();
        task.await.unwrap().unwrap();
        assert!(handle.bytes_written() > 0);
        assert!(matches!(handle.write_text("late"), Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_write_is_refused_without_queueing() {
        let (server, _client) = duplex(1024);
        let connection = Connection::new(server, None, FrameCodec::new(8));
        let handle = connection.handle();
        let err = handle.write_text("this is longer than eight").unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { max: 8, .. }));
        assert_eq!(handle.bytes_written(), 0);
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_is_skipped() {
        let (server, mut client) = duplex(64 * 1024);
        let connection = Connection::new(server, None, FrameCodec::new(16));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let task = tokio::spawn(connection.run(move |frame| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(frame.payload);
            }
        }));

        let big = FrameCodec::new(1024);
        let mut bytes = big.encode_masked(&[b'x'; 200], Opcode::Text, KEY).unwrap();
        bytes.extend(big.encode_masked(b"small", Opcode::Text, KEY).unwrap());
        client.write_all(&bytes).await.unwrap();
        drop(client);

        task.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![b"small".to_vec()]);
    }
}
