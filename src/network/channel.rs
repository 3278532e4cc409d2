use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::{ConnectionState, SessionState};
use crate::utils::{Result, WeaveError};

/// Upper bound on one frame's payload. Text messages never come close;
/// anything larger is a peer speaking a different protocol.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Write one `[u32 big-endian length][UTF-8 bytes]` frame.
pub async fn write_frame<W>(stream: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = text.as_bytes();
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(WeaveError::SendFailed(format!(
            "message of {} bytes exceeds the frame limit",
            bytes.len()
        )));
    }

    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame and decode it as UTF-8.
pub async fn read_frame<R>(stream: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WeaveError::StreamError(format!(
            "frame length {} exceeds the limit",
            len
        )));
    }

    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;

    String::from_utf8(buffer)
        .map_err(|e| WeaveError::StreamError(format!("frame is not UTF-8: {}", e)))
}

/// Framed text channel over the most recently attached connection.
///
/// The write half lives behind a mutex, so concurrent `send` calls are
/// serialized and frames never interleave. Each attached socket gets its
/// own receive loop appending to the shared message list.
#[derive(Clone)]
pub struct MessageChannel {
    state: SessionState,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl MessageChannel {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Take ownership of an established socket: its write half becomes the
    /// send target (replacing any previous one) and a receive loop is
    /// spawned on the read half.
    pub async fn attach(&self, stream: TcpStream) -> JoinHandle<()> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        *self.writer.lock().await = Some(writer);

        let state = self.state.clone();
        tokio::spawn(async move {
            Self::receive_loop(reader, state, peer).await;
        })
    }

    /// Drop the send half, shutting the outgoing direction down.
    pub async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Send one message. With no connection attached this fails without
    /// touching the state machine or writing anything; a mid-write error
    /// drops the connection and records the failure.
    pub async fn send(&self, text: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Err(WeaveError::SendFailed("no active connection".to_string())),
        };

        match write_frame(writer, text).await {
            Ok(()) => {
                debug!("Sent message ({} bytes)", text.len());
                Ok(())
            }
            Err(e) => {
                // A half-written frame poisons the stream, so the
                // connection is dropped rather than reused.
                guard.take();
                self.state
                    .set(ConnectionState::Failed(format!("send failed: {}", e)))
                    .await;
                Err(WeaveError::SendFailed(e.to_string()))
            }
        }
    }

    async fn receive_loop(mut reader: OwnedReadHalf, state: SessionState, peer: Option<SocketAddr>) {
        loop {
            match read_frame(&mut reader).await {
                Ok(text) => {
                    debug!("Received message ({} bytes)", text.len());
                    state.push_message(text).await;
                }
                Err(e) => {
                    match peer {
                        Some(peer) => info!("Connection with {} ended: {}", peer, e),
                        None => info!("Connection ended: {}", e),
                    }
                    state
                        .set(ConnectionState::Failed(format!("stream error: {}", e)))
                        .await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_frame_round_trip_preserves_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, "A").await.unwrap();
        write_frame(&mut client, "B").await.unwrap();
        write_frame(&mut client, "C").await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), "A");
        assert_eq!(read_frame(&mut server).await.unwrap(), "B");
        assert_eq!(read_frame(&mut server).await.unwrap(), "C");
    }

    #[tokio::test]
    async fn test_frame_survives_non_ascii() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, "héllo ✓ мир").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), "héllo ✓ мир");
    }

    #[tokio::test]
    async fn test_oversized_length_is_a_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        client
            .write_u32((MAX_FRAME_BYTES + 1) as u32)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, WeaveError::StreamError(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_fails() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        client.write_u32(10).await.unwrap();
        client.write_all(b"only5").await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_send_without_connection_leaves_state_alone() {
        let state = SessionState::new();
        let channel = MessageChannel::new(state.clone());

        let err = channel.send("hello").await.unwrap_err();
        assert!(matches!(err, WeaveError::SendFailed(_)));
        assert_eq!(state.current().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_attached_channel_sends_ordered_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = SessionState::new();
        let channel = MessageChannel::new(state);

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();
        channel.attach(client).await;

        channel.send("A").await.unwrap();
        channel.send("B").await.unwrap();
        channel.send("C").await.unwrap();

        assert_eq!(read_frame(&mut accepted).await.unwrap(), "A");
        assert_eq!(read_frame(&mut accepted).await.unwrap(), "B");
        assert_eq!(read_frame(&mut accepted).await.unwrap(), "C");
    }

    #[tokio::test]
    async fn test_receive_loop_collects_messages_then_fails_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = SessionState::new();
        let channel = MessageChannel::new(state.clone());

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();
        let loop_task = channel.attach(client).await;

        write_frame(&mut accepted, "one").await.unwrap();
        write_frame(&mut accepted, "two").await.unwrap();
        drop(accepted);

        timeout(Duration::from_secs(2), loop_task)
            .await
            .expect("receive loop should end when the peer closes")
            .unwrap();

        assert_eq!(state.messages().await, vec!["one", "two"]);
        assert!(matches!(
            state.current().await,
            ConnectionState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_send_after_peer_vanishes_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = SessionState::new();
        let channel = MessageChannel::new(state.clone());

        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        channel.attach(client).await;
        drop(accepted);

        // the first send may still land in kernel buffers; keep writing
        // until the broken pipe surfaces
        let mut failed = false;
        for _ in 0..20 {
            if channel.send("into the void").await.is_err() {
                failed = true;
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(failed, "send should eventually fail on a dead connection");
        assert!(matches!(state.current().await, ConnectionState::Failed(_)));
    }
}
