// src/protocol/framing.rs
//! TCP message framing.
//!
//! TCP is a byte stream, so each handshake message and each envelope is
//! carried in one length-delimited frame (4-byte big-endian length prefix).

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::constants::MAX_FRAME_SIZE;

/// A framed TCP connection
pub type FramedConnection = Framed<TcpStream, LengthDelimitedCodec>;

/// Write half of a framed connection
pub type FrameSink = SplitSink<FramedConnection, Bytes>;

/// Read half of a framed connection
pub type FrameSource = SplitStream<FramedConnection>;

/// Outcome of waiting for one frame
#[derive(Debug)]
pub enum FrameRead {
    Frame(BytesMut),
    TimedOut,
    Closed,
}

/// Wrap a TCP stream in the relay framing
pub fn frame_connection(stream: TcpStream) -> FramedConnection {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(stream)
}

/// Wait up to `wait` for the next frame.
///
/// A timeout is not an error; receive loops use it to re-check whether
/// they should keep running.
pub async fn next_frame<S>(source: &mut S, wait: Duration) -> io::Result<FrameRead>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    match tokio::time::timeout(wait, source.next()).await {
        Err(_) => Ok(FrameRead::TimedOut),
        Ok(None) => Ok(FrameRead::Closed),
        Ok(Some(Ok(frame))) => Ok(FrameRead::Frame(frame)),
        Ok(Some(Err(e))) => Err(e),
    }
}

/// Send one frame
pub async fn send_frame<S>(sink: &mut S, payload: Vec<u8>) -> io::Result<()>
where
    S: futures::Sink<Bytes, Error = io::Error> + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {} byte limit", payload.len(), MAX_FRAME_SIZE),
        ));
    }
    sink.send(Bytes::from(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (FramedConnection, FramedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (frame_connection(client.unwrap()), frame_connection(server.unwrap().0))
    }

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut a, mut b) = connected_pair().await;

        send_frame(&mut a, b"first\r\n".to_vec()).await.unwrap();
        send_frame(&mut a, b"second".to_vec()).await.unwrap();

        match next_frame(&mut b, Duration::from_secs(2)).await.unwrap() {
            FrameRead::Frame(frame) => assert_eq!(&frame[..], b"first\r\n"),
            other => panic!("unexpected {:?}", other),
        }
        match next_frame(&mut b, Duration::from_secs(2)).await.unwrap() {
            FrameRead::Frame(frame) => assert_eq!(&frame[..], b"second"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_and_close() {
        let (a, mut b) = connected_pair().await;

        assert!(matches!(
            next_frame(&mut b, Duration::from_millis(50)).await.unwrap(),
            FrameRead::TimedOut
        ));

        drop(a);
        assert!(matches!(
            next_frame(&mut b, Duration::from_secs(2)).await.unwrap(),
            FrameRead::Closed
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_refused() {
        let (mut a, _b) = connected_pair().await;
        let result = send_frame(&mut a, vec![0u8; MAX_FRAME_SIZE + 1]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}
