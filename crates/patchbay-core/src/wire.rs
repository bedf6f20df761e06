//! Length-prefixed frame I/O.
//!
//! Each frame is sent as a `u32 LE` body length followed by the body (see
//! [`crate::frame`] for the body layout). EOF on the length prefix is a
//! clean close; EOF anywhere else is an I/O error.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Frame, TransportError, WireError};

/// Upper bound on a frame body; larger frames tear the connection down.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut body = BytesMut::new();
    frame.encode(&mut body);

    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Io(e)
        }
    })?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Frame::decode(Bytes::from(body))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn frame_survives_the_socket() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let frame = Frame::Request {
            server_id: 2,
            method: 11,
            seq: 77,
            args: Bytes::from_static(b"payload"),
        };
        write_frame(&mut a, &frame).await.unwrap();

        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn eof_on_boundary_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Wire(WireError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn frames_preserve_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for seq in 1..=3u32 {
            let frame = Frame::SignalRegisterAck {
                seq,
                handler_id: seq * 10,
            };
            write_frame(&mut a, &frame).await.unwrap();
        }
        for seq in 1..=3u32 {
            match read_frame(&mut b).await.unwrap() {
                Frame::SignalRegisterAck {
                    seq: got,
                    handler_id,
                } => {
                    assert_eq!(got, seq);
                    assert_eq!(handler_id, seq * 10);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }
}
