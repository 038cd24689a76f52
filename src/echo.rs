//! The echo routine shared by the async backend.
//!
//! No framing: whatever a read returns is written back verbatim before the
//! next read, until the peer closes its side.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Echo everything read from `stream` back into it until EOF.
///
/// At most `buffer_size` bytes are read per call; message size is not
/// limited. Returns the total number of bytes echoed.
pub async fn echo<S>(stream: &mut S, buffer_size: usize) -> io::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);
    let mut echoed = 0u64;

    loop {
        buffer.clear();
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            // EOF
            stream.flush().await?;
            return Ok(echoed);
        }

        stream.write_all(&buffer).await?;
        echoed += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_echo_in_order() {
        let mut stream = Builder::new()
            .read(b"hello")
            .write(b"hello")
            .read(b"world")
            .write(b"world")
            .build();

        let echoed = echo(&mut stream, 1024).await.unwrap();
        assert_eq!(echoed, 10);
    }

    #[tokio::test]
    async fn test_echo_binary_verbatim() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut stream = Builder::new().read(&payload).write(&payload).build();

        assert_eq!(echo(&mut stream, 4096).await.unwrap(), 256);
    }

    #[tokio::test]
    async fn test_echo_no_delimiter_parsing() {
        let input = b"line one\r\nQUIT\r\n\0partial";
        let mut stream = Builder::new().read(input).write(input).build();

        assert_eq!(echo(&mut stream, 1024).await.unwrap(), input.len() as u64);
    }

    #[tokio::test]
    async fn test_echo_immediate_eof() {
        let mut stream = Builder::new().build();
        assert_eq!(echo(&mut stream, 1024).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_echo_read_error_ends_connection() {
        let mut stream = Builder::new()
            .read(b"ping")
            .write(b"ping")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let err = echo(&mut stream, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_echo_write_error_ends_connection() {
        let mut stream = Builder::new()
            .read(b"ping")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let err = echo(&mut stream, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
