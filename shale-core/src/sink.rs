use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Destination for streamed object bytes.
///
/// `expect_size` is an advisory sent before the first `write`; `done` marks
/// a complete, successful transfer. A sink dropped without `done` must treat
/// the transfer as aborted.
#[async_trait]
pub trait ByteSink: Send {
    async fn expect_size(&mut self, _size: u64) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()>;

    async fn done(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accumulates the streamed object into memory.
#[derive(Default)]
pub struct CollectSink {
    buffer: Vec<u8>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[async_trait]
impl ByteSink for CollectSink {
    async fn expect_size(&mut self, size: u64) -> Result<()> {
        self.buffer.reserve(size as usize);
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }
}

/// Streams the object into any async writer.
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for WriterSink<W> {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.writer.write_all(&data).await?;
        Ok(())
    }

    async fn done(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_sink_flushes_on_done() {
        let mut out = Vec::new();
        {
            let mut sink = WriterSink::new(&mut out);
            sink.write(Bytes::from_static(b"abc")).await.unwrap();
            sink.done().await.unwrap();
        }
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn collect_sink_accumulates() {
        let mut sink = CollectSink::new();
        sink.expect_size(10).await.unwrap();
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        sink.done().await.unwrap();
        assert_eq!(sink.into_bytes(), b"hello world");
    }
}
