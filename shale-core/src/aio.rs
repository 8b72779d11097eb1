use crate::error::{Result, ShaleError};
use bytes::Bytes;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Default number of I/O worker threads per service.
pub const DEFAULT_IO_WORKERS: usize = 4;

enum IoRequest {
    Pread {
        file: Arc<File>,
        offset: u64,
        len: usize,
        reply: oneshot::Sender<std::io::Result<Bytes>>,
    },
    Pwrite {
        file: Arc<File>,
        offset: u64,
        data: Bytes,
        reply: oneshot::Sender<std::io::Result<()>>,
    },
    Fsync {
        file: Arc<File>,
        reply: oneshot::Sender<std::io::Result<()>>,
    },
}

/// Positioned reads, positioned writes, and fsync as awaitable operations.
///
/// Requests are queued to a small pool of dedicated threads; each completion
/// is posted back through a per-request channel the submitting task awaits.
/// A worker always finishes the kernel operation it started, so dropping the
/// awaiting future never frees a buffer the kernel is still writing into;
/// the orphaned completion is simply discarded.
#[derive(Clone)]
pub struct DiskIo {
    queue: mpsc::UnboundedSender<IoRequest>,
}

impl DiskIo {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<IoRequest>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            std::thread::spawn(move || {
                loop {
                    let request = {
                        let mut rx = rx.lock().expect("i/o queue poisoned");
                        rx.blocking_recv()
                    };
                    match request {
                        Some(request) => serve(request),
                        None => break,
                    }
                }
            });
        }

        Self { queue: tx }
    }

    pub async fn pread(&self, file: Arc<File>, offset: u64, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let (reply, response) = oneshot::channel();
        self.submit(IoRequest::Pread {
            file,
            offset,
            len,
            reply,
        })?;
        Ok(Self::complete(response).await??)
    }

    pub async fn pwrite(&self, file: Arc<File>, offset: u64, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (reply, response) = oneshot::channel();
        self.submit(IoRequest::Pwrite {
            file,
            offset,
            data,
            reply,
        })?;
        Ok(Self::complete(response).await??)
    }

    pub async fn fsync(&self, file: Arc<File>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.submit(IoRequest::Fsync { file, reply })?;
        Ok(Self::complete(response).await??)
    }

    fn submit(&self, request: IoRequest) -> Result<()> {
        self.queue
            .send(request)
            .map_err(|_| ShaleError::Internal("disk i/o service stopped".to_string()))
    }

    async fn complete<T>(response: oneshot::Receiver<T>) -> Result<T> {
        response
            .await
            .map_err(|_| ShaleError::Internal("disk i/o worker exited".to_string()))
    }
}

fn serve(request: IoRequest) {
    match request {
        IoRequest::Pread {
            file,
            offset,
            len,
            reply,
        } => {
            let mut buffer = vec![0u8; len];
            let result = file
                .read_exact_at(&mut buffer, offset)
                .map(|()| Bytes::from(buffer));
            let _ = reply.send(result);
        }
        IoRequest::Pwrite {
            file,
            offset,
            data,
            reply,
        } => {
            let _ = reply.send(file.write_all_at(&data, offset));
        }
        IoRequest::Fsync { file, reply } => {
            let _ = reply.send(file.sync_data());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn pread_returns_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"0123456789").unwrap();

        let aio = DiskIo::new(2);
        let file = Arc::new(File::open(&path).unwrap());

        let chunk = aio.pread(file.clone(), 2, 5).await.unwrap();
        assert_eq!(&chunk[..], b"23456");

        let empty = aio.pread(file, 0, 0).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn pread_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"short").unwrap();

        let aio = DiskIo::new(1);
        let file = Arc::new(File::open(&path).unwrap());
        assert!(aio.pread(file, 0, 100).await.is_err());
    }

    #[tokio::test]
    async fn pwrite_then_fsync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"..........").unwrap();

        let aio = DiskIo::new(1);
        let file = Arc::new(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap(),
        );

        aio.pwrite(file.clone(), 3, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        aio.fsync(file).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"...abc....");
    }
}
