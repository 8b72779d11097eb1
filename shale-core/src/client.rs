use crate::error::{Result, ShaleError};
use crate::key::{self, ObjectKey};
use crate::sink::{ByteSink, CollectSink};
use crate::store::{Capacity, ListMode};
use crate::wire::{
    CompactRequest, ConfigResponse, EndGcRequest, ErrorResponse, GcBeginResponse, ListResponse,
    MarkGcRequest, PutResponse,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Environment variable naming the server to talk to.
pub const SERVER_ENV_VAR: &str = "SHALE_SERVER";

pub const DEFAULT_SERVER_ADDR: &str = "localhost:6001";

/// Objects smaller than this are encoded into their key and never sent to
/// a server.
pub const DEFAULT_MAX_OBJECT_IN_KEY_SIZE: usize = 128;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_micros(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(1);

const PUT_CHUNK_SIZE: usize = 1 << 20;
const LIST_PAGE_SIZE: usize = 10_000;

/// Client for one CAS endpoint (a storage node or a balancer).
///
/// Connections are established lazily; a lost connection is retried with a
/// delay that starts at 500 µs and doubles up to 1 s, resetting on success.
pub struct CasClient {
    http: reqwest::Client,
    addr: String,
    connected: AtomicBool,
    reconnect_delay: Mutex<Duration>,
    max_object_in_key_size: usize,
}

impl CasClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.into(),
            connected: AtomicBool::new(false),
            reconnect_delay: Mutex::new(DEFAULT_RECONNECT_DELAY),
            max_object_in_key_size: DEFAULT_MAX_OBJECT_IN_KEY_SIZE,
        }
    }

    /// Uses `SHALE_SERVER`, falling back to `localhost:6001`.
    pub fn from_env() -> Self {
        let addr =
            std::env::var(SERVER_ENV_VAR).unwrap_or_else(|_| DEFAULT_SERVER_ADDR.to_string());
        Self::new(addr)
    }

    pub fn with_max_object_in_key_size(mut self, limit: usize) -> Self {
        self.max_object_in_key_size = limit;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Waits until the server answers its health probe, backing off between
    /// attempts. Returns immediately once connected.
    pub async fn on_connect(&self) -> Result<()> {
        loop {
            if self.is_connected() || self.try_connect().await.is_ok() {
                return Ok(());
            }
            let delay = self.next_reconnect_delay();
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection attempt, without retries.
    pub async fn try_connect(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            self.connected.store(false, Ordering::Relaxed);
            return Err(ShaleError::Http(format!(
                "health probe failed: {}",
                response.status()
            )));
        }

        self.connected.store(true, Ordering::Relaxed);
        *self.reconnect_delay.lock().expect("delay lock poisoned") = DEFAULT_RECONNECT_DELAY;
        Ok(())
    }

    /// Keeps trying to re-establish a lost connection in the background.
    pub fn spawn_reconnect(self: &std::sync::Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                if client.is_connected() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                if client.try_connect().await.is_err() {
                    let delay = client.next_reconnect_delay();
                    tokio::time::sleep(delay).await;
                } else {
                    tracing::info!("reconnected to backend {}", client.addr);
                }
            }
        });
    }

    fn next_reconnect_delay(&self) -> Duration {
        let mut delay = self.reconnect_delay.lock().expect("delay lock poisoned");
        let current = *delay;
        *delay = (current * 2).min(MAX_RECONNECT_DELAY);
        current
    }

    fn transport_error(&self, error: reqwest::Error) -> ShaleError {
        self.connected.store(false, Ordering::Relaxed);
        ShaleError::Http(error.to_string())
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn error_from_response(response: reqwest::Response) -> ShaleError {
        let status = response.status();
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        if status == reqwest::StatusCode::NOT_FOUND {
            ShaleError::ObjectNotFound(message)
        } else {
            ShaleError::Http(format!("{}: {}", status, message))
        }
    }

    /// Stores `data`, returning its key as text. Objects below the in-key
    /// threshold become `P` keys locally; nothing is sent anywhere.
    pub async fn put(&self, data: &[u8], sync: bool) -> Result<String> {
        if data.len() < self.max_object_in_key_size {
            return Ok(key::inline_key(data));
        }

        let object_key = ObjectKey::digest_of(data);
        self.put_object(object_key, Bytes::copy_from_slice(data), sync)
            .await?;
        Ok(object_key.to_hex())
    }

    /// Uploads `data` under an explicit key, streamed in 1 MiB chunks.
    pub async fn put_object(
        &self,
        object_key: ObjectKey,
        data: Bytes,
        sync: bool,
    ) -> Result<PutResponse> {
        self.on_connect().await?;

        let total = data.len();
        let chunks: Vec<std::io::Result<Bytes>> = (0..total)
            .step_by(PUT_CHUNK_SIZE.max(1))
            .map(|start| Ok(data.slice(start..(start + PUT_CHUNK_SIZE).min(total))))
            .collect();

        let response = self
            .http
            .put(self.url(&format!("/v1/objects/{}?sync={}", object_key.to_hex(), sync)))
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(futures_util::stream::iter(
                chunks,
            )))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|error| self.transport_error(error))
    }

    /// Retrieves the object named by `key_text` into `sink`. `P` keys are
    /// decoded locally without touching the server.
    pub async fn get_stream(&self, key_text: &str, sink: &mut dyn ByteSink) -> Result<()> {
        if key::is_inline_key(key_text) {
            let data = key::decode_inline_key(key_text)?;
            sink.expect_size(data.len() as u64).await?;
            sink.write(Bytes::from(data)).await?;
            return sink.done().await;
        }

        let object_key = ObjectKey::parse(key_text)?;
        self.get_object(object_key, 0, u64::MAX, sink).await
    }

    pub async fn get_object(
        &self,
        object_key: ObjectKey,
        offset: u64,
        size: u64,
        sink: &mut dyn ByteSink,
    ) -> Result<()> {
        self.on_connect().await?;

        let response = self
            .http
            .get(self.url(&format!(
                "/v1/objects/{}?offset={}&size={}",
                object_key.to_hex(),
                offset,
                size
            )))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        if let Some(length) = response.content_length() {
            sink.expect_size(length).await?;
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|error| self.transport_error(error))?;
            sink.write(chunk).await?;
        }
        sink.done().await
    }

    pub async fn get(&self, key_text: &str) -> Result<Vec<u8>> {
        let mut sink = CollectSink::new();
        self.get_stream(key_text, &mut sink).await?;
        Ok(sink.into_bytes())
    }

    pub async fn remove(&self, object_key: ObjectKey) -> Result<()> {
        self.on_connect().await?;

        let response = self
            .http
            .delete(self.url(&format!("/v1/objects/{}", object_key.to_hex())))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    /// One page of the listing; `limit` and `cursor` drive pagination.
    pub async fn list_page(
        &self,
        mode: ListMode,
        min_size: u64,
        max_size: u64,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListResponse> {
        self.on_connect().await?;

        let mode_text = match mode {
            ListMode::Default => "default",
            ListMode::Garbage => "garbage",
        };
        let mut url = self.url(&format!(
            "/v1/objects?mode={}&min_size={}&max_size={}&limit={}",
            mode_text, min_size, max_size, limit
        ));
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={}", cursor));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|error| self.transport_error(error))
    }

    /// Lists every matching object, invoking `callback` per key.
    pub async fn list(
        &self,
        mode: ListMode,
        min_size: u64,
        max_size: u64,
        mut callback: impl FnMut(ObjectKey),
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .list_page(mode, min_size, max_size, cursor.as_deref(), LIST_PAGE_SIZE)
                .await?;
            if page.keys.is_empty() {
                return Ok(());
            }
            for object_key in page.keys {
                callback(object_key);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    pub async fn capacity(&self) -> Result<Capacity> {
        self.on_connect().await?;

        let response = self
            .http
            .get(self.url("/v1/capacity"))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        response
            .json()
            .await
            .map_err(|error| self.transport_error(error))
    }

    pub async fn compact(&self, sync: bool) -> Result<()> {
        self.on_connect().await?;

        let response = self
            .http
            .post(self.url("/v1/compact"))
            .json(&CompactRequest { sync })
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    pub async fn begin_gc(&self) -> Result<u64> {
        self.on_connect().await?;

        let response = self
            .http
            .post(self.url("/v1/gc/begin"))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        let body: GcBeginResponse = response
            .json()
            .await
            .map_err(|error| self.transport_error(error))?;
        Ok(body.id)
    }

    pub async fn mark_gc(&self, keys: &[ObjectKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.on_connect().await?;

        let response = self
            .http
            .post(self.url("/v1/gc/mark"))
            .json(&MarkGcRequest {
                keys: keys.to_vec(),
            })
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    pub async fn end_gc(&self, id: u64) -> Result<()> {
        self.on_connect().await?;

        let response = self
            .http
            .post(self.url("/v1/gc/end"))
            .json(&EndGcRequest { id })
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    /// The repository's consistent-hash buckets.
    pub async fn get_buckets(&self) -> Result<Vec<ObjectKey>> {
        self.on_connect().await?;

        let response = self
            .http
            .get(self.url("/v1/config"))
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        let body: ConfigResponse = response
            .json()
            .await
            .map_err(|error| self.transport_error(error))?;
        Ok(body.buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_objects_inline_into_the_key() {
        // The address is never dialed for in-key objects.
        let client = CasClient::new("localhost:1");

        let key = client.put(b"hello", false).await.unwrap();
        assert!(key.starts_with('P'));

        let data = client.get(&key).await.unwrap();
        assert_eq!(data, b"hello");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn inline_threshold_is_exclusive() {
        let client = CasClient::new("localhost:1").with_max_object_in_key_size(4);

        // Below the threshold: inlined.
        assert!(client.put(b"abc", false).await.unwrap().starts_with('P'));

        let empty = client.put(b"", false).await.unwrap();
        assert_eq!(client.get(&empty).await.unwrap(), b"");
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let client = CasClient::new("localhost:1");

        assert_eq!(client.next_reconnect_delay(), Duration::from_micros(500));
        assert_eq!(client.next_reconnect_delay(), Duration::from_micros(1000));
        assert_eq!(client.next_reconnect_delay(), Duration::from_micros(2000));

        for _ in 0..20 {
            client.next_reconnect_delay();
        }
        assert_eq!(client.next_reconnect_delay(), MAX_RECONNECT_DELAY);
    }
}
