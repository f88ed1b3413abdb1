use anyhow::{Context, Result, bail};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

/// A live server-push event stream, decoded into typed events.
///
/// Wraps the receiving half of a channel so mock backends can script
/// streams without any HTTP involved. Dropping the stream closes the
/// channel and stops the reader task on its next send.
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Send + 'static> EventStream<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// Next event, or `None` once the stream has ended (server closed it,
    /// the connection dropped, or the reader task was torn down).
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Open a long-lived GET request and decode its body as one JSON event per
/// line. Lines may be bare JSON or SSE-framed (`data: {...}`); malformed
/// lines are skipped, they do not end the stream.
pub(crate) async fn open_json_stream<T>(
    client: &reqwest::Client,
    url: String,
) -> Result<EventStream<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to open event stream at {url}"))?;

    let status = resp.status();
    if !status.is_success() {
        bail!("event stream request failed with {status} for {url}");
    }

    let (tx, stream) = EventStream::channel(64);
    tokio::spawn(async move {
        let mut body = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "event stream closed");
                    break;
                }
            };
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let Some(event) = decode_line::<T>(&String::from_utf8_lossy(&line)) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    // Receiver dropped; the subscription was torn down.
                    return;
                }
            }
        }
    });

    Ok(stream)
}

/// Decode one line of a push stream. Returns `None` for blanks, comments
/// and lines that fail to parse.
fn decode_line<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let line = raw.trim();
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    match serde_json::from_str::<T>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed event line");
            None
        }
    }
}
