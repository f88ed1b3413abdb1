use std::path::PathBuf;
use std::time::Duration;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the backend AI service.
    pub backend_url: String,
    /// Directory for client-side state (cached runtime descriptors).
    pub data_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Applied to plain request/response calls, never to event streams.
    pub request_timeout: Duration,
    /// Registry polls after a stop request before giving up.
    pub stop_poll_attempts: u32,
    pub stop_poll_interval: Duration,
    /// Backoff before the single workflow-stream reconnection attempt.
    pub workflow_reconnect_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("SLIDEFLOW_BACKEND_URL").ok().as_deref(),
            std::env::var("SLIDEFLOW_DATA_DIR").ok().as_deref(),
            std::env::var("SLIDEFLOW_REQUEST_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("SLIDEFLOW_STOP_POLL_ATTEMPTS").ok().as_deref(),
            std::env::var("SLIDEFLOW_STOP_POLL_INTERVAL_MS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        backend_url: Option<&str>,
        data_dir: Option<&str>,
        request_timeout_secs: Option<&str>,
        stop_poll_attempts: Option<&str>,
        stop_poll_interval_ms: Option<&str>,
    ) -> Self {
        let backend_url = backend_url
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());

        let data_dir = data_dir
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let request_timeout = request_timeout_secs
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        let stop_poll_attempts = stop_poll_attempts
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);

        let stop_poll_interval = stop_poll_interval_ms
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(400));

        Config {
            backend_url,
            data_dir,
            connect_timeout: Duration::from_secs(10),
            request_timeout,
            stop_poll_attempts,
            stop_poll_interval,
            workflow_reconnect_backoff: Duration::from_secs(2),
        }
    }

    pub fn descriptor_cache_path(&self) -> PathBuf {
        self.data_dir.join("descriptors.yaml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".slideflow")
}
