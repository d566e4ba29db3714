use reqwest::Client;
use std::time::Duration;

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Client for short request/response calls (GraphQL, catalog upserts).
pub fn build_api_client() -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 15);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client for result file downloads. Exports can take far longer than any total
/// request timeout, so only stalls between reads are bounded.
pub fn build_download_client() -> Client {
    let read = env_secs("HTTP_READ_TIMEOUT_SECS", 60);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .read_timeout(Duration::from_secs(read))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
