//! Outbound HTTP clients.

use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// A client with a request timeout. If the builder fails the stock client is
/// used, and that client has no timeout, so the fallback is logged.
pub fn client_with_timeout(timeout: Duration, purpose: &str) -> Client {
    match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(
                purpose,
                timeout_ms = timeout.as_millis() as u64,
                error = %e,
                "http client build failed, falling back to a client without timeout"
            );
            Client::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_timeout_applies() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and never answer
        let silent = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = client_with_timeout(Duration::from_millis(200), "test");
        let started = std::time::Instant::now();
        let err = client.get(format!("http://{}/", addr)).send().await.unwrap_err();

        assert!(err.is_timeout(), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
        silent.abort();
    }
}
