use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retries an async request when it fails to connect
///
/// # Parameters
/// - `operation`: Closure returning a future
/// - `retries`: Number of retry attempts (total runs = 1 initial + retries)
/// - `delay_ms`: Milliseconds between retry attempts
///
/// # Returns
/// Either the successful result or the last error. Timeouts and other
/// failures are returned immediately.
pub async fn with_retry<F, Fut, T>(
    mut operation: F,
    retries: usize,
    delay_ms: u64,
) -> Result<T, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, reqwest::Error>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if attempt > retries || !err.is_connect() {
                    return Err(err);
                }
                debug!(
                    "Attempt {}/{} failed: {}. Retrying...",
                    attempt, retries, err
                );
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_connect_errors_are_retried() {
        let attempts = AtomicUsize::new(0);
        let client = reqwest::Client::new();
        // Nothing listens on port 1
        let result = with_retry(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                client.get("http://127.0.0.1:1/").send()
            },
            2,
            1,
        )
        .await;
        assert!(result.unwrap_err().is_connect());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let attempts = AtomicUsize::new(0);
        let client = reqwest::Client::new();
        let url = server.uri();
        let response = with_retry(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                client.get(&url).send()
            },
            3,
            1,
        )
        .await
        .unwrap();
        assert!(response.status().is_success());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
