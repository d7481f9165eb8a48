//! Webhook transport trait.
//!
//! Abstracts the HTTP POST so delivery, retry and breaker logic can be
//! tested without a network.

use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::{TransportError, TransportResult};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Classification of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// HTTP 200.
    Delivered,
    /// 4xx; retrying will not help.
    Rejected(u16),
    /// 5xx, other statuses, timeouts and connection errors.
    Retryable(String),
}

impl DeliveryOutcome {
    /// Classify a transport result.
    pub fn classify(result: &TransportResult<u16>) -> Self {
        match result {
            Ok(200) => Self::Delivered,
            Ok(status) if (400..500).contains(status) => Self::Rejected(*status),
            Ok(status) => Self::Retryable(format!("HTTP {status}")),
            Err(e) => Self::Retryable(e.to_string()),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// HTTP POST of a JSON body.
pub trait WebhookTransport: Send + Sync {
    /// Post `body` to `url`, returning the response status code.
    fn post<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        timeout: Duration,
    ) -> BoxFuture<'a, TransportResult<u16>>;
}

/// Transport backed by a shared reqwest client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WebhookTransport for ReqwestTransport {
    fn post<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
        timeout: Duration,
    ) -> BoxFuture<'a, TransportResult<u16>> {
        Box::pin(async move {
            let response = self
                .client
                .post(url)
                .timeout(timeout)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout(timeout)
                    } else if e.is_connect() {
                        TransportError::Connection(e.to_string())
                    } else {
                        TransportError::Request(e.to_string())
                    }
                })?;
            Ok(response.status().as_u16())
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockTransport, RecordedPost};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::Value;

    use super::{BoxFuture, WebhookTransport};
    use crate::error::TransportResult;

    /// A post captured by `MockTransport`.
    #[derive(Debug, Clone)]
    pub struct RecordedPost {
        pub url: String,
        pub body: Value,
        pub timeout: Duration,
    }

    /// Mock transport for testing.
    ///
    /// Scripted responses are consumed in order; once exhausted every post
    /// returns the default status.
    #[derive(Debug)]
    pub struct MockTransport {
        posts: Mutex<Vec<RecordedPost>>,
        scripted: Mutex<VecDeque<TransportResult<u16>>>,
        default_status: Mutex<u16>,
        latency: Mutex<Duration>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        /// Create a transport answering 200.
        pub fn new() -> Self {
            Self {
                posts: Mutex::new(Vec::new()),
                scripted: Mutex::new(VecDeque::new()),
                default_status: Mutex::new(200),
                latency: Mutex::new(Duration::ZERO),
            }
        }

        /// Create a transport answering `status` to every post.
        pub fn with_status(status: u16) -> Self {
            let transport = Self::new();
            transport.set_status(status);
            transport
        }

        pub fn set_status(&self, status: u16) {
            *self.default_status.lock() = status;
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock() = latency;
        }

        /// Queue a one-shot response.
        pub fn push_response(&self, result: TransportResult<u16>) {
            self.scripted.lock().push_back(result);
        }

        /// Get all recorded posts.
        pub fn posts(&self) -> Vec<RecordedPost> {
            self.posts.lock().clone()
        }

        pub fn post_count(&self) -> usize {
            self.posts.lock().len()
        }

        /// Recorded bodies whose action is `action`.
        pub fn bodies_for(&self, action: &str) -> Vec<Value> {
            self.posts
                .lock()
                .iter()
                .filter(|p| p.body["action"] == action)
                .map(|p| p.body.clone())
                .collect()
        }

        pub fn clear(&self) {
            self.posts.lock().clear();
        }
    }

    impl WebhookTransport for MockTransport {
        fn post<'a>(
            &'a self,
            url: &'a str,
            body: &'a Value,
            timeout: Duration,
        ) -> BoxFuture<'a, TransportResult<u16>> {
            Box::pin(async move {
                self.posts.lock().push(RecordedPost {
                    url: url.to_string(),
                    body: body.clone(),
                    timeout,
                });
                let latency = *self.latency.lock();
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let scripted = self.scripted.lock().pop_front();
                scripted.unwrap_or_else(|| Ok(*self.default_status.lock()))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_statuses() {
        assert_eq!(DeliveryOutcome::classify(&Ok(200)), DeliveryOutcome::Delivered);
        assert_eq!(
            DeliveryOutcome::classify(&Ok(404)),
            DeliveryOutcome::Rejected(404)
        );
        assert!(DeliveryOutcome::classify(&Ok(503)).is_retryable());
        // Only 200 counts as delivered.
        assert!(DeliveryOutcome::classify(&Ok(204)).is_retryable());
        assert!(DeliveryOutcome::classify(&Err(TransportError::Timeout(
            Duration::from_secs(10)
        )))
        .is_retryable());
    }

    #[tokio::test]
    async fn test_mock_transport_scripted_then_default() {
        let transport = MockTransport::with_status(500);
        transport.push_response(Ok(200));
        let body = serde_json::json!({"action": "buy"});

        let first = transport
            .post("http://hook", &body, Duration::from_secs(1))
            .await;
        let second = transport
            .post("http://hook", &body, Duration::from_secs(1))
            .await;
        assert_eq!(first.unwrap(), 200);
        assert_eq!(second.unwrap(), 500);
        assert_eq!(transport.bodies_for("buy").len(), 2);
    }
}
