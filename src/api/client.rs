//! HTTP client with retry logic for controller communication

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, warn};

use super::errors::{ApiError, ApiResult};
use super::types::*;
use crate::config::RemoteConfiguration;
use crate::storage::SecretStore;

/// Maximum number of attempts per request
const MAX_ATTEMPTS: u32 = 5;

/// Wall-clock budget across all attempts of one request
const RETRY_BUDGET: Duration = Duration::from_secs(60);

/// Base delay between retries (exponentially increased)
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// HTTP client for communicating with the central controller
pub struct ControllerClient {
    client: Client,
    base_url: String,
    header_name: String,
    secret: RwLock<Option<String>>,
    secrets: SecretStore,
}

impl ControllerClient {
    /// Create a new client; picks up a previously stored agent secret.
    pub fn new(config: &RemoteConfiguration, secrets: &SecretStore) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ApiError::Request)?;

        let base_url = config.url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        let secret = secrets.get_agent_secret()?;

        Ok(Self {
            client,
            base_url,
            header_name: config.header_name.clone(),
            secret: RwLock::new(secret),
            secrets: secrets.clone(),
        })
    }

    /// Whether registration completed (a secret is attached)
    pub fn is_initialized(&self) -> bool {
        self.secret.read().is_some()
    }

    fn require_initialized(&self) -> ApiResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ApiError::NotInitialized)
        }
    }

    /// Build a full URL from a path
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request with automatic retry, returning the raw response.
    ///
    /// Retries any transport error or non-2xx status until the attempt
    /// count or the wall-clock budget runs out, whichever first.
    async fn send_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> ApiResult<Response> {
        let url = self.url(path);
        let started = Instant::now();
        let mut last_error: Option<ApiError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = calculate_backoff(attempt);
                if started.elapsed() + delay >= RETRY_BUDGET {
                    break;
                }
                debug!(
                    "Retrying request to {} (attempt {}/{}), waiting {:?}",
                    path,
                    attempt + 1,
                    MAX_ATTEMPTS,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Accept", "application/json");

            if let Some(secret) = self.secret.read().clone() {
                request = request.header(&self.header_name, secret);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match self.execute_request(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if e.is_retryable() {
                        warn!("Request to {} failed (attempt {}): {}", path, attempt + 1, e);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(ApiError::RetryExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Execute a single request
    async fn execute_request(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Request(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    /// Send a request and deserialize its JSON body
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> ApiResult<T> {
        let response = self.send_with_retry(method, path, body).await?;
        let text = response.text().await.map_err(ApiError::Request)?;

        serde_json::from_str(&text).map_err(|e| {
            error!("Failed to parse response: {} - Body: {}", e, text);
            ApiError::Parse(e)
        })
    }

    // ========================================================================
    // Controller API
    // ========================================================================

    /// Register this agent. On first registration the controller issues a
    /// secret key, which is persisted in the keystore and attached to every
    /// subsequent request.
    pub async fn init(&self, data: InitAgent) -> ApiResult<AgentResponse> {
        let response: AgentResponse = self.request(Method::POST, "/init", Some(&data)).await?;

        if let Some(secret_key) = &response.secret_key {
            self.secrets.set_agent_secret(secret_key)?;
            *self.secret.write() = Some(secret_key.clone());
        }

        Ok(response)
    }

    /// Report host utilization and instance status
    pub async fn send_stats(&self, data: Stats) -> ApiResult<()> {
        self.require_initialized()?;
        self.send_with_retry(Method::POST, "/stats", Some(&data))
            .await?;
        Ok(())
    }

    /// Report a custody incident
    pub async fn send_incident(&self, data: Incident) -> ApiResult<()> {
        self.require_initialized()?;
        self.send_with_retry(Method::POST, "/incident", Some(&data))
            .await?;
        Ok(())
    }

    /// Announce this host to the controller
    pub async fn create_host(&self, data: CreateHost) -> ApiResult<()> {
        self.require_initialized()?;
        self.send_with_retry(Method::POST, "/init/host", Some(&data))
            .await?;
        Ok(())
    }
}

/// Calculate exponential backoff delay
fn calculate_backoff(attempt: u32) -> Duration {
    let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 1);
    std::cmp::min(delay, MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;
    use std::sync::Once;

    static MOCK: Once = Once::new();

    fn test_client(service: &str) -> ControllerClient {
        MOCK.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });

        let config = RemoteConfiguration {
            url: "https://controller.example.com/".to_string(),
            header_name: "X-Agent-Secret".to_string(),
            timeout: 30,
        };
        let secrets = SecretStore::with_service(service).unwrap();
        ControllerClient::new(&config, &secrets).unwrap()
    }

    #[test]
    fn test_url_building() {
        let client = test_client("qudata-agent-test-url");
        assert_eq!(
            client.url("stats"),
            "https://controller.example.com/stats"
        );
        assert_eq!(
            client.url("/stats"),
            "https://controller.example.com/stats"
        );
    }

    #[test]
    fn test_invalid_url() {
        MOCK.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });
        let config = RemoteConfiguration {
            url: "controller.example.com".to_string(),
            header_name: "X-Agent-Secret".to_string(),
            timeout: 30,
        };
        let secrets = SecretStore::with_service("qudata-agent-test-badurl").unwrap();
        assert!(ControllerClient::new(&config, &secrets).is_err());
    }

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(calculate_backoff(2), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(3), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(4), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_requests_require_initialization() {
        let client = test_client("qudata-agent-test-uninit");
        assert!(!client.is_initialized());

        let err = client
            .send_stats(Stats {
                cpu_util: 0.0,
                ram_util: 0.0,
                instance_status: InstanceStatus::Destroyed,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotInitialized));

        let err = client
            .send_incident(Incident {
                incident_type: IncidentType::PrivacyCorrupted,
                timestamp: 0,
                instances_killed: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotInitialized));
    }

    #[test]
    fn test_stored_secret_initializes_client() {
        MOCK.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });
        let secrets = SecretStore::with_service("qudata-agent-test-stored").unwrap();
        secrets.set_agent_secret("existing").unwrap();

        let config = RemoteConfiguration::default();
        let client = ControllerClient::new(&config, &secrets).unwrap();
        assert!(client.is_initialized());
    }
}
