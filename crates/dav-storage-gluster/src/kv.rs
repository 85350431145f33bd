use dav_storage_core::StorageError;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare KV REST API client.
///
/// Values are raw strings. Expiry is delegated to KV through
/// `expiration_ttl`, which KV only accepts from 60 seconds up.
pub struct KvClient {
    http_client: HttpClient,
    api_base: String,
    account_id: String,
    namespace_id: String,
    api_token: String,
}

impl KvClient {
    pub fn new(account_id: String, namespace_id: String, api_token: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_base: CLOUDFLARE_API.to_string(),
            account_id,
            namespace_id,
            api_token,
        }
    }

    /// Point the client at another API root (a proxy or a test server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn value_url(&self, key: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            self.api_base,
            self.account_id,
            self.namespace_id,
            urlencoding::encode(key)
        )
    }

    fn request(&self, method: Method, key: &str) -> RequestBuilder {
        self.http_client
            .request(method, self.value_url(key))
            .bearer_auth(&self.api_token)
    }

    /// Send `request`, mapping transport failures and non-2xx statuses other
    /// than 404 to `StorageError::Io`. Returns `None` on 404.
    async fn send(op: &str, request: RequestBuilder) -> Result<Option<Response>, StorageError> {
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::Io(format!("KV {} request failed: {}", op, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StorageError::Io(format!(
                    "KV {} returned {}: {}",
                    op, status, body
                )))
            }
        }
    }

    /// Raw value of `key`, `None` when absent.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let Some(response) = Self::send("GET", self.request(Method::GET, key)).await? else {
            debug!("KV key not found: {}", key);
            return Ok(None);
        };

        let value = response
            .text()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read KV value {}: {}", key, e)))?;
        debug!("KV GET {} ({} bytes)", key, value.len());
        Ok(Some(value))
    }

    /// Store `value` under `key`, expiring after `expiration_ttl` seconds
    /// when given.
    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        expiration_ttl: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut request = self
            .request(Method::PUT, key)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(value.to_string());
        if let Some(ttl) = expiration_ttl {
            request = request.query(&[("expiration_ttl", ttl)]);
        }

        // A 404 on write means the namespace itself is missing
        if Self::send("PUT", request).await?.is_none() {
            return Err(StorageError::NotFound(format!(
                "KV namespace {} of account {}",
                self.namespace_id, self.account_id
            )));
        }
        debug!("KV PUT {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Remove `key`. Returns `false` when it was not there.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let deleted = Self::send("DELETE", self.request(Method::DELETE, key))
            .await?
            .is_some();
        debug!("KV DELETE {} (existed: {})", key, deleted);
        Ok(deleted)
    }
}
