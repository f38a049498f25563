use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::cache::{FetchError, QueryFn};
use crate::credentials::{CredentialError, CredentialStore};

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("credential error: {0}")]
    Credentials(#[from] CredentialError),
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_json(&self, path: &str) -> Result<Value, ApiError>;
}

pub struct HttpApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            credentials,
        })
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut request = self.client.get(&url);
        if let Some(credentials) = self.credentials.credentials().await? {
            request = request.bearer_auth(credentials.token);
        }

        let resp = request.send().await?.error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body)
    }
}

pub struct ApiQuery {
    api: Arc<dyn ApiClient>,
    path: String,
}

impl ApiQuery {
    pub fn new(api: Arc<dyn ApiClient>, path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            api,
            path: path.into(),
        })
    }
}

#[async_trait]
impl QueryFn for ApiQuery {
    async fn fetch(&self) -> Result<Value, FetchError> {
        Ok(self.api.get_json(&self.path).await?)
    }
}

// some endpoints wrap their body in `{ "data": ... }`
pub fn response_data(body: &Value) -> &Value {
    match body.get("data") {
        Some(inner) if !inner.is_null() => inner,
        _ => body,
    }
}
