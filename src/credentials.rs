use std::{
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

const TOKEN_KEYS: [&str; 3] = ["access_token", "token", "authToken"];
const PROFILE_KEY: &str = "user_profile";
const USER_ID_KEYS: [&str; 3] = ["id", "userId", "user_id"];

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credential store: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub token: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: String,
}

impl StoredCredentials {
    pub fn resolve(self) -> Option<Credentials> {
        let token = self.token.as_deref().and_then(clean_token)?;
        let user_id = match self.user_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => {
                // claims are read unverified; the server checks the signature
                let mut parts = token.split('.');
                let (Some(_), Some(payload), Some(_), None) =
                    (parts.next(), parts.next(), parts.next(), parts.next())
                else {
                    return None;
                };
                let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
                let claims: Value = serde_json::from_slice(&bytes).ok()?;
                match claims.get("sub")? {
                    Value::String(sub) if !sub.is_empty() => sub.clone(),
                    Value::Number(sub) => sub.to_string(),
                    _ => return None,
                }
            }
        };
        Some(Credentials { token, user_id })
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<StoredCredentials, CredentialError>;

    async fn credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.load().await?.resolve())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentials {
    inner: RwLock<StoredCredentials>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>, user_id: impl Into<String>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = StoredCredentials {
            token: Some(token.into()),
            user_id: Some(user_id.into()),
        };
    }

    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = StoredCredentials::default();
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn load(&self) -> Result<StoredCredentials, CredentialError> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

// a missing file reads as empty storage
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialStore for FileCredentials {
    async fn load(&self) -> Result<StoredCredentials, CredentialError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredCredentials::default())
            }
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(StoredCredentials::default());
        }
        let doc: Map<String, Value> = serde_json::from_str(&text)?;
        Ok(parse_storage(&doc))
    }
}

fn parse_storage(doc: &Map<String, Value>) -> StoredCredentials {
    let token = TOKEN_KEYS
        .iter()
        .filter_map(|key| doc.get(*key).and_then(Value::as_str))
        .find_map(clean_token);

    let profile = match doc.get(PROFILE_KEY) {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };
    let user_id = profile.as_ref().and_then(|profile| {
        USER_ID_KEYS
            .iter()
            .filter_map(|key| profile.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    });

    StoredCredentials { token, user_id }
}

// raw or JSON-quoted; "null" and "undefined" count as missing
fn clean_token(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" || raw == "undefined" {
        return None;
    }
    let token = match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(parsed)) => parsed,
        _ => raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw)
            .to_string(),
    };
    let token = token.trim().to_string();
    (!token.is_empty()).then_some(token)
}

/// Polls every `poll` until the store yields usable credentials. Drop the
/// future to cancel.
pub async fn wait_for_credentials(store: &dyn CredentialStore, poll: Duration) -> Credentials {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut attempts: u64 = 0;

    loop {
        ticker.tick().await;
        match store.credentials().await {
            Ok(Some(credentials)) => {
                if attempts > 0 {
                    debug!(attempts, "credentials became available");
                }
                return credentials;
            }
            Ok(None) => {
                if attempts == 0 {
                    debug!("no credentials yet, waiting");
                }
            }
            Err(e) => debug!(error = %e, "credential store unreadable, waiting"),
        }
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jwt_with_sub(sub: Value) -> String {
        let payload = URL_SAFE_NO_PAD.encode(json!({ "sub": sub }).to_string());
        format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
    }

    #[test]
    fn storage_accepts_quoted_tokens_and_string_profiles() {
        let doc = json!({
            "token": "null",
            "authToken": "\"abc\"",
            "user_profile": "{\"userId\": 17}"
        });
        let stored = parse_storage(doc.as_object().unwrap());

        assert_eq!(stored.token.as_deref(), Some("abc"));
        assert_eq!(stored.user_id.as_deref(), Some("17"));
    }

    #[test]
    fn placeholder_tokens_are_missing() {
        assert_eq!(clean_token("undefined"), None);
        assert_eq!(clean_token("  "), None);
        assert_eq!(clean_token("\"\""), None);
        assert_eq!(clean_token("raw.token.value").as_deref(), Some("raw.token.value"));
    }

    #[test]
    fn user_id_falls_back_to_jwt_subject() {
        let token = jwt_with_sub(json!("user-9"));
        let resolved = StoredCredentials {
            token: Some(token.clone()),
            user_id: None,
        }
        .resolve()
        .unwrap();

        assert_eq!(resolved.user_id, "user-9");
        assert_eq!(resolved.token, token);

        let numeric = StoredCredentials {
            token: Some(jwt_with_sub(json!(42))),
            user_id: Some(" ".into()),
        }
        .resolve()
        .unwrap();
        assert_eq!(numeric.user_id, "42");
    }

    #[test]
    fn unresolvable_without_token_or_user() {
        assert_eq!(StoredCredentials::default().resolve(), None);
        assert_eq!(
            StoredCredentials {
                token: Some("opaque".into()),
                user_id: None
            }
            .resolve(),
            None
        );
        assert_eq!(
            StoredCredentials {
                token: Some(format!("{}.extra", jwt_with_sub(json!("u")))),
                user_id: None
            }
            .resolve(),
            None
        );
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_storage() {
        let store = FileCredentials::new("/nonexistent/rft/credentials.json");
        assert_eq!(store.load().await.unwrap(), StoredCredentials::default());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_after_credentials_appear() {
        let store = std::sync::Arc::new(MemoryCredentials::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                wait_for_credentials(store.as_ref(), Duration::from_secs(1)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!waiter.is_finished());

        store.set("tok", "5");
        let credentials = waiter.await.unwrap();
        assert_eq!(credentials.user_id, "5");
    }
}
