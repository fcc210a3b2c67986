//! ==============================================================================
//! auth.rs - Firebase email/password authentication over REST
//! ==============================================================================
//!
//! purpose:
//!     - sign in with the service account (identity toolkit `signInWithPassword`)
//!     - refresh the ID token before it expires (secure token `grant_type=refresh_token`)
//!
//! relationships:
//!     - used by: firebase.rs (session for database writes)
//!
//! ==============================================================================

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// refresh when the token has less than this left
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// an authenticated user session
#[derive(Clone, Debug)]
pub struct Session {
    pub uid: String,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: Instant,
}

impl Session {
    pub fn needs_refresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN >= self.expires_at
    }

    /// force a refresh before the next request
    pub fn invalidate(&mut self) {
        self.expires_at = Instant::now();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    refresh_token: String,
    /// seconds, sent as a string
    expires_in: String,
    #[serde(default)]
    local_id: String,
}

#[derive(Deserialize, Debug)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    #[serde(default)]
    user_id: String,
}

/// Thin client for the two identity endpoints.
#[derive(Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    api_key: String,
    identity_url: String,
    token_url: String,
    response_size: usize,
}

impl IdentityClient {
    pub fn new(http: reqwest::Client, api_key: &str, identity_url: &str, token_url: &str, response_size: usize) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            identity_url: identity_url.trim_end_matches('/').to_string(),
            token_url: token_url.trim_end_matches('/').to_string(),
            response_size,
        }
    }

    pub fn sign_in_url(&self) -> String {
        format!("{}/accounts:signInWithPassword", self.identity_url)
    }

    pub fn refresh_url(&self) -> String {
        format!("{}/token", self.token_url)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        debug!(email, "Signing in");
        let response = self
            .http
            .post(self.sign_in_url())
            .query(&[("key", self.api_key.as_str())])
            .json(&SignInRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await
            .context("sign-in request failed")?;

        let body = self.read_body(response).await?;
        let parsed: SignInResponse = serde_json::from_str(&body).context("malformed sign-in response")?;
        session_from(parsed.local_id, parsed.id_token, parsed.refresh_token, &parsed.expires_in)
    }

    pub async fn refresh(&self, session: &Session) -> Result<Session> {
        debug!(uid = %session.uid, "Refreshing ID token");
        let response = self
            .http
            .post(self.refresh_url())
            .query(&[("key", self.api_key.as_str())])
            .form(&[("grant_type", "refresh_token"), ("refresh_token", session.refresh_token.as_str())])
            .send()
            .await
            .context("token refresh request failed")?;

        let body = self.read_body(response).await?;
        let parsed: RefreshResponse = serde_json::from_str(&body).context("malformed token refresh response")?;
        let uid = if parsed.user_id.is_empty() {
            session.uid.clone()
        } else {
            parsed.user_id
        };
        session_from(uid, parsed.id_token, parsed.refresh_token, &parsed.expires_in)
    }

    /// success body, or an error carrying the service's message
    async fn read_body(&self, response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await.context("failed to read auth response")?;
        if status.is_success() {
            return Ok(body);
        }
        bail!("auth rejected ({}): {}", status, error_reason(&body, self.response_size))
    }
}

fn session_from(uid: String, id_token: String, refresh_token: String, expires_in: &str) -> Result<Session> {
    if uid.is_empty() {
        bail!("auth response carried no user id");
    }
    let secs: u64 = expires_in
        .parse()
        .map_err(|_| anyhow!("invalid expiresIn value {:?}", expires_in))?;
    Ok(Session {
        uid,
        id_token,
        refresh_token,
        expires_at: Instant::now() + Duration::from_secs(secs),
    })
}

/// The service's own error text, else the raw body cut to `limit` bytes.
///
/// identity endpoints answer `{"error": {"message": "..."}}`,
/// the realtime database answers `{"error": "..."}`.
pub fn error_reason(body: &str, limit: usize) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        match map.get("error") {
            Some(serde_json::Value::String(message)) => return message.clone(),
            Some(serde_json::Value::Object(inner)) => {
                if let Some(serde_json::Value::String(message)) = inner.get("message") {
                    return message.clone();
                }
            }
            _ => {}
        }
    }
    truncate(body, limit).to_string()
}

/// cut at a char boundary no later than `limit` bytes
pub fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_response_becomes_session() {
        let body = r#"{
            "kind": "identitytoolkit#VerifyPasswordResponse",
            "localId": "Xy12uid",
            "email": "gateway@example.com",
            "idToken": "eyJ.id",
            "registered": true,
            "refreshToken": "AMf-refresh",
            "expiresIn": "3600"
        }"#;
        let parsed: SignInResponse = serde_json::from_str(body).unwrap();
        let before = Instant::now();
        let session = session_from(parsed.local_id, parsed.id_token, parsed.refresh_token, &parsed.expires_in).unwrap();

        assert_eq!(session.uid, "Xy12uid");
        assert_eq!(session.id_token, "eyJ.id");
        assert!(session.expires_at >= before + Duration::from_secs(3600));
        assert!(!session.needs_refresh(Instant::now()));
        assert!(session.needs_refresh(Instant::now() + Duration::from_secs(3550)));
    }

    #[test]
    fn test_empty_uid_is_not_a_session() {
        assert!(session_from(String::new(), "t".into(), "r".into(), "3600").is_err());
        assert!(session_from("uid".into(), "t".into(), "r".into(), "soon").is_err());
    }

    #[test]
    fn test_refresh_response_shape() {
        let body = r#"{"expires_in":"3600","token_type":"Bearer","refresh_token":"r2","id_token":"t2","user_id":"Xy12uid","project_id":"1234"}"#;
        let parsed: RefreshResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.user_id, "Xy12uid");
        assert_eq!(parsed.id_token, "t2");
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let mut session = session_from("uid".into(), "t".into(), "r".into(), "3600").unwrap();
        session.invalidate();
        assert!(session.needs_refresh(Instant::now()));
    }

    #[test]
    fn test_error_reason() {
        let body = r#"{"error":{"code":400,"message":"INVALID_PASSWORD","errors":[]}}"#;
        assert_eq!(error_reason(body, 4096), "INVALID_PASSWORD");
        assert_eq!(error_reason(r#"{"error":"Permission denied"}"#, 4096), "Permission denied");
        assert_eq!(error_reason("gateway timeout page", 7), "gateway");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("héllo", 3), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_endpoint_urls() {
        let client = IdentityClient::new(
            reqwest::Client::new(),
            "key",
            "https://identitytoolkit.googleapis.com/v1/",
            "http://localhost:9099/securetoken.googleapis.com/v1",
            4096,
        );
        assert_eq!(client.sign_in_url(), "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword");
        assert_eq!(client.refresh_url(), "http://localhost:9099/securetoken.googleapis.com/v1/token");
    }
}
