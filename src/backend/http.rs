//! HTTP implementation of [`AuthBackend`] against the hosted service.
//!
//! Auth endpoints live under `/auth/v1`, tenant tables are read through
//! `/rest/v1` (single-object reads), and provisioning goes through
//! `/functions/v1`. The client owns the cached session and refreshes it
//! transparently inside `get_session`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::session::{Organization, Profile, Session, User};

use super::{AuthBackend, AuthEvent, AuthEventKind, NewUserSetup, OtpType, SignUpResult};

/// Capacity of the auth event fan-out. Subscribers that lag this far behind
/// see a `Lagged` error rather than blocking the backend.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct HttpBackend {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    email_redirect_to: Option<String>,
    password_reset_redirect: Option<String>,
    oauth_redirect_to: Option<String>,
    session: RwLock<Option<Session>>,
    /// Serializes token refreshes so concurrent `get_session` callers do not
    /// race each other with the same refresh token.
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
            email_redirect_to: config.email_redirect_to.clone(),
            password_reset_redirect: config.password_reset_redirect.clone(),
            oauth_redirect_to: config.oauth_redirect_to.clone(),
            session: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            events,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn bearer_token(&self) -> String {
        self.session
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.api_key.clone())
    }

    fn store_session(&self, session: Session, kind: AuthEventKind) {
        *self.session.write() = Some(session.clone());
        let _ = self.events.send(AuthEvent {
            kind,
            session: Some(session),
        });
    }

    fn clear_session(&self) {
        *self.session.write() = None;
        let _ = self.events.send(AuthEvent {
            kind: AuthEventKind::SignedOut,
            session: None,
        });
    }

    /// Turn a non-success response into a [`BackendError`], consuming the
    /// body to recover the backend's error code when it sent one.
    async fn error_from_response(&self, resp: reqwest::Response) -> BackendError {
        let status = resp.status();
        let body: ApiErrorBody = match resp.text().await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => ApiErrorBody::default(),
        };
        map_api_error(status, body.code(), &body.message())
    }

    async fn refresh(&self, stale: Session) -> Result<Option<Session>, BackendError> {
        let resp = self
            .client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.api_key)
            .json(&json!({ "refresh_token": stale.refresh_token }))
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            let err = self.error_from_response(resp).await;
            if err.is_transient() {
                // backend unreachable: session validity is unknown, keep it
                return Err(err);
            }
            // refresh token rejected: the session is gone for good
            warn!(error = %err, "Session refresh rejected, signing out");
            self.clear_session();
            return Ok(None);
        }

        let token: TokenResponse = resp.json().await.map_err(from_reqwest)?;
        let session = token.into_session();
        debug!(user_id = %session.user.id, "Session refreshed");
        self.store_session(session.clone(), AuthEventKind::TokenRefreshed);
        Ok(Some(session))
    }
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let resp = self
            .client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.api_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }

        let token: TokenResponse = resp.json().await.map_err(from_reqwest)?;
        let session = token.into_session();
        self.store_session(session.clone(), AuthEventKind::SignedIn);
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        organization_id: Option<Uuid>,
    ) -> Result<SignUpResult, BackendError> {
        let mut request = self
            .client
            .post(self.auth_url("signup"))
            .header("apikey", &self.api_key);
        if let Some(redirect) = &self.email_redirect_to {
            request = request.query(&[("redirect_to", redirect.as_str())]);
        }

        let mut body = json!({ "email": email, "password": password });
        if let Some(org_id) = organization_id {
            body["data"] = json!({ "organization_id": org_id });
        }

        let resp = request.json(&body).send().await.map_err(from_reqwest)?;
        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }

        let payload: serde_json::Value = resp.json().await.map_err(from_reqwest)?;
        let result = parse_sign_up_response(payload)?;
        if let Some(session) = &result.session {
            self.store_session(session.clone(), AuthEventKind::SignedIn);
        }
        Ok(result)
    }

    async fn verify_otp(
        &self,
        email: &str,
        token: &str,
        otp_type: OtpType,
    ) -> Result<Session, BackendError> {
        let resp = self
            .client
            .post(self.auth_url("verify"))
            .header("apikey", &self.api_key)
            .json(&json!({
                "email": email,
                "token": token,
                "type": otp_type.as_str(),
            }))
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }

        let token: TokenResponse = resp.json().await.map_err(from_reqwest)?;
        let session = token.into_session();
        self.store_session(session.clone(), AuthEventKind::SignedIn);
        Ok(session)
    }

    async fn resend_otp(&self, email: &str, otp_type: OtpType) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.auth_url("resend"))
            .header("apikey", &self.api_key)
            .json(&json!({ "email": email, "type": otp_type.as_str() }))
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        Ok(())
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        scopes: Option<&str>,
    ) -> Result<String, BackendError> {
        let url = oauth_authorize_url(
            &self.base_url,
            provider,
            self.oauth_redirect_to.as_deref(),
            scopes,
        )?;
        Ok(url)
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        let mut request = self
            .client
            .post(self.auth_url("recover"))
            .header("apikey", &self.api_key);
        if let Some(redirect) = &self.password_reset_redirect {
            request = request.query(&[("redirect_to", redirect.as_str())]);
        }

        let resp = request
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(cached) = self.session.read().clone() else {
            return Ok(None);
        };
        if !cached.is_expired() {
            return Ok(Some(cached));
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited on the lock;
        // bind the clone so the read guard is released before awaiting
        let current = self.session.read().clone();
        match current {
            Some(current) if !current.is_expired() => Ok(Some(current)),
            Some(current) => self.refresh(current).await,
            None => Ok(None),
        }
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let token = self.bearer_token();
        let result = self
            .client
            .post(self.auth_url("logout"))
            .header("apikey", &self.api_key)
            .bearer_auth(&token)
            .send()
            .await;

        // local credentials are dropped regardless of what the server said
        self.clear_session();

        match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let err = self.error_from_response(resp).await;
                warn!(error = %err, "Server-side logout failed");
                Err(err)
            }
            Err(e) => {
                let err = from_reqwest(e);
                warn!(error = %err, "Server-side logout unreachable");
                Err(err)
            }
        }
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Profile, BackendError> {
        let resp = self
            .client
            .get(self.rest_url("profiles"))
            .query(&[("id", format!("eq.{user_id}")), ("select", "*".into())])
            .header("apikey", &self.api_key)
            .bearer_auth(self.bearer_token())
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        resp.json::<Profile>().await.map_err(from_reqwest)
    }

    async fn fetch_organization(&self, org_id: Uuid) -> Result<Organization, BackendError> {
        let resp = self
            .client
            .get(self.rest_url("organizations"))
            .query(&[("id", format!("eq.{org_id}")), ("select", "*".into())])
            .header("apikey", &self.api_key)
            .bearer_auth(self.bearer_token())
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        resp.json::<Organization>().await.map_err(from_reqwest)
    }

    async fn setup_new_user(&self, setup: &NewUserSetup) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(format!("{}/functions/v1/setup-new-user", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(self.bearer_token())
            .json(setup)
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: Uuid,
    #[serde(default)]
    email: String,
    #[serde(default)]
    email_confirmed_at: Option<DateTime<Utc>>,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
            user: self.user.into_user(),
        }
    }
}

impl WireUser {
    fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            email_verified: self.email_confirmed_at.is_some(),
        }
    }
}

/// Error body as the backend sends it. Field names differ between the auth
/// endpoints (`error_code`/`msg`) and the table API (`code`/`message`).
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    error_code: Option<String>,
    code: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
}

impl ApiErrorBody {
    fn code(&self) -> Option<&str> {
        self.error_code.as_deref().or(self.code.as_deref())
    }

    fn message(&self) -> String {
        self.msg
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| self.error_description.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// PostgREST signals a recycled pooled connection with this code; it is the
/// one table-read failure that is always worth retrying.
const STALE_CONNECTION_CODE: &str = "PGRST301";
/// Single-object read matched zero rows.
const NO_ROWS_CODE: &str = "PGRST116";

fn map_api_error(status: StatusCode, code: Option<&str>, message: &str) -> BackendError {
    if let Some(code) = code {
        match code {
            "invalid_credentials" | "invalid_grant" => return BackendError::InvalidCredentials,
            "email_not_confirmed" => return BackendError::EmailNotConfirmed,
            "otp_expired" | "otp_disabled" => return BackendError::OtpInvalid,
            "user_already_exists" | "email_exists" => return BackendError::UserAlreadyRegistered,
            "over_request_rate_limit" | "over_email_send_rate_limit" => {
                return BackendError::RateLimited;
            }
            STALE_CONNECTION_CODE => return BackendError::StaleConnection,
            NO_ROWS_CODE => return BackendError::NotFound,
            _ => {}
        }
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited,
        StatusCode::REQUEST_TIMEOUT => BackendError::Timeout,
        StatusCode::NOT_FOUND => BackendError::NotFound,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Network(format!("upstream unavailable ({status})"))
        }
        s if s.is_server_error() => BackendError::Network(format!("server error ({s})")),
        _ => BackendError::Api {
            code: code.unwrap_or("unknown").to_string(),
            message: message.to_string(),
        },
    }
}

fn from_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else if err.is_decode() {
        BackendError::Internal(anyhow::Error::new(err).context("Malformed backend response"))
    } else {
        BackendError::Network(err.to_string())
    }
}

/// Sign-up returns a token response when email confirmation is disabled,
/// or a bare user object when a verification email was sent.
fn parse_sign_up_response(payload: serde_json::Value) -> Result<SignUpResult, BackendError> {
    if payload.get("access_token").is_some() {
        let token: TokenResponse = serde_json::from_value(payload)
            .map_err(|e| BackendError::Internal(anyhow::Error::new(e)))?;
        let session = token.into_session();
        return Ok(SignUpResult {
            user: session.user.clone(),
            session: Some(session),
        });
    }
    let user: WireUser = serde_json::from_value(payload)
        .map_err(|e| BackendError::Internal(anyhow::Error::new(e)))?;
    Ok(SignUpResult {
        user: user.into_user(),
        session: None,
    })
}

fn oauth_authorize_url(
    base_url: &str,
    provider: &str,
    redirect_to: Option<&str>,
    scopes: Option<&str>,
) -> Result<String, BackendError> {
    let mut url = Url::parse(&format!("{base_url}/auth/v1/authorize"))
        .map_err(|e| BackendError::Internal(anyhow::Error::new(e).context("Bad base URL")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("provider", provider);
        if let Some(redirect) = redirect_to {
            pairs.append_pair("redirect_to", redirect);
        }
        if let Some(scopes) = scopes {
            pairs.append_pair("scopes", scopes);
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_api_error_known_codes() {
        let err = map_api_error(StatusCode::BAD_REQUEST, Some("invalid_credentials"), "nope");
        assert!(matches!(err, BackendError::InvalidCredentials));

        let err = map_api_error(StatusCode::FORBIDDEN, Some("otp_expired"), "expired");
        assert!(matches!(err, BackendError::OtpInvalid));

        let err = map_api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            Some("PGRST301"),
            "stale connection",
        );
        assert!(matches!(err, BackendError::StaleConnection));
        assert!(err.is_transient());

        let err = map_api_error(StatusCode::NOT_ACCEPTABLE, Some("PGRST116"), "no rows");
        assert!(matches!(err, BackendError::NotFound));
    }

    #[test]
    fn test_map_api_error_by_status() {
        assert!(matches!(
            map_api_error(StatusCode::TOO_MANY_REQUESTS, None, ""),
            BackendError::RateLimited
        ));
        assert!(map_api_error(StatusCode::BAD_GATEWAY, None, "").is_transient());
        assert!(map_api_error(StatusCode::INTERNAL_SERVER_ERROR, None, "").is_transient());

        let err = map_api_error(StatusCode::UNPROCESSABLE_ENTITY, Some("weird_code"), "boom");
        match err {
            BackendError::Api { code, message } => {
                assert_eq!(code, "weird_code");
                assert_eq!(message, "boom");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_token_response_into_session() {
        let token: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "at-123",
            "refresh_token": "rt-456",
            "expires_in": 3600,
            "user": {
                "id": "7f2c1a30-0000-0000-0000-000000000001",
                "email": "casey@repclub.fit",
                "email_confirmed_at": "2026-01-10T12:00:00Z"
            }
        }))
        .unwrap();

        let session = token.into_session();
        assert_eq!(session.access_token, "at-123");
        assert_eq!(session.user.email, "casey@repclub.fit");
        assert!(session.user.email_verified);
        assert!(!session.is_expired());
    }

    #[test]
    fn test_parse_sign_up_verification_required() {
        let result = parse_sign_up_response(serde_json::json!({
            "id": "7f2c1a30-0000-0000-0000-000000000002",
            "email": "new@repclub.fit"
        }))
        .unwrap();
        assert!(result.session.is_none());
        assert_eq!(result.user.email, "new@repclub.fit");
        assert!(!result.user.email_verified);
    }

    #[test]
    fn test_parse_sign_up_immediate_session() {
        let result = parse_sign_up_response(serde_json::json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600,
            "user": {
                "id": "7f2c1a30-0000-0000-0000-000000000003",
                "email": "new@repclub.fit",
                "email_confirmed_at": null
            }
        }))
        .unwrap();
        assert!(result.session.is_some());
        assert_eq!(result.user.id, result.session.unwrap().user.id);
    }

    #[tokio::test]
    async fn test_get_session_serves_cached_session_without_refresh() {
        let backend = HttpBackend::new(&BackendConfig::default()).unwrap();
        assert!(backend.get_session().await.unwrap().is_none());

        let session = Session {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now() + Duration::hours(1),
            user: User {
                id: Uuid::new_v4(),
                email: "casey@repclub.fit".into(),
                email_verified: true,
            },
        };
        *backend.session.write() = Some(session.clone());

        // unexpired cached session comes straight back, no network involved
        let got = backend.get_session().await.unwrap();
        assert_eq!(got, Some(session));
    }

    #[test]
    fn test_oauth_authorize_url() {
        let url = oauth_authorize_url(
            "https://api.example.com",
            "google",
            Some("https://app.example.com/callback"),
            Some("email profile"),
        )
        .unwrap();
        assert!(url.starts_with("https://api.example.com/auth/v1/authorize?"));
        assert!(url.contains("provider=google"));
        assert!(url.contains("redirect_to=https%3A%2F%2Fapp.example.com%2Fcallback"));
        assert!(url.contains("scopes=email+profile"));

        let bare = oauth_authorize_url("https://api.example.com", "apple", None, None).unwrap();
        assert_eq!(
            bare,
            "https://api.example.com/auth/v1/authorize?provider=apple"
        );
    }
}
