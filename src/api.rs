//! HTTP API client.
//!
//! Every request carries the current bearer credential. A 401 response
//! triggers the single-flight refresh and the request is replayed exactly
//! once with the new bearer; a second 401 surfaces as a session-expired
//! error instead of another retry.

use crate::auth::CredentialGuard;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{CallSession, Credential};
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct ApiClient {
    http: Client,
    base_url: String,
    guard: Arc<CredentialGuard>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, guard: Arc<CredentialGuard>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            base_url: config.http_url(),
            guard,
        }
    }

    // ============= Authentication =============

    pub async fn login(&self, username: &str, password: &str) -> Result<Credential> {
        let resp = self
            .http
            .post(format!("{}/api/v1/auth/login", self.base_url))
            .json(&json!({
                "username": username,
                "password": password,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::InvalidCredentials);
        }
        self.credential_from_response(resp).await
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<Credential> {
        let resp = self
            .http
            .post(format!("{}/api/v1/auth/register", self.base_url))
            .json(&json!({
                "username": username,
                "email": email,
                "password": password,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!("Registration failed: {status} - {text}")));
        }
        self.credential_from_response(resp).await
    }

    async fn credential_from_response(&self, resp: Response) -> Result<Credential> {
        let data: serde_json::Value = resp.json().await?;
        let token = data["token"]
            .as_str()
            .ok_or_else(|| Error::Http("response missing token".to_string()))?;
        Credential::from_token(token).ok_or(Error::InvalidCredentials)
    }

    // ============= Calls =============

    pub async fn create_call(
        &self,
        conversation_id: &str,
        participant_id: &str,
    ) -> Result<CallSession> {
        let resp = self
            .send_authorized(|| {
                self.http
                    .post(format!("{}/api/v1/calls", self.base_url))
                    .json(&json!({
                        "conversation_id": conversation_id,
                        "participant_id": participant_id,
                    }))
            })
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Http(format!("Call creation failed: {}", resp.status())));
        }
        Ok(resp.json().await?)
    }

    // ============= Request plumbing =============

    /// Send with the current bearer attached. On 401, refresh once and
    /// replay once; never more.
    async fn send_authorized(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut replayed = false;
        loop {
            let token = self.guard.token().ok_or(Error::NotLoggedIn)?;
            let resp = build()
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await?;

            if resp.status() == StatusCode::UNAUTHORIZED && !replayed {
                replayed = true;
                // Another caller may have refreshed while this request was in
                // flight; only refresh when the bearer we used is still the
                // current one.
                if self.guard.token().as_deref() != Some(token.as_str()) {
                    debug!("Request got 401 on a superseded bearer, replaying");
                    continue;
                }
                debug!("Request got 401, refreshing credential");
                if self.guard.refresh().await.is_some() {
                    continue;
                }
                warn!("Refresh after 401 failed");
                return Err(Error::SessionExpired);
            }
            return Ok(resp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CredentialStore;
    use crate::test_util::{make_token, MockRefresh};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal scripted HTTP server: every request is answered by `respond`,
    /// which sees the request path and the bearer token it carried.
    async fn spawn_server(
        respond: impl Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let total_clone = total.clone();
        let respond = Arc::new(respond);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                total_clone.fetch_add(1, Ordering::SeqCst);
                let respond = respond.clone();

                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    // Read headers, then the content-length body if any.
                    let (head, body_needed) = loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(end) = find_headers_end(&buf) {
                            let head = String::from_utf8_lossy(&buf[..end]).to_string();
                            let content_length = head
                                .lines()
                                .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                                .and_then(|l| l.split(':').nth(1))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            let have = buf.len() - end - 4;
                            break (head, content_length.saturating_sub(have));
                        }
                    };
                    let mut remaining = body_needed;
                    while remaining > 0 {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        remaining = remaining.saturating_sub(n);
                    }

                    let path = head
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("")
                        .to_string();
                    let bearer = head
                        .lines()
                        .find(|l| l.to_ascii_lowercase().starts_with("authorization:"))
                        .and_then(|l| l.splitn(2, ':').nth(1))
                        .map(|v| v.trim().trim_start_matches("Bearer ").to_string())
                        .unwrap_or_default();

                    let (status, body) = respond(&path, &bearer);
                    let reason = if status == 200 { "OK" } else { "Unauthorized" };
                    let resp = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{addr}"), total)
    }

    fn find_headers_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn api_with(base_url: &str, guard: Arc<CredentialGuard>) -> ApiClient {
        ApiClient {
            http: Client::builder().build().unwrap(),
            base_url: base_url.to_string(),
            guard,
        }
    }

    fn call_body() -> String {
        serde_json::to_string(&CallSession::new_outgoing("conv1", "alice", "bob")).unwrap()
    }

    #[tokio::test]
    async fn bearer_is_injected_and_401_is_replayed_once() {
        // The stale bearer gets a 401; a refreshed bearer succeeds.
        let stale = make_token("alice", 3600);
        let stale_check = stale.clone();
        let (base_url, total) = spawn_server(move |path, bearer| {
            if path != "/api/v1/calls" || bearer.is_empty() || bearer == stale_check {
                (401, "{}".to_string())
            } else {
                (200, call_body())
            }
        })
        .await;

        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.save_token(&stale).unwrap();
        let transport = Arc::new(MockRefresh::new());
        let guard = CredentialGuard::new(transport.clone(), store);
        let api = api_with(&base_url, guard);

        let call = api.create_call("conv1", "bob").await.unwrap();
        assert_eq!(call.conversation_id, "conv1");
        assert_eq!(transport.calls(), 1);
        assert_eq!(total.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        let stale = make_token("alice", 3600);
        let stale_check = stale.clone();
        let (base_url, _) = spawn_server(move |_, bearer| {
            if bearer == stale_check {
                (401, "{}".to_string())
            } else {
                (200, call_body())
            }
        })
        .await;

        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.save_token(&stale).unwrap();
        let transport = Arc::new(MockRefresh::new());
        let guard = CredentialGuard::new(transport.clone(), store);
        let api = Arc::new(api_with(&base_url, guard));

        let (a, b) = tokio::join!(api.create_call("conv1", "bob"), api.create_call("conv1", "bob"));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn persistent_401_is_not_replayed_twice() {
        let (base_url, total) = spawn_server(|_, _| (401, "{}".to_string())).await;

        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.save_token(&make_token("alice", 3600)).unwrap();
        let transport = Arc::new(MockRefresh::new());
        let guard = CredentialGuard::new(transport.clone(), store);
        let api = api_with(&base_url, guard);

        let err = api.create_call("conv1", "bob").await.unwrap_err();
        // Original request + exactly one replay.
        assert_eq!(total.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::Http(_)));
    }
}
