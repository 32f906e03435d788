//! Shared helpers for unit tests.

use crate::auth::RefreshTransport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Build an unsigned JWT whose claims decode the way the server's do.
/// A negative `ttl_secs` yields an already-expired token.
pub(crate) fn make_token(sub: &str, ttl_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let exp = chrono::Utc::now().timestamp() + ttl_secs;
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{sub}","exp":{exp}}}"#));
    format!("{header}.{claims}.sig")
}

/// Scripted refresh backend. Counts calls and can be flipped into a
/// failure mode; every success mints a token distinct from any prior one.
pub(crate) struct MockRefresh {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MockRefresh {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RefreshTransport for MockRefresh {
    async fn refresh(&self, _token: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        // A little latency so concurrent callers genuinely overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::SessionExpired);
        }
        Ok(make_token(&format!("refreshed{n}"), 3600))
    }
}
