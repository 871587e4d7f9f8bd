// Inbound response classification and session teardown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::auth::ResultCodes;
use crate::http_client::ApiResponse;
use crate::store::CredentialStore;

/// How a response should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Access token expired: refresh and replay once
    TokenExpired,
    /// Refresh token rejected: end the session
    SessionInvalid,
}

/// Navigation to the login entry point
pub trait LoginRedirect: Send + Sync {
    fn redirect_to_login(&self);
}

/// Default redirect for headless use: records the event in the log
#[derive(Debug, Default)]
pub struct LogRedirect;

impl LoginRedirect for LogRedirect {
    fn redirect_to_login(&self) {
        tracing::warn!("Session ended, login required");
    }
}

/// Classifies responses by their application-level result code
///
/// Ending a session is latched: concurrent requests that all observe the same
/// rejection redirect once, until [`ResponseGuard::session_started`] re-arms it.
pub struct ResponseGuard {
    store: CredentialStore,
    codes: ResultCodes,
    redirect: Arc<dyn LoginRedirect>,
    ended: AtomicBool,
}

impl ResponseGuard {
    pub fn new(store: CredentialStore, codes: ResultCodes, redirect: Arc<dyn LoginRedirect>) -> Self {
        Self {
            store,
            codes,
            redirect,
            ended: AtomicBool::new(false),
        }
    }

    pub fn set_redirect(&mut self, redirect: Arc<dyn LoginRedirect>) {
        self.redirect = redirect;
    }

    pub fn classify(&self, response: &ApiResponse) -> Verdict {
        match response.code() {
            Some(code) if code == self.codes.token_expired => Verdict::TokenExpired,
            Some(code) if code == self.codes.login_again => Verdict::SessionInvalid,
            _ => Verdict::Pass,
        }
    }

    /// Clear every credential and send the user back to login
    pub fn end_session(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!("Session already ended");
            return;
        }

        tracing::info!("Ending session");
        self.store.clear_session();
        self.redirect.redirect_to_login();
    }

    /// Re-arm teardown after new credentials are stored
    pub fn session_started(&self) {
        self.ended.store(false, Ordering::SeqCst);
    }
}
