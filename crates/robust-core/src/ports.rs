use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Opaque credential triple handed back by the server on successful auth
/// and replayed on later authenticate calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Authenticator {
    pub mode: String,
    pub key: String,
    pub secret: String,
}

/// Credential persistence, injected at construction. The client never
/// decides where credentials live.
pub trait CredentialStore: Send + Sync {
    fn authenticator(&self) -> Option<Authenticator>;
    fn set_authenticator(&self, auth: Authenticator);
}

/// Interactive external-authorization flow (a URL the user must visit).
/// `close` with no open prompt is a no-op.
pub trait AuthPrompt: Send + Sync {
    fn open(&self, url: &str);
    fn close(&self);
}

/// In-memory credential store for tests and the default binary wiring.
#[derive(Default)]
pub struct MemoryCredentialStore {
    auth: Mutex<Option<Authenticator>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authenticator(auth: Authenticator) -> Self {
        Self {
            auth: Mutex::new(Some(auth)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn authenticator(&self) -> Option<Authenticator> {
        self.auth.lock().clone()
    }

    fn set_authenticator(&self, auth: Authenticator) {
        *self.auth.lock() = Some(auth);
    }
}

/// Prompt that only logs. Useful when no interactive surface exists.
#[derive(Default)]
pub struct NullAuthPrompt;

impl AuthPrompt for NullAuthPrompt {
    fn open(&self, url: &str) {
        tracing::info!(url, "authorization required; no interactive prompt available");
    }

    fn close(&self) {}
}
