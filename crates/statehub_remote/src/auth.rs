//! Seams to the security and application-context collaborators.

use parking_lot::RwLock;
use serde_json::Value;

/// Supplies authentication state and tokens for remote calls.
///
/// The queue gates on this: while `calls_require_token()` is true and no
/// token is held, nothing leaves the queue.
pub trait AuthProvider: Send + Sync {
    /// Whether calls must carry a token at all.
    fn calls_require_token(&self) -> bool;

    /// Whether a token is currently held.
    fn has_token(&self) -> bool;

    /// Returns the current token, if any.
    fn token(&self) -> Option<String>;

    /// Asks the collaborator to obtain a fresh token.
    ///
    /// Called on a 403-class response before the request is retried.
    fn refresh_token(&self);

    /// Returns the signed-in username, if any.
    fn logged_in_username(&self) -> Option<String>;
}

/// Mutable in-process auth state, for tests and simple deployments.
pub struct StaticAuth {
    require_token: bool,
    state: RwLock<AuthState>,
}

#[derive(Default)]
struct AuthState {
    token: Option<String>,
    username: Option<String>,
    refreshes: u32,
}

impl StaticAuth {
    /// Creates a provider that never requires a token.
    #[must_use]
    pub fn open() -> Self {
        Self {
            require_token: false,
            state: RwLock::new(AuthState::default()),
        }
    }

    /// Creates a provider that requires a token before calls proceed.
    #[must_use]
    pub fn requiring_token() -> Self {
        Self {
            require_token: true,
            state: RwLock::new(AuthState::default()),
        }
    }

    /// Installs a token and username.
    pub fn sign_in(&self, username: impl Into<String>, token: impl Into<String>) {
        let mut state = self.state.write();
        state.username = Some(username.into());
        state.token = Some(token.into());
    }

    /// Drops the token and username.
    pub fn sign_out(&self) {
        let mut state = self.state.write();
        state.username = None;
        state.token = None;
    }

    /// Returns how many times a refresh was requested.
    #[must_use]
    pub fn refresh_count(&self) -> u32 {
        self.state.read().refreshes
    }
}

impl AuthProvider for StaticAuth {
    fn calls_require_token(&self) -> bool {
        self.require_token
    }

    fn has_token(&self) -> bool {
        self.state.read().token.is_some()
    }

    fn token(&self) -> Option<String> {
        self.state.read().token.clone()
    }

    fn refresh_token(&self) {
        let mut state = self.state.write();
        state.refreshes += 1;
        state.token = Some(format!("refreshed-{}", state.refreshes));
    }

    fn logged_in_username(&self) -> Option<String> {
        self.state.read().username.clone()
    }
}

/// Supplies the application context attached to remote calls.
///
/// The context scopes requests to a session or tenant; it is merged into
/// write bodies and carried as a header on reads.
pub trait ContextSupplier: Send + Sync {
    /// Returns the context payload, if any.
    fn context(&self) -> Option<Value>;
}

/// A fixed context payload.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    value: Option<Value>,
}

impl StaticContext {
    /// Creates a supplier with a fixed payload.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self { value: Some(value) }
    }

    /// Creates a supplier with no context.
    #[must_use]
    pub fn empty() -> Self {
        Self { value: None }
    }
}

impl ContextSupplier for StaticContext {
    fn context(&self) -> Option<Value> {
        self.value.clone()
    }
}
