//! Capture-authorization boundary.
//!
//! The permission flow that produces tokens lives outside this crate. It is
//! reached through [`AuthorizationProvider`], which turns a token into an
//! [`AuthorizedCaptureContext`]: the authorization handed to system capture
//! plus a channel that fires when the grant is revoked.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use audioloop_audio::CaptureAuthorization;
use audioloop_ipc::AuthorizationToken;

/// Errors returned by an authorization provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("authorization request timed out")]
    TimedOut,

    /// The grant was revoked before the session could use it.
    #[error("authorization was revoked")]
    Revoked,
}

/// A granted authorization and its revocation notification.
pub struct AuthorizedCaptureContext {
    authorization: CaptureAuthorization,
    revoked: Receiver<()>,
}

impl AuthorizedCaptureContext {
    pub fn new(authorization: CaptureAuthorization, revoked: Receiver<()>) -> Self {
        Self {
            authorization,
            revoked,
        }
    }

    pub fn authorization(&self) -> &CaptureAuthorization {
        &self.authorization
    }

    pub fn into_parts(self) -> (CaptureAuthorization, Receiver<()>) {
        (self.authorization, self.revoked)
    }
}

/// Provider-side handle that ends a grant.
#[derive(Clone)]
pub struct RevocationHandle {
    authorization: CaptureAuthorization,
    notify: Sender<()>,
}

impl RevocationHandle {
    /// Invalidate the authorization and notify the holder.
    pub fn revoke(&self) {
        info!("Revoking capture authorization");
        self.authorization.invalidate();
        let _ = self.notify.try_send(());
    }

    pub fn is_revoked(&self) -> bool {
        !self.authorization.is_valid()
    }
}

/// Create a fresh grant for `token`.
pub fn grant(token: AuthorizationToken) -> (AuthorizedCaptureContext, RevocationHandle) {
    let authorization = CaptureAuthorization::new(token);
    let (notify, revoked) = crossbeam_channel::bounded(1);
    (
        AuthorizedCaptureContext::new(authorization.clone(), revoked),
        RevocationHandle {
            authorization,
            notify,
        },
    )
}

/// Source of capture authorizations.
pub trait AuthorizationProvider: Send {
    /// Validate `token` and return a usable authorization.
    fn acquire(
        &mut self,
        token: &AuthorizationToken,
    ) -> Result<AuthorizedCaptureContext, AuthorizationError>;

    /// Give back an authorization at session end.
    fn release(&mut self, _authorization: &CaptureAuthorization) {}
}

#[derive(Default)]
struct ProviderState {
    denial: Option<AuthorizationError>,
    grants: Vec<RevocationHandle>,
    released: usize,
}

/// Provider that grants every token handed to it.
///
/// Clones share state, so the embedder can keep one to revoke grants while
/// the controller owns another.
#[derive(Clone, Default)]
pub struct TokenAuthorizationProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl TokenAuthorizationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `acquire` fail with `error`.
    pub fn deny_with(&self, error: AuthorizationError) {
        self.state.lock().denial = Some(error);
    }

    /// Revoke every grant still outstanding.
    pub fn revoke_all(&self) -> usize {
        let state = self.state.lock();
        let mut revoked = 0;
        for grant in state.grants.iter().filter(|g| !g.is_revoked()) {
            grant.revoke();
            revoked += 1;
        }
        revoked
    }

    /// Grants handed out and not yet released.
    pub fn grants(&self) -> usize {
        self.state.lock().grants.len()
    }

    /// Number of authorizations given back by the controller.
    pub fn released(&self) -> usize {
        self.state.lock().released
    }
}

impl AuthorizationProvider for TokenAuthorizationProvider {
    fn acquire(
        &mut self,
        token: &AuthorizationToken,
    ) -> Result<AuthorizedCaptureContext, AuthorizationError> {
        let mut state = self.state.lock();
        if let Some(error) = state.denial.clone() {
            debug!(%error, "Denying capture authorization");
            return Err(error);
        }

        let (context, handle) = grant(token.clone());
        state.grants.push(handle);
        debug!(grants = state.grants.len(), "Capture authorization granted");
        Ok(context)
    }

    fn release(&mut self, authorization: &CaptureAuthorization) {
        let mut state = self.state.lock();
        state.released += 1;
        // A released grant can no longer be revoked into a later session.
        state
            .grants
            .retain(|g| g.authorization.token() != authorization.token());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_revoke_invalidates_and_notifies() {
        let (context, handle) = grant(AuthorizationToken::new("grant"));
        assert!(context.authorization().is_valid());

        handle.revoke();
        assert!(!context.authorization().is_valid());
        let (_, revoked) = context.into_parts();
        assert_eq!(revoked.recv_timeout(Duration::from_millis(100)), Ok(()));
    }

    #[test]
    fn test_token_provider_grants_and_denies() {
        let provider = TokenAuthorizationProvider::new();
        let mut owned = provider.clone();

        let context = owned.acquire(&AuthorizationToken::new("a")).unwrap();
        assert_eq!(provider.grants(), 1);
        assert_eq!(provider.revoke_all(), 1);
        assert!(!context.authorization().is_valid());
        assert_eq!(provider.revoke_all(), 0);

        provider.deny_with(AuthorizationError::Denied("user declined".into()));
        assert_eq!(
            owned.acquire(&AuthorizationToken::new("b")).err(),
            Some(AuthorizationError::Denied("user declined".into()))
        );
    }
}
