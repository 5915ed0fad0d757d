//! Capture authorization handle shared with system capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use audioloop_ipc::AuthorizationToken;

/// Handle proving that system playback capture has been authorized.
///
/// Clones share validity: invalidating one invalidates all of them.
#[derive(Debug, Clone)]
pub struct CaptureAuthorization {
    token: AuthorizationToken,
    valid: Arc<AtomicBool>,
}

impl CaptureAuthorization {
    /// Create a valid authorization for `token`.
    pub fn new(token: AuthorizationToken) -> Self {
        Self {
            token,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn token(&self) -> &AuthorizationToken {
        &self.token
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Mark this authorization (and every clone) as no longer usable.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}
