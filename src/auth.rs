//! Auth context: the signed-in user and token, observed reactively.
//!
//! Token persistence lives outside this crate. The core only reads the
//! current value and subscribes to changes so it can recompute "by me" flags
//! and drop stale windows on login/logout.

use tokio::sync::watch;
use tracing::info;

use crate::entity::UserId;

/// Current authentication state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub user_id: Option<UserId>,
    pub token: Option<String>,
}

impl AuthState {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            token: Some(token.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Injected auth collaborator.
pub trait AuthContext: Send + Sync {
    fn current(&self) -> AuthState;

    fn subscribe(&self) -> watch::Receiver<AuthState>;
}

/// Watch-backed auth context owned by the embedding application.
#[derive(Debug)]
pub struct SharedAuth {
    state: watch::Sender<AuthState>,
}

impl SharedAuth {
    pub fn new(initial: AuthState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn anonymous() -> Self {
        Self::new(AuthState::anonymous())
    }

    pub fn login(&self, user_id: UserId, token: impl Into<String>) {
        info!(user_id, "Signed in");
        self.state.send_replace(AuthState::signed_in(user_id, token));
    }

    pub fn logout(&self) {
        info!("Signed out");
        self.state.send_replace(AuthState::anonymous());
    }
}

impl AuthContext for SharedAuth {
    fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_login_and_logout() {
        let auth = SharedAuth::anonymous();
        let mut rx = auth.subscribe();
        assert!(!auth.current().is_authenticated());

        auth.login(7, "secret");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().user_id, Some(7));

        auth.logout();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), AuthState::anonymous());
    }
}
