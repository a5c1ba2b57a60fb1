//! Token authentication boundary.
//!
//! The relay treats identity as opaque: the authenticator either hands back
//! an [`Identity`] or rejects the session. Token formats, key material, and
//! account lookups all live behind this trait.

use async_trait::async_trait;

use agora_relay::Identity;

/// Verifies the token from a client's `connect` frame.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a token to an identity, or `None` to reject the session.
    async fn authenticate(&self, token: Option<&str>) -> Option<Identity>;
}

/// Accepts every session. Tokenless clients become `"anonymous"`.
///
/// The default for public read-only deployments, where subscriptions carry
/// no per-user authorization.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, token: Option<&str>) -> Option<Identity> {
        Some(Identity::new(token.unwrap_or("anonymous")))
    }
}
