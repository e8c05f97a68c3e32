//! Identity observation
//!
//! Wraps an external identity provider and reports transitions between
//! unresolved, anonymous and authenticated identities. Every publication is
//! queued for each subscriber, so back-to-back changes are seen in order.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bearer credential presented to the remote interfaces
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token
    #[inline]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token
    #[inline]
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Source of credentials for an authenticated identity
///
/// Providers may refresh tokens, so the credential is fetched per call.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Stable subject identifier (user id)
    fn subject(&self) -> &str;

    /// Current credential
    async fn credential(&self) -> Result<Credential>;
}

/// Credential provider for a fixed token
#[derive(Debug, Clone)]
pub struct StaticCredential {
    subject: String,
    credential: Credential,
}

impl StaticCredential {
    /// Create provider
    #[inline]
    pub fn new(subject: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            credential: Credential::bearer(token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn credential(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

/// Who is using the session
#[derive(Debug, Clone, Default)]
pub enum Identity {
    /// Provider has not reported yet
    #[default]
    Unresolved,
    /// No signed-in user
    Anonymous,
    /// Signed-in user
    Authenticated(Arc<dyn CredentialProvider>),
}

impl Identity {
    /// Authenticated identity backed by `provider`
    #[inline]
    pub fn authenticated(provider: impl CredentialProvider + 'static) -> Self {
        Self::Authenticated(Arc::new(provider))
    }

    /// Identity kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Unresolved => IdentityKind::Unresolved,
            Self::Anonymous => IdentityKind::Anonymous,
            Self::Authenticated(_) => IdentityKind::Authenticated,
        }
    }

    /// Subject of an authenticated identity
    #[inline]
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Authenticated(provider) => Some(provider.subject()),
            _ => None,
        }
    }

    /// Credential to attach to remote calls, if any
    pub async fn credential(&self) -> Result<Option<Credential>> {
        match self {
            Self::Authenticated(provider) => provider.credential().await.map(Some),
            _ => Ok(None),
        }
    }

    /// Check if two identities denote the same principal
    #[must_use]
    pub fn same_principal(&self, other: &Identity) -> bool {
        self.kind() == other.kind() && self.subject() == other.subject()
    }
}

/// Identity kind without the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// Not yet resolved
    Unresolved,
    /// Anonymous
    Anonymous,
    /// Authenticated
    Authenticated,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unresolved => "unresolved",
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

/// Identity at subscription time plus every later publication
#[derive(Debug)]
pub struct IdentitySubscription {
    /// Identity when the subscription was taken
    pub current: Identity,
    /// Publications after `current`, in order
    pub updates: mpsc::UnboundedReceiver<Identity>,
}

/// External identity provider
pub trait IdentityProvider: Send + Sync {
    /// Subscribe to identity changes
    fn subscribe(&self) -> IdentitySubscription;
}

#[derive(Debug)]
struct Subscribers {
    current: Identity,
    senders: Vec<mpsc::UnboundedSender<Identity>>,
}

/// Identity provider driven by explicit calls
#[derive(Debug)]
pub struct ManualIdentityProvider {
    inner: Mutex<Subscribers>,
}

impl ManualIdentityProvider {
    /// Create provider starting at `initial`
    #[must_use]
    pub fn new(initial: Identity) -> Self {
        Self {
            inner: Mutex::new(Subscribers {
                current: initial,
                senders: Vec::new(),
            }),
        }
    }

    /// Publish a new identity
    pub fn set(&self, identity: Identity) {
        tracing::debug!(kind = %identity.kind(), "Identity published");
        let mut inner = self.inner.lock();
        inner.senders.retain(|sender| sender.send(identity.clone()).is_ok());
        inner.current = identity;
    }

    /// Publish an authenticated identity
    pub fn sign_in(&self, provider: impl CredentialProvider + 'static) {
        self.set(Identity::authenticated(provider));
    }

    /// Publish the anonymous identity
    pub fn sign_out(&self) {
        self.set(Identity::Anonymous);
    }
}

impl Default for ManualIdentityProvider {
    fn default() -> Self {
        Self::new(Identity::Unresolved)
    }
}

impl IdentityProvider for ManualIdentityProvider {
    fn subscribe(&self) -> IdentitySubscription {
        let (sender, updates) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.senders.push(sender);
        IdentitySubscription {
            current: inner.current.clone(),
            updates,
        }
    }
}

/// A change of principal
#[derive(Debug, Clone)]
pub struct IdentityTransition {
    /// Identity before the change
    pub from: Identity,
    /// Identity after the change
    pub to: Identity,
}

impl IdentityTransition {
    /// Check if this is the anonymous → authenticated upgrade
    #[inline]
    #[must_use]
    pub fn is_sign_in_from_anonymous(&self) -> bool {
        self.from.kind() == IdentityKind::Anonymous
            && self.to.kind() == IdentityKind::Authenticated
    }
}

/// Observes an identity provider and reports principal changes
#[derive(Debug)]
pub struct IdentityObserver {
    updates: mpsc::UnboundedReceiver<Identity>,
    last: Identity,
}

impl IdentityObserver {
    /// Start observing `provider`
    #[must_use]
    pub fn new(provider: &dyn IdentityProvider) -> Self {
        let IdentitySubscription { current, updates } = provider.subscribe();
        Self {
            updates,
            last: current,
        }
    }

    /// Identity as of the last observed transition
    #[inline]
    #[must_use]
    pub fn current(&self) -> Identity {
        self.last.clone()
    }

    /// Wait for the next principal change
    ///
    /// Publications that keep the same principal (e.g. a token refresh) are
    /// skipped. Returns `None` once the provider is dropped.
    pub async fn next_transition(&mut self) -> Option<IdentityTransition> {
        loop {
            let next = self.updates.recv().await?;

            if next.same_principal(&self.last) {
                continue;
            }

            let from = std::mem::replace(&mut self.last, next.clone());
            tracing::info!(from = %from.kind(), to = %next.kind(), "Identity transition");
            return Some(IdentityTransition { from, to: next });
        }
    }
}
