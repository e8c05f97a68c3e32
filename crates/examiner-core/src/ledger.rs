//! Session entitlement ledger
//!
//! Tracks how many submissions the current identity has left:
//! - Anonymous identities are metered against a durable local counter
//! - The remote usage count, when reachable, supersedes any local value
//! - Signing in from an anonymous session links the anonymous usage to the
//!   new identity before the first authoritative fetch
//!
//! Every fetch is tagged with the identity epoch it was issued under. A
//! result that arrives after the identity changed is discarded.
//!
//! Network failures never surface from the ledger; it degrades to the last
//! known value, the local cache, or an unknown remaining allowance.

use crate::config::{ExaminerConfig, UnresolvedGatePolicy};
use crate::error::{GateError, Result};
use crate::identity::{Identity, IdentityKind, IdentityTransition};
use crate::remote::{ExaminerApi, UsageResponse};
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Store key holding the anonymous remaining allowance
pub const ANONYMOUS_REMAINING_KEY: &str = "anonymous_remaining";

/// Which value currently governs gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitlementSource {
    /// No value yet (identity unresolved, or authenticated fetch pending/failed)
    Unresolved,
    /// Durable local counter (anonymous only)
    LocalCache,
    /// Usage fetched from the backend
    RemoteAuthoritative,
}

/// Allowance bookkeeping for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementState {
    /// Allowance for the period
    pub allowance_max: u32,
    /// Submissions counted so far
    pub used: u32,
    /// Governing source
    pub source: EntitlementSource,
    /// Time of the last authoritative fetch
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl EntitlementState {
    fn unresolved(allowance_max: u32) -> Self {
        Self {
            allowance_max,
            used: 0,
            source: EntitlementSource::Unresolved,
            last_synced_at: None,
        }
    }

    fn local(allowance_max: u32, remaining: u32) -> Self {
        Self {
            allowance_max,
            used: allowance_max.saturating_sub(remaining),
            source: EntitlementSource::LocalCache,
            last_synced_at: None,
        }
    }

    fn remote(allowance_max: u32, usage: UsageResponse) -> Self {
        Self {
            allowance_max: usage.limit.unwrap_or(allowance_max),
            used: usage.used,
            source: EntitlementSource::RemoteAuthoritative,
            last_synced_at: Some(Utc::now()),
        }
    }

    /// Remaining allowance, never negative; `None` while unresolved
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> Option<u32> {
        match self.source {
            EntitlementSource::Unresolved => None,
            _ => Some(self.allowance_max.saturating_sub(self.used)),
        }
    }

    /// Check if the remaining allowance is known
    #[inline]
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.source != EntitlementSource::Unresolved
    }
}

/// Outcome of the gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateDecision {
    /// Submission may proceed
    Allow,
    /// Allowance exhausted
    Deny,
}

impl GateDecision {
    /// Check if the decision allows
    #[inline]
    #[must_use]
    pub fn is_allow(self) -> bool {
        self == Self::Allow
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerPolicy {
    anonymous_allowance: u32,
    authenticated_allowance: u32,
    anonymous_server_tracking: bool,
    unresolved_gate: UnresolvedGatePolicy,
}

impl LedgerPolicy {
    fn allowance_for(&self, kind: IdentityKind) -> u32 {
        match kind {
            IdentityKind::Authenticated => self.authenticated_allowance,
            IdentityKind::Unresolved | IdentityKind::Anonymous => self.anonymous_allowance,
        }
    }

    fn tracks_remotely(&self, kind: IdentityKind) -> bool {
        match kind {
            IdentityKind::Authenticated => true,
            IdentityKind::Anonymous => self.anonymous_server_tracking,
            IdentityKind::Unresolved => false,
        }
    }
}

#[derive(Debug)]
struct LedgerInner {
    identity: Identity,
    state: EntitlementState,
    /// Bumped on every identity change; fetch results must match it
    epoch: u64,
    /// An unresolved pass was consumed under `AllowOnce`
    unresolved_pass_taken: bool,
    /// Units allowed while unresolved, charged when the local counter commits
    provisional: u32,
}

/// Remaining-allowance ledger for the session identity
pub struct EntitlementLedger {
    policy: LedgerPolicy,
    api: Arc<dyn ExaminerApi>,
    store: Arc<dyn KeyValueStore>,
    inner: Mutex<LedgerInner>,
}

impl std::fmt::Debug for EntitlementLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementLedger")
            .field("policy", &self.policy)
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

impl EntitlementLedger {
    /// Create ledger; the state stays unresolved until [`Self::initialize`]
    #[must_use]
    pub fn new(
        config: &ExaminerConfig,
        api: Arc<dyn ExaminerApi>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let policy = LedgerPolicy {
            anonymous_allowance: config.anonymous_allowance,
            authenticated_allowance: config.authenticated_allowance,
            anonymous_server_tracking: config.anonymous_server_tracking,
            unresolved_gate: config.unresolved_gate_policy,
        };
        Self {
            inner: Mutex::new(LedgerInner {
                identity: Identity::Unresolved,
                state: EntitlementState::unresolved(policy.anonymous_allowance),
                epoch: 0,
                unresolved_pass_taken: false,
                provisional: 0,
            }),
            policy,
            api,
            store,
        }
    }

    /// Current state snapshot
    #[inline]
    #[must_use]
    pub fn state(&self) -> EntitlementState {
        self.inner.lock().state.clone()
    }

    /// Remaining allowance, `None` while unresolved
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> Option<u32> {
        self.inner.lock().state.remaining()
    }

    /// Identity the ledger is metering
    #[inline]
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.inner.lock().identity.clone()
    }

    /// Establish state for `identity`
    ///
    /// Fetches remote usage when the identity is tracked remotely. On failure,
    /// anonymous identities fall back to the local cache and authenticated
    /// identities stay unresolved.
    pub async fn initialize(&self, identity: Identity) -> EntitlementState {
        let kind = identity.kind();
        let epoch = self.reset(identity.clone());
        tracing::debug!(identity = %kind, epoch, "Initializing ledger");

        if self.policy.tracks_remotely(kind) {
            match self.fetch_remote(&identity, epoch).await {
                Ok(_) => return self.state(),
                Err(e) => tracing::warn!(identity = %kind, "Usage fetch failed, degrading: {}", e),
            }
        }

        if kind == IdentityKind::Anonymous {
            self.load_local(epoch);
        }
        self.state()
    }

    /// Count one submission against the allowance
    ///
    /// The anonymous counter is persisted before returning. For remotely
    /// tracked identities the new value is provisional until [`Self::resync`].
    pub fn decrement(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        self.decrement_locked(&mut inner)
    }

    /// Check the gate without consuming allowance
    #[must_use]
    pub fn would_allow(&self) -> GateDecision {
        let inner = self.inner.lock();
        self.decide(&inner)
    }

    /// Gate a submission, consuming one unit of allowance when allowed
    ///
    /// Denies iff the remaining allowance is known and zero. While it is
    /// unknown the configured [`UnresolvedGatePolicy`] applies.
    pub fn gate(&self) -> GateDecision {
        let mut inner = self.inner.lock();
        let decision = self.decide(&inner);

        match decision {
            GateDecision::Allow => {
                if !inner.state.is_resolved() {
                    inner.unresolved_pass_taken = true;
                }
                self.decrement_locked(&mut inner);
            }
            GateDecision::Deny => {
                tracing::info!(
                    allowance_max = inner.state.allowance_max,
                    used = inner.state.used,
                    "Gate denied"
                );
            }
        }
        decision
    }

    /// Gate as a `Result`
    ///
    /// # Errors
    /// `GateError::AllowanceExhausted` when denied
    pub fn admit(&self) -> std::result::Result<(), GateError> {
        match self.gate() {
            GateDecision::Allow => Ok(()),
            GateDecision::Deny => Err(GateError::AllowanceExhausted {
                allowance_max: self.inner.lock().state.allowance_max,
            }),
        }
    }

    /// Overwrite local state with the remote count
    ///
    /// Remote wins over optimistic and cached values. On failure the last
    /// known value is kept.
    pub async fn resync(&self) -> EntitlementState {
        let (identity, epoch) = {
            let inner = self.inner.lock();
            (inner.identity.clone(), inner.epoch)
        };
        let kind = identity.kind();

        if !self.policy.tracks_remotely(kind) {
            tracing::debug!(identity = %kind, "Resync skipped, identity not tracked remotely");
            return self.state();
        }

        if let Err(e) = self.fetch_remote(&identity, epoch).await {
            tracing::warn!(identity = %kind, "Resync failed, keeping last known value: {}", e);
        }
        self.state()
    }

    /// React to an identity change
    ///
    /// Anonymous → authenticated links anonymous usage exactly once, then
    /// fetches usage for the new identity whatever the link outcome. Any
    /// other change re-initializes.
    pub async fn on_identity_transition(&self, transition: IdentityTransition) -> EntitlementState {
        if !transition.is_sign_in_from_anonymous() {
            return self.initialize(transition.to).await;
        }

        let identity = transition.to;
        let epoch = self.reset(identity.clone());
        let subject = identity.subject().unwrap_or_default().to_string();

        match identity.credential().await {
            Ok(Some(credential)) => match self.api.link(credential).await {
                Ok(()) => tracing::info!(subject = %subject, "Linked anonymous usage"),
                Err(e) => tracing::warn!(subject = %subject, "Link failed: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(subject = %subject, "No credential for link: {}", e),
        }

        if let Err(e) = self.fetch_remote(&identity, epoch).await {
            tracing::warn!(subject = %subject, "Usage fetch after sign-in failed: {}", e);
        }
        self.state()
    }

    /// Switch to `identity` with an unresolved state, returning the new epoch
    ///
    /// Provisional units carry over while nothing has resolved yet and the
    /// next identity is not authenticated; remote tracking recovers them otherwise.
    fn reset(&self, identity: Identity) -> u64 {
        let mut inner = self.inner.lock();
        let previous = inner.identity.kind();
        let same_principal = previous == IdentityKind::Unresolved || previous == identity.kind();
        let carried = !inner.state.is_resolved()
            && same_principal
            && identity.kind() != IdentityKind::Authenticated;
        if !carried {
            inner.provisional = 0;
        }
        inner.epoch += 1;
        inner.state = EntitlementState::unresolved(self.policy.allowance_for(identity.kind()));
        inner.identity = identity;
        inner.unresolved_pass_taken = false;
        inner.epoch
    }

    /// Fetch usage and commit it if the identity has not changed meanwhile
    ///
    /// Returns whether the result was committed.
    async fn fetch_remote(&self, identity: &Identity, epoch: u64) -> Result<bool> {
        let credential = identity.credential().await?;
        let usage = self.api.usage(credential).await?;

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            tracing::debug!(epoch, current = inner.epoch, "Discarding stale usage");
            return Ok(false);
        }

        let state = EntitlementState::remote(self.policy.allowance_for(identity.kind()), usage);
        tracing::info!(
            used = state.used,
            allowance_max = state.allowance_max,
            "Usage synced from remote"
        );
        inner.state = state;
        inner.unresolved_pass_taken = false;
        inner.provisional = 0;

        if identity.kind() == IdentityKind::Anonymous {
            self.persist(&inner.state);
        }
        Ok(true)
    }

    fn load_local(&self, epoch: u64) {
        let max = self.policy.anonymous_allowance;
        let remaining = match self.store.get(ANONYMOUS_REMAINING_KEY) {
            Ok(Some(raw)) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Corrupt allowance cache, using default");
                max
            }),
            Ok(None) => max,
            Err(e) => {
                tracing::warn!("Allowance cache unreadable, using default: {}", e);
                max
            }
        };

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.state = EntitlementState::local(max, remaining.min(max));
        tracing::info!(remaining = remaining.min(max), "Allowance loaded from local cache");

        let provisional = std::mem::take(&mut inner.provisional);
        if provisional > 0 {
            inner.state.used = inner.state.used.saturating_add(provisional);
            self.persist(&inner.state);
            tracing::info!(
                provisional,
                remaining = ?inner.state.remaining(),
                "Charged submissions made while unresolved"
            );
        }
    }

    fn decide(&self, inner: &LedgerInner) -> GateDecision {
        match inner.state.remaining() {
            Some(0) => GateDecision::Deny,
            Some(_) => GateDecision::Allow,
            None => match self.policy.unresolved_gate {
                UnresolvedGatePolicy::Allow => GateDecision::Allow,
                UnresolvedGatePolicy::AllowOnce if !inner.unresolved_pass_taken => {
                    GateDecision::Allow
                }
                UnresolvedGatePolicy::AllowOnce | UnresolvedGatePolicy::Deny => GateDecision::Deny,
            },
        }
    }

    fn decrement_locked(&self, inner: &mut LedgerInner) -> Option<u32> {
        inner.state.used = inner.state.used.saturating_add(1);
        if !inner.state.is_resolved() {
            inner.provisional = inner.provisional.saturating_add(1);
        }
        let remaining = inner.state.remaining();

        if inner.identity.kind() == IdentityKind::Anonymous && inner.state.is_resolved() {
            self.persist(&inner.state);
        }
        tracing::debug!(used = inner.state.used, remaining = ?remaining, "Allowance decremented");
        remaining
    }

    fn persist(&self, state: &EntitlementState) {
        let Some(remaining) = state.remaining() else {
            return;
        };
        if let Err(e) = self.store.set(ANONYMOUS_REMAINING_KEY, &remaining.to_string()) {
            tracing::warn!("Failed to persist allowance: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExaminerError;
    use crate::identity::StaticCredential;
    use crate::remote::MockExaminerApi;
    use crate::store::MemoryStore;
    use mockall::Sequence;
    use proptest::prelude::*;

    fn config() -> ExaminerConfig {
        ExaminerConfig::new()
            .with_anonymous_allowance(3)
            .with_authenticated_allowance(10)
    }

    fn build_ledger(
        config: &ExaminerConfig,
        api: MockExaminerApi,
    ) -> (EntitlementLedger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = EntitlementLedger::new(config, Arc::new(api), store.clone());
        (ledger, store)
    }

    fn user(subject: &str) -> Identity {
        Identity::authenticated(StaticCredential::new(subject, format!("token-{subject}")))
    }

    #[tokio::test]
    async fn anonymous_defaults_to_max_without_cache() {
        let (ledger, _) = build_ledger(&config(), MockExaminerApi::new());
        let state = ledger.initialize(Identity::Anonymous).await;

        assert_eq!(state.source, EntitlementSource::LocalCache);
        assert_eq!(state.remaining(), Some(3));
    }

    #[tokio::test]
    async fn anonymous_reads_cached_remaining() {
        let (ledger, store) = build_ledger(&config(), MockExaminerApi::new());
        store.set(ANONYMOUS_REMAINING_KEY, "1").unwrap();

        let state = ledger.initialize(Identity::Anonymous).await;
        assert_eq!(state.remaining(), Some(1));
        assert_eq!(state.used, 2);
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_max() {
        let (ledger, store) = build_ledger(&config(), MockExaminerApi::new());
        store.set(ANONYMOUS_REMAINING_KEY, "lots").unwrap();

        let state = ledger.initialize(Identity::Anonymous).await;
        assert_eq!(state.remaining(), Some(3));
    }

    #[tokio::test]
    async fn cached_value_above_max_is_clamped() {
        let (ledger, store) = build_ledger(&config(), MockExaminerApi::new());
        store.set(ANONYMOUS_REMAINING_KEY, "99").unwrap();

        assert_eq!(ledger.initialize(Identity::Anonymous).await.remaining(), Some(3));
    }

    #[tokio::test]
    async fn anonymous_tracking_prefers_remote() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .withf(|credential| credential.is_none())
            .times(1)
            .returning(|_| Ok(UsageResponse::used(1)));

        let config = config().with_anonymous_server_tracking(true);
        let (ledger, store) = build_ledger(&config, api);
        store.set(ANONYMOUS_REMAINING_KEY, "3").unwrap();

        let state = ledger.initialize(Identity::Anonymous).await;
        assert_eq!(state.source, EntitlementSource::RemoteAuthoritative);
        assert_eq!(state.remaining(), Some(2));
        assert!(state.last_synced_at.is_some());
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn anonymous_tracking_failure_falls_back_to_cache() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .returning(|_| Err(ExaminerError::network("unreachable")));

        let config = config().with_anonymous_server_tracking(true);
        let (ledger, store) = build_ledger(&config, api);
        store.set(ANONYMOUS_REMAINING_KEY, "2").unwrap();

        let state = ledger.initialize(Identity::Anonymous).await;
        assert_eq!(state.source, EntitlementSource::LocalCache);
        assert_eq!(state.remaining(), Some(2));
    }

    #[tokio::test]
    async fn authenticated_fetch_failure_is_unknown() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .returning(|_| Err(ExaminerError::network("unreachable")));

        let (ledger, _) = build_ledger(&config(), api);
        let state = ledger.initialize(user("u1")).await;

        assert_eq!(state.source, EntitlementSource::Unresolved);
        assert_eq!(state.remaining(), None);
        assert_eq!(ledger.gate(), GateDecision::Allow);
        assert_eq!(ledger.gate(), GateDecision::Allow);
    }

    #[tokio::test]
    async fn authenticated_uses_remote_limit_when_given() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .withf(|credential| credential.as_ref().map(|c| c.token()) == Some("token-u1"))
            .returning(|_| Ok(UsageResponse { used: 4, limit: Some(25) }));

        let (ledger, _) = build_ledger(&config(), api);
        let state = ledger.initialize(user("u1")).await;
        assert_eq!(state.allowance_max, 25);
        assert_eq!(state.remaining(), Some(21));
    }

    #[tokio::test]
    async fn gate_denies_at_zero_without_touching_ledger() {
        let (ledger, store) = build_ledger(&config(), MockExaminerApi::new());
        store.set(ANONYMOUS_REMAINING_KEY, "0").unwrap();
        ledger.initialize(Identity::Anonymous).await;

        assert_eq!(ledger.gate(), GateDecision::Deny);
        assert_eq!(ledger.state().used, 3);
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap().as_deref(), Some("0"));
        assert_eq!(
            ledger.admit(),
            Err(GateError::AllowanceExhausted { allowance_max: 3 })
        );
    }

    #[tokio::test]
    async fn gate_allow_decrements_and_persists() {
        let (ledger, store) = build_ledger(&config(), MockExaminerApi::new());
        ledger.initialize(Identity::Anonymous).await;

        assert_eq!(ledger.would_allow(), GateDecision::Allow);
        assert_eq!(ledger.remaining(), Some(3));

        assert_eq!(ledger.gate(), GateDecision::Allow);
        assert_eq!(ledger.remaining(), Some(2));
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn allow_once_policy_permits_single_unresolved_pass() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .returning(|_| Err(ExaminerError::network("unreachable")));

        let config = config().with_unresolved_gate_policy(UnresolvedGatePolicy::AllowOnce);
        let (ledger, _) = build_ledger(&config, api);
        ledger.initialize(user("u1")).await;

        assert_eq!(ledger.gate(), GateDecision::Allow);
        assert_eq!(ledger.gate(), GateDecision::Deny);
    }

    #[tokio::test]
    async fn deny_policy_blocks_unresolved() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .returning(|_| Err(ExaminerError::network("unreachable")));

        let config = config().with_unresolved_gate_policy(UnresolvedGatePolicy::Deny);
        let (ledger, _) = build_ledger(&config, api);
        ledger.initialize(user("u1")).await;

        assert_eq!(ledger.gate(), GateDecision::Deny);
    }

    #[tokio::test]
    async fn resync_overwrites_optimistic_value() {
        let mut api = MockExaminerApi::new();
        let mut seq = Sequence::new();
        api.expect_usage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(UsageResponse::used(1)));
        api.expect_usage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(UsageResponse::used(1)));

        let (ledger, _) = build_ledger(&config(), api);
        ledger.initialize(user("u1")).await;

        ledger.gate();
        ledger.gate();
        assert_eq!(ledger.remaining(), Some(7));

        let state = ledger.resync().await;
        assert_eq!(state.used, 1);
        assert_eq!(state.remaining(), Some(9));
    }

    #[tokio::test]
    async fn resync_failure_keeps_last_known() {
        let mut api = MockExaminerApi::new();
        let mut seq = Sequence::new();
        api.expect_usage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(UsageResponse::used(5)));
        api.expect_usage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ExaminerError::network("unreachable")));

        let (ledger, _) = build_ledger(&config(), api);
        ledger.initialize(user("u1")).await;
        ledger.gate();

        let state = ledger.resync().await;
        assert_eq!(state.used, 6);
        assert_eq!(state.source, EntitlementSource::RemoteAuthoritative);
    }

    #[tokio::test]
    async fn resync_is_noop_for_untracked_anonymous() {
        let (ledger, _) = build_ledger(&config(), MockExaminerApi::new());
        ledger.initialize(Identity::Anonymous).await;
        ledger.gate();

        assert_eq!(ledger.resync().await.remaining(), Some(2));
    }

    #[tokio::test]
    async fn sign_in_links_once_then_fetches() {
        let mut api = MockExaminerApi::new();
        let mut seq = Sequence::new();
        api.expect_link()
            .withf(|credential| credential.token() == "token-u1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        api.expect_usage()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(UsageResponse::used(2)));

        let (ledger, store) = build_ledger(&config(), api);
        store.set(ANONYMOUS_REMAINING_KEY, "1").unwrap();
        ledger.initialize(Identity::Anonymous).await;

        let state = ledger
            .on_identity_transition(IdentityTransition {
                from: Identity::Anonymous,
                to: user("u1"),
            })
            .await;

        assert_eq!(state.source, EntitlementSource::RemoteAuthoritative);
        assert_eq!(state.allowance_max, 10);
        assert_eq!(state.remaining(), Some(8));
        assert_eq!(ledger.identity().subject(), Some("u1"));
    }

    #[tokio::test]
    async fn sign_in_fetches_even_when_link_fails() {
        let mut api = MockExaminerApi::new();
        api.expect_link()
            .times(1)
            .returning(|_| Err(ExaminerError::network("link down")));
        api.expect_usage()
            .times(1)
            .returning(|_| Ok(UsageResponse::used(0)));

        let (ledger, _) = build_ledger(&config(), api);
        ledger.initialize(Identity::Anonymous).await;

        let state = ledger
            .on_identity_transition(IdentityTransition {
                from: Identity::Anonymous,
                to: user("u1"),
            })
            .await;
        assert_eq!(state.remaining(), Some(10));
    }

    #[tokio::test]
    async fn sign_out_returns_to_local_cache_without_link() {
        let mut api = MockExaminerApi::new();
        api.expect_link().never();
        api.expect_usage().returning(|_| Ok(UsageResponse::used(9)));

        let (ledger, store) = build_ledger(&config(), api);
        store.set(ANONYMOUS_REMAINING_KEY, "2").unwrap();
        ledger.initialize(user("u1")).await;

        let state = ledger
            .on_identity_transition(IdentityTransition {
                from: user("u1"),
                to: Identity::Anonymous,
            })
            .await;
        assert_eq!(state.source, EntitlementSource::LocalCache);
        assert_eq!(state.remaining(), Some(2));
    }

    #[tokio::test]
    async fn gate_before_initialize_is_charged_to_local_cache() {
        let (ledger, store) = build_ledger(&config(), MockExaminerApi::new());

        assert_eq!(ledger.gate(), GateDecision::Allow);
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap(), None);

        let state = ledger.initialize(Identity::Anonymous).await;
        assert_eq!(state.source, EntitlementSource::LocalCache);
        assert_eq!(state.remaining(), Some(2));
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn unresolved_charge_applies_on_top_of_cached_value() {
        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .returning(|_| Err(ExaminerError::network("unreachable")));

        let config = config().with_anonymous_server_tracking(true);
        let (ledger, store) = build_ledger(&config, api);
        store.set(ANONYMOUS_REMAINING_KEY, "2").unwrap();

        ledger.gate();
        ledger.gate();
        let state = ledger.initialize(Identity::Anonymous).await;
        assert_eq!(state.remaining(), Some(0));
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap().as_deref(), Some("0"));

        assert_eq!(ledger.gate(), GateDecision::Deny);
    }

    #[tokio::test]
    async fn unresolved_charge_dropped_for_remote_identity() {
        let mut api = MockExaminerApi::new();
        api.expect_usage().returning(|_| Ok(UsageResponse::used(4)));

        let (ledger, store) = build_ledger(&config(), api);
        ledger.gate();

        let state = ledger.initialize(user("u1")).await;
        assert_eq!(state.remaining(), Some(6));
        assert_eq!(store.get(ANONYMOUS_REMAINING_KEY).unwrap(), None);

        let mut api = MockExaminerApi::new();
        api.expect_usage()
            .returning(|_| Err(ExaminerError::network("unreachable")));
        let ledger = EntitlementLedger::new(&config(), Arc::new(api), store.clone());
        ledger.initialize(user("u1")).await;
        ledger.gate();

        let state = ledger
            .on_identity_transition(IdentityTransition {
                from: user("u1"),
                to: Identity::Anonymous,
            })
            .await;
        assert_eq!(state.remaining(), Some(3));
    }

    #[tokio::test]
    async fn unresolved_identity_stays_unresolved() {
        let (ledger, _) = build_ledger(&config(), MockExaminerApi::new());
        let state = ledger.initialize(Identity::Unresolved).await;
        assert!(!state.is_resolved());
    }

    #[test]
    fn remaining_never_negative() {
        let state = EntitlementState {
            allowance_max: 3,
            used: 7,
            source: EntitlementSource::RemoteAuthoritative,
            last_synced_at: None,
        };
        assert_eq!(state.remaining(), Some(0));
    }

    proptest! {
        #[test]
        fn prop_anonymous_decrement_monotonic_and_persisted(
            max in 1u32..20,
            steps in 0usize..40,
        ) {
            let config = ExaminerConfig::new().with_anonymous_allowance(max);
            let (ledger, store) = build_ledger(&config, MockExaminerApi::new());
            tokio_test::block_on(ledger.initialize(Identity::Anonymous));

            let mut previous = ledger.remaining().unwrap();
            prop_assert_eq!(previous, max);

            for _ in 0..steps {
                let remaining = ledger.decrement().unwrap();
                prop_assert!(remaining <= previous);

                let persisted: u32 = store
                    .get(ANONYMOUS_REMAINING_KEY)
                    .unwrap()
                    .unwrap()
                    .parse()
                    .unwrap();
                prop_assert_eq!(persisted, remaining);
                prop_assert_eq!(ledger.remaining(), Some(remaining));
                previous = remaining;
            }
        }
    }
}
