//! Session context
//!
//! Owns the per-session components and the identity-watch task. Built once
//! at session start and torn down with [`SessionContext::shutdown`].

use crate::config::ExaminerConfig;
use crate::document::{Document, DocumentRole, ExampleAssets};
use crate::error::Result;
use crate::identity::{IdentityObserver, IdentityProvider};
use crate::ledger::EntitlementLedger;
use crate::preview::{PreviewRenderer, RenderTask};
use crate::raster::Rasterizer;
use crate::remote::ExaminerApi;
use crate::store::KeyValueStore;
use crate::submission::SubmissionController;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// External collaborators a session is built from
#[derive(Clone)]
pub struct SessionCollaborators {
    /// Usage, marking and link backend
    pub api: Arc<dyn ExaminerApi>,
    /// Durable store for the anonymous allowance
    pub store: Arc<dyn KeyValueStore>,
    /// Source of identity transitions
    pub identity: Arc<dyn IdentityProvider>,
    /// First-page renderer for previews
    pub rasterizer: Arc<dyn Rasterizer>,
}

/// Per-session component graph
pub struct SessionContext {
    ledger: Arc<EntitlementLedger>,
    controller: Arc<SubmissionController>,
    preview: Arc<PreviewRenderer>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("ledger", &self.ledger)
            .field("controller", &self.controller)
            .field("preview", &self.preview)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl SessionContext {
    /// Build the session and initialize the ledger for the current identity
    ///
    /// # Errors
    /// `ExaminerError::Config` if the example asset locations are invalid
    pub async fn start(config: &ExaminerConfig, collaborators: SessionCollaborators) -> Result<Self> {
        let SessionCollaborators {
            api,
            store,
            identity,
            rasterizer,
        } = collaborators;

        let examples = ExampleAssets::new(&config.examples, &config.api_base()?)?;
        let ledger = Arc::new(EntitlementLedger::new(config, api.clone(), store));
        let controller = Arc::new(SubmissionController::new(ledger.clone(), api).with_examples(examples));
        let preview = Arc::new(PreviewRenderer::new(rasterizer, config.preview_scale));

        let mut observer = IdentityObserver::new(identity.as_ref());
        let initial = ledger.initialize(observer.current()).await;
        tracing::info!(
            identity = %observer.current().kind(),
            remaining = ?initial.remaining(),
            "Session started"
        );

        let shutdown = CancellationToken::new();
        let watcher = {
            let ledger = ledger.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let transition = tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        next = observer.next_transition() => next,
                    };
                    let Some(transition) = transition else {
                        tracing::debug!("Identity provider closed");
                        break;
                    };
                    ledger.on_identity_transition(transition).await;
                }
            })
        };

        Ok(Self {
            ledger,
            controller,
            preview,
            shutdown,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Entitlement ledger
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<EntitlementLedger> {
        &self.ledger
    }

    /// Submission controller
    #[inline]
    #[must_use]
    pub fn controller(&self) -> &Arc<SubmissionController> {
        &self.controller
    }

    /// Preview renderer
    #[inline]
    #[must_use]
    pub fn preview(&self) -> &Arc<PreviewRenderer> {
        &self.preview
    }

    /// Select a document and start its preview
    pub fn select_document(&self, role: DocumentRole, document: Document) -> RenderTask {
        self.controller.select(role, document.clone());
        self.preview.assign(role, document)
    }

    /// Load the example for a role, select it and start its preview
    ///
    /// # Errors
    /// Any error loading the asset; the current selection is left as is
    pub async fn load_example(&self, role: DocumentRole) -> Result<RenderTask> {
        let document = self.controller.load_example(role).await?;
        Ok(self.preview.assign(role, document))
    }

    /// Load both examples concurrently
    ///
    /// # Errors
    /// The first error loading either asset
    pub async fn load_example_pair(&self) -> Result<(RenderTask, RenderTask)> {
        futures::future::try_join(
            self.load_example(DocumentRole::Primary),
            self.load_example(DocumentRole::Reference),
        )
        .await
    }

    /// Deselect a role and blank its preview
    pub fn clear_document(&self, role: DocumentRole) {
        self.controller.clear(role);
        self.preview.clear(role);
    }

    /// Stop the identity watch and cancel render tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.preview.shutdown();

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                tracing::warn!("Identity watch task failed: {}", e);
            }
        }
        tracing::info!("Session shut down");
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, ManualIdentityProvider, StaticCredential};
    use crate::ledger::EntitlementSource;
    use crate::raster::PdftoppmRasterizer;
    use crate::remote::{MockExaminerApi, UsageResponse};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn collaborators(api: MockExaminerApi, identity: Arc<ManualIdentityProvider>) -> SessionCollaborators {
        SessionCollaborators {
            api: Arc::new(api),
            store: Arc::new(MemoryStore::new()),
            identity,
            rasterizer: Arc::new(PdftoppmRasterizer::new()),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn starts_with_current_identity() {
        let provider = Arc::new(ManualIdentityProvider::new(Identity::Anonymous));
        let session = SessionContext::start(
            &ExaminerConfig::new(),
            collaborators(MockExaminerApi::new(), provider),
        )
        .await
        .unwrap();

        assert_eq!(session.ledger().state().source, EntitlementSource::LocalCache);
        assert_eq!(session.ledger().remaining(), Some(3));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn forwards_identity_transitions() {
        let mut api = MockExaminerApi::new();
        api.expect_link().times(1).returning(|_| Ok(()));
        api.expect_usage().returning(|_| Ok(UsageResponse::used(4)));

        let provider = Arc::new(ManualIdentityProvider::new(Identity::Unresolved));
        let session = SessionContext::start(&ExaminerConfig::new(), collaborators(api, provider.clone()))
            .await
            .unwrap();
        assert!(!session.ledger().state().is_resolved());

        provider.sign_out();
        wait_until(|| session.ledger().state().source == EntitlementSource::LocalCache).await;

        provider.sign_in(StaticCredential::new("u1", "tok"));
        wait_until(|| session.ledger().remaining() == Some(6)).await;

        session.shutdown().await;
    }

    #[tokio::test]
    async fn example_pair_selects_both_roles() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["paper.pdf", "scheme.pdf"] {
            std::fs::write(dir.path().join(name), b"%PDF-1.4").unwrap();
        }
        let config = ExaminerConfig {
            examples: crate::config::ExampleConfig {
                primary: dir.path().join("paper.pdf").display().to_string(),
                reference: dir.path().join("scheme.pdf").display().to_string(),
            },
            ..ExaminerConfig::new()
        };
        let provider = Arc::new(ManualIdentityProvider::new(Identity::Anonymous));
        let session = SessionContext::start(&config, collaborators(MockExaminerApi::new(), provider))
            .await
            .unwrap();

        let (primary, reference) = session.load_example_pair().await.unwrap();
        assert_eq!(primary.slot(), DocumentRole::Primary);
        assert_eq!(reference.slot(), DocumentRole::Reference);
        assert!(session.controller().validate().is_ok());
        assert_eq!(
            session.preview().document_name(DocumentRole::Reference).as_deref(),
            Some("scheme-example.pdf")
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn clear_document_blanks_both_sides() {
        let provider = Arc::new(ManualIdentityProvider::new(Identity::Anonymous));
        let session = SessionContext::start(
            &ExaminerConfig::new(),
            collaborators(MockExaminerApi::new(), provider),
        )
        .await
        .unwrap();

        let task = session.select_document(
            DocumentRole::Primary,
            Document::new("notes.txt", "text/plain", b"hi".to_vec()),
        );
        task.join().await;
        session.clear_document(DocumentRole::Primary);

        assert!(session.controller().document(DocumentRole::Primary).is_none());
        assert_eq!(session.preview().generation(DocumentRole::Primary), 2);
        session.shutdown().await;
    }
}
