//! Examiner Core - client side of the AI paper-marking service
//!
//! Provides:
//! - An entitlement ledger metering submissions per identity, reconciling a
//!   durable local counter with the authoritative remote usage count
//! - A submission controller that validates, gates and submits document pairs
//! - An asynchronous first-page preview renderer with a per-slot generation guard
//! - An identity observer and the session context tying them together
//!
//! # Example
//!
//! ```rust,ignore
//! use examiner_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> examiner_core::Result<()> {
//! let config = ExaminerConfig::new().with_env_overrides();
//! let identity = Arc::new(ManualIdentityProvider::new(Identity::Anonymous));
//! let session = SessionContext::start(
//!     &config,
//!     SessionCollaborators {
//!         api: Arc::new(HttpExaminerApi::new(&config)?),
//!         store: Arc::new(FileStore::open(config.resolved_store_dir())?),
//!         identity,
//!         rasterizer: Arc::new(PdftoppmRasterizer::new()),
//!     },
//! )
//! .await?;
//!
//! session.load_example(DocumentRole::Primary).await?;
//! session.load_example(DocumentRole::Reference).await?;
//! if let SubmitOutcome::Marked(result) = session.controller().submit().await? {
//!     println!("Total: {}", result.total);
//! }
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod preview;
pub mod raster;
pub mod remote;
pub mod session;
pub mod store;
pub mod submission;
pub mod transcript;

// Re-exports for convenience
pub use config::{ExaminerConfig, ExampleConfig, UnresolvedGatePolicy};
pub use document::{Document, DocumentRole, ExampleAssets};
pub use error::{
    ErrorKind, ExaminerError, GateError, Notice, NoticeLevel, Result, ValidationError,
};
pub use identity::{
    Credential, CredentialProvider, Identity, IdentityKind, IdentityObserver, IdentityProvider,
    IdentitySubscription, IdentityTransition, ManualIdentityProvider, StaticCredential,
};
pub use ledger::{EntitlementLedger, EntitlementSource, EntitlementState, GateDecision};
pub use preview::{PreviewRenderer, RenderOutcome, RenderTask, SlotContent, SlotId, SlotUpdate};
pub use raster::{PdftoppmRasterizer, RasterPage, Rasterizer};
pub use remote::{
    ExaminerApi, HttpExaminerApi, MarkedQuestion, MarkingResult, MarkingSubmission, Score,
    UsageResponse,
};
pub use session::{SessionCollaborators, SessionContext};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use submission::{SubmissionController, SubmissionPhase, SubmissionSnapshot, SubmitOutcome};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Examiner Core
    pub use crate::{
        Document, DocumentRole, EntitlementLedger, ExaminerApi, ExaminerConfig, ExaminerError,
        FileStore, HttpExaminerApi, Identity, ManualIdentityProvider, PdftoppmRasterizer,
        PreviewRenderer, SessionCollaborators, SessionContext, SubmissionController,
        SubmissionPhase, SubmitOutcome,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
