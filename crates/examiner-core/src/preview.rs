//! Asynchronous document preview
//!
//! Each preview slot shows the first page of the document last assigned to
//! it. Assigning a document:
//! 1. bumps the slot's generation
//! 2. requests cancellation of the task rendering the previous generation
//! 3. spawns a render task tagged with the new generation
//!
//! Cancellation is best-effort. A completing task commits only if its
//! generation still matches the slot's; any other completion is dropped.
//! Render failures are logged and leave the slot blank.

use crate::document::{Document, DocumentRole};
use crate::error::ExaminerError;
use crate::raster::{RasterPage, Rasterizer};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Preview slot identifier
pub type SlotId = DocumentRole;

/// What a slot currently shows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SlotContent {
    /// Nothing assigned, or the last render failed
    #[default]
    Blank,
    /// A render for the current generation is in flight
    Rendering,
    /// Rendered first page
    Ready(Arc<RasterPage>),
}

impl SlotContent {
    /// Rendered page, if ready
    #[inline]
    #[must_use]
    pub fn page(&self) -> Option<&RasterPage> {
        match self {
            Self::Ready(page) => Some(page),
            _ => None,
        }
    }
}

/// Published whenever a slot's content changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUpdate {
    /// Slot that changed
    pub slot: SlotId,
    /// Generation now shown
    pub generation: u64,
}

/// How a render task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderOutcome {
    /// Page committed to the slot
    Committed,
    /// Render failed; slot left blank
    Blanked,
    /// Slot moved on; result dropped
    Discarded,
}

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    cancel: Option<CancellationToken>,
    content: SlotContent,
    document: Option<String>,
}

/// Handle to a spawned render task
#[derive(Debug)]
pub struct RenderTask {
    slot: SlotId,
    generation: u64,
    fingerprint: String,
    cancel: CancellationToken,
    handle: JoinHandle<RenderOutcome>,
}

impl RenderTask {
    /// Slot the task renders into
    #[inline]
    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Generation the task is tagged with
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fingerprint of the document being rendered
    #[inline]
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Request cancellation (best-effort)
    #[inline]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to finish
    pub async fn join(self) -> RenderOutcome {
        self.handle.await.unwrap_or_else(|e| {
            tracing::warn!(slot = %self.slot, "Render task aborted: {}", e);
            RenderOutcome::Discarded
        })
    }
}

/// Drives render tasks for the preview slots
pub struct PreviewRenderer {
    rasterizer: Arc<dyn Rasterizer>,
    scale: f32,
    slots: Arc<DashMap<SlotId, SlotState>>,
    updates: broadcast::Sender<SlotUpdate>,
}

impl std::fmt::Debug for PreviewRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewRenderer")
            .field("scale", &self.scale)
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl PreviewRenderer {
    /// Create renderer
    #[must_use]
    pub fn new(rasterizer: Arc<dyn Rasterizer>, scale: f32) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            rasterizer,
            scale,
            slots: Arc::new(DashMap::new()),
            updates,
        }
    }

    /// Subscribe to slot updates
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SlotUpdate> {
        self.updates.subscribe()
    }

    /// Assign a document to a slot and start rendering it
    ///
    /// Returns immediately; the page appears once the task commits. Must be
    /// called from within a tokio runtime.
    pub fn assign(&self, slot: SlotId, document: Document) -> RenderTask {
        let cancel = CancellationToken::new();
        let generation = {
            let mut state = self.slots.entry(slot).or_default();
            state.generation += 1;
            if let Some(previous) = state.cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            state.content = SlotContent::Rendering;
            state.document = Some(document.name().to_string());
            state.generation
        };

        let fingerprint = document.fingerprint();
        tracing::debug!(slot = %slot, generation, document = document.name(), "Render started");

        let rasterizer = self.rasterizer.clone();
        let slots = self.slots.clone();
        let updates = self.updates.clone();
        let scale = self.scale;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let result = rasterizer
                .rasterize_first_page(&document, scale, &token)
                .await;
            commit(&slots, &updates, slot, generation, result)
        });

        RenderTask {
            slot,
            generation,
            fingerprint,
            cancel,
            handle,
        }
    }

    /// Blank a slot, superseding any render in flight
    pub fn clear(&self, slot: SlotId) {
        let mut state = self.slots.entry(slot).or_default();
        state.generation += 1;
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }
        state.content = SlotContent::Blank;
        state.document = None;
        let _ = self.updates.send(SlotUpdate {
            slot,
            generation: state.generation,
        });
    }

    /// Current content of a slot
    #[must_use]
    pub fn content(&self, slot: SlotId) -> SlotContent {
        self.slots
            .get(&slot)
            .map(|state| state.content.clone())
            .unwrap_or_default()
    }

    /// Current generation of a slot (0 if never assigned)
    #[must_use]
    pub fn generation(&self, slot: SlotId) -> u64 {
        self.slots.get(&slot).map_or(0, |state| state.generation)
    }

    /// Name of the document last assigned to a slot
    #[must_use]
    pub fn document_name(&self, slot: SlotId) -> Option<String> {
        self.slots.get(&slot).and_then(|state| state.document.clone())
    }

    /// Cancel every render in flight
    pub fn shutdown(&self) {
        for mut state in self.slots.iter_mut() {
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

fn commit(
    slots: &DashMap<SlotId, SlotState>,
    updates: &broadcast::Sender<SlotUpdate>,
    slot: SlotId,
    generation: u64,
    result: Result<RasterPage, ExaminerError>,
) -> RenderOutcome {
    let Some(mut state) = slots.get_mut(&slot) else {
        return RenderOutcome::Discarded;
    };
    if state.generation != generation {
        tracing::trace!(slot = %slot, generation, current = state.generation, "Stale render discarded");
        return RenderOutcome::Discarded;
    }

    state.cancel = None;
    let outcome = match result {
        Ok(page) => {
            tracing::debug!(slot = %slot, generation, width = page.width, height = page.height, "Render committed");
            state.content = SlotContent::Ready(Arc::new(page));
            RenderOutcome::Committed
        }
        Err(e) => {
            tracing::warn!(slot = %slot, generation, "Preview render failed: {}", e);
            state.content = SlotContent::Blank;
            RenderOutcome::Blanked
        }
    };
    drop(state);

    let _ = updates.send(SlotUpdate { slot, generation });
    outcome
}
