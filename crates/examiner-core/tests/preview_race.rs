//! Preview slot race tests.
//!
//! Two documents assigned to the same slot in quick succession must leave the
//! slot showing the second one, whichever render finishes first. The fake
//! rasterizer ignores cancellation, so only the generation check keeps the
//! stale render out.

use bytes::Bytes;
use examiner_core::{DocumentRole, PreviewRenderer, RenderOutcome, SlotContent};
use examiner_test_utils::{paper, FakeRasterizer};
use std::sync::Arc;

fn shown(renderer: &PreviewRenderer) -> Option<Bytes> {
    renderer
        .content(DocumentRole::Primary)
        .page()
        .map(|page| page.png.clone())
}

#[tokio::test]
async fn second_assignment_wins_when_it_finishes_first() {
    let rasterizer = Arc::new(FakeRasterizer::new());
    rasterizer.hold("d1.pdf");
    rasterizer.hold("d2.pdf");
    let renderer = PreviewRenderer::new(rasterizer.clone(), 1.5);

    let d1 = renderer.assign(DocumentRole::Primary, paper("d1.pdf"));
    let d2 = renderer.assign(DocumentRole::Primary, paper("d2.pdf"));
    assert_eq!(d2.generation(), d1.generation() + 1);

    rasterizer.release("d2.pdf");
    assert_eq!(d2.join().await, RenderOutcome::Committed);
    rasterizer.release("d1.pdf");
    assert_eq!(d1.join().await, RenderOutcome::Discarded);

    assert_eq!(shown(&renderer), Some(paper("d2.pdf").payload().clone()));
}

#[tokio::test]
async fn second_assignment_wins_when_it_finishes_last() {
    let rasterizer = Arc::new(FakeRasterizer::new());
    rasterizer.hold("d1.pdf");
    rasterizer.hold("d2.pdf");
    let renderer = PreviewRenderer::new(rasterizer.clone(), 1.5);

    let d1 = renderer.assign(DocumentRole::Primary, paper("d1.pdf"));
    let d2 = renderer.assign(DocumentRole::Primary, paper("d2.pdf"));

    rasterizer.release("d1.pdf");
    assert_eq!(d1.join().await, RenderOutcome::Discarded);
    assert_eq!(renderer.content(DocumentRole::Primary), SlotContent::Rendering);

    rasterizer.release("d2.pdf");
    assert_eq!(d2.join().await, RenderOutcome::Committed);
    assert_eq!(shown(&renderer), Some(paper("d2.pdf").payload().clone()));
}

#[tokio::test]
async fn stale_failure_does_not_blank_newer_page() {
    let rasterizer = Arc::new(FakeRasterizer::new());
    rasterizer.hold("corrupt.pdf");
    rasterizer.fail("corrupt.pdf");
    let renderer = PreviewRenderer::new(rasterizer.clone(), 1.5);

    let stale = renderer.assign(DocumentRole::Primary, paper("corrupt.pdf"));
    let fresh = renderer.assign(DocumentRole::Primary, paper("good.pdf"));
    assert_eq!(fresh.join().await, RenderOutcome::Committed);

    rasterizer.release("corrupt.pdf");
    assert_eq!(stale.join().await, RenderOutcome::Discarded);
    assert_eq!(shown(&renderer), Some(paper("good.pdf").payload().clone()));
}

#[tokio::test]
async fn current_failure_leaves_slot_blank() {
    let rasterizer = Arc::new(FakeRasterizer::new());
    rasterizer.fail("corrupt.pdf");
    let renderer = PreviewRenderer::new(rasterizer, 1.5);

    let task = renderer.assign(DocumentRole::Reference, paper("corrupt.pdf"));
    assert_eq!(task.join().await, RenderOutcome::Blanked);
    assert_eq!(renderer.content(DocumentRole::Reference), SlotContent::Blank);
}

#[tokio::test]
async fn superseded_render_publishes_no_update() {
    let rasterizer = Arc::new(FakeRasterizer::new());
    rasterizer.hold("d1.pdf");
    let renderer = PreviewRenderer::new(rasterizer.clone(), 1.5);

    let mut updates = renderer.subscribe();
    let d1 = renderer.assign(DocumentRole::Primary, paper("d1.pdf"));
    let d2 = renderer.assign(DocumentRole::Primary, paper("d2.pdf"));
    assert_eq!(d2.join().await, RenderOutcome::Committed);
    assert_eq!(updates.recv().await.unwrap().generation, 2);

    rasterizer.release("d1.pdf");
    d1.join().await;
    assert_eq!(rasterizer.started(), vec!["d1.pdf".to_string(), "d2.pdf".to_string()]);
    assert!(updates.try_recv().is_err());
}
