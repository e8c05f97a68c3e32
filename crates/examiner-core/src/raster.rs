//! Rasterizer adapter
//!
//! Turns the first page of a document into a PNG for preview. The default
//! backend shells out to poppler's `pdftoppm`; anything implementing
//! [`Rasterizer`] can replace it.

use crate::document::Document;
use crate::error::{ExaminerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Points per inch of a PDF page at scale 1.0
const PDF_POINTS_PER_INCH: f32 = 72.0;

/// A rasterized page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterPage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// PNG-encoded image
    pub png: Bytes,
}

impl RasterPage {
    /// Wrap PNG bytes, reading the dimensions from the IHDR chunk
    ///
    /// # Errors
    /// `ExaminerError::Decode` if the bytes are not a PNG
    pub fn from_png(png: impl Into<Bytes>) -> Result<Self> {
        let png = png.into();
        let (width, height) = png_dimensions(&png)?;
        Ok(Self { width, height, png })
    }
}

fn png_dimensions(png: &[u8]) -> Result<(u32, u32)> {
    if png.len() < 24 || png[..8] != PNG_SIGNATURE || &png[12..16] != b"IHDR" {
        return Err(ExaminerError::decode("rasterizer output is not a PNG"));
    }
    let word = |at: usize| u32::from_be_bytes([png[at], png[at + 1], png[at + 2], png[at + 3]]);
    Ok((word(16), word(20)))
}

/// Produces the first page of a document as an image
///
/// Implementations should observe `cancel` cooperatively and return
/// `ExaminerError::Cancelled` when it fires; callers must not rely on it.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Rasterize page one at `scale` (1.0 = 72 dpi)
    async fn rasterize_first_page(
        &self,
        document: &Document,
        scale: f32,
        cancel: &CancellationToken,
    ) -> Result<RasterPage>;
}

/// Rasterizer backed by poppler's `pdftoppm`
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    program: PathBuf,
}

impl PdftoppmRasterizer {
    /// Use `pdftoppm` from `PATH`
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("pdftoppm")
    }

    /// Use a specific binary
    #[inline]
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn dpi(scale: f32) -> u32 {
        // Scale is validated positive and finite by the config.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let dpi = (PDF_POINTS_PER_INCH * scale).round().max(1.0) as u32;
        dpi
    }

    async fn run(&self, document: &Document, scale: f32) -> Result<RasterPage> {
        let mut child = Command::new(&self.program)
            .args(["-png", "-singlefile", "-f", "1", "-l", "1", "-r"])
            .arg(Self::dpi(scale).to_string())
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExaminerError::Unknown(format!("cannot start {}: {e}", self.program.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExaminerError::Unknown("rasterizer stdin unavailable".to_string()))?;
        let payload = document.payload().clone();
        let writer = tokio::spawn(async move {
            let written = stdin.write_all(&payload).await;
            drop(stdin);
            written
        });

        let output = child.wait_with_output().await?;
        // A broken pipe here means the process exited early; its status says why.
        let _ = writer.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExaminerError::decode(format!(
                "pdftoppm failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        RasterPage::from_png(output.stdout)
    }
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn rasterize_first_page(
        &self,
        document: &Document,
        scale: f32,
        cancel: &CancellationToken,
    ) -> Result<RasterPage> {
        if document.media_type() == "image/png" {
            return RasterPage::from_png(document.payload().clone());
        }
        if !document.is_pdf() {
            return Err(ExaminerError::decode(format!(
                "unsupported media type {}",
                document.media_type()
            )));
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExaminerError::Cancelled),
            page = self.run(document, scale) => page,
        }
    }
}
