//! Documents and document sources
//!
//! A [`Document`] is an immutable payload selected for one of the two
//! submission roles. Documents come either from the local filesystem or from
//! the fixed example pair; once loaded both are treated identically.

use crate::config::ExampleConfig;
use crate::error::{ExaminerError, Result};
use bytes::Bytes;
use std::path::Path;

/// Media type of PDF documents
pub const PDF_MEDIA_TYPE: &str = "application/pdf";

/// Role a document plays in a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentRole {
    /// The paper being marked
    Primary,
    /// The mark scheme it is scored against
    Reference,
}

impl DocumentRole {
    /// Both roles, in submission order
    pub const ALL: [DocumentRole; 2] = [DocumentRole::Primary, DocumentRole::Reference];

    /// Human-readable label
    #[inline]
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Primary => "student paper",
            Self::Reference => "mark scheme",
        }
    }

    /// Multipart field name expected by the marking service
    #[inline]
    #[must_use]
    pub fn form_field(self) -> &'static str {
        match self {
            Self::Primary => "student",
            Self::Reference => "scheme",
        }
    }

    /// File name given to the example document for this role
    #[inline]
    #[must_use]
    pub fn example_name(self) -> String {
        format!("{}-example.pdf", self.form_field())
    }
}

impl std::fmt::Display for DocumentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable document payload with display name and declared media type
///
/// Cloning is cheap; the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    name: String,
    media_type: String,
    payload: Bytes,
}

impl Document {
    /// Create a document from raw parts
    #[inline]
    pub fn new(
        name: impl Into<String>,
        media_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            payload: payload.into(),
        }
    }

    /// Create a PDF document
    #[inline]
    pub fn pdf(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(name, PDF_MEDIA_TYPE, payload)
    }

    /// Read a document from disk, inferring the media type from the extension
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let payload = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        tracing::debug!(name = %name, bytes = payload.len(), "Read document from disk");
        Ok(Self::new(name, media_type_for(path), payload))
    }

    /// Display name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared media type
    #[inline]
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Raw payload
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Content fingerprint (blake3, hex)
    #[must_use]
    pub fn fingerprint(&self) -> String {
        blake3::hash(&self.payload).to_hex().to_string()
    }

    /// Check if the declared media type is PDF
    #[inline]
    #[must_use]
    pub fn is_pdf(&self) -> bool {
        self.media_type == PDF_MEDIA_TYPE
    }
}

fn media_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => PDF_MEDIA_TYPE,
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Fixed example document pair, loaded on demand
#[derive(Debug, Clone)]
pub struct ExampleAssets {
    primary: String,
    reference: String,
    client: reqwest::Client,
}

impl ExampleAssets {
    /// Create from configured locations, resolving relative ones against the API base
    ///
    /// # Errors
    /// `ExaminerError::Config` if a relative location does not join onto the base
    pub fn new(examples: &ExampleConfig, api_base: &url::Url) -> Result<Self> {
        Ok(Self {
            primary: resolve_location(&examples.primary, api_base)?,
            reference: resolve_location(&examples.reference, api_base)?,
            client: reqwest::Client::new(),
        })
    }

    /// Location of the example for a role
    #[inline]
    #[must_use]
    pub fn location(&self, role: DocumentRole) -> &str {
        match role {
            DocumentRole::Primary => &self.primary,
            DocumentRole::Reference => &self.reference,
        }
    }

    /// Load the example document for a role
    ///
    /// # Errors
    /// - `ExaminerError::Network` if a remote example cannot be fetched
    /// - `ExaminerError::Storage` if a local example cannot be read
    pub async fn load(&self, role: DocumentRole) -> Result<Document> {
        let location = self.location(role);

        let payload: Bytes = if is_remote(location) {
            let response = self
                .client
                .get(location)
                .send()
                .await
                .map_err(ExaminerError::network)?;
            if !response.status().is_success() {
                return Err(ExaminerError::Network(format!(
                    "example {location} returned {}",
                    response.status()
                )));
            }
            response.bytes().await.map_err(ExaminerError::network)?
        } else {
            tokio::fs::read(location).await?.into()
        };

        tracing::info!(role = %role, location, "Example loaded");
        Ok(Document::pdf(role.example_name(), payload))
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn resolve_location(location: &str, api_base: &url::Url) -> Result<String> {
    if is_remote(location) || Path::new(location).is_absolute() {
        return Ok(location.to_string());
    }
    api_base
        .join(location)
        .map(String::from)
        .map_err(|e| ExaminerError::Config(format!("invalid example location {location}: {e}")))
}
