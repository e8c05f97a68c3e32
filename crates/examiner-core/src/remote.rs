//! Remote usage, marking and link interfaces
//!
//! Defines the wire schemas for every backend response and the HTTP client
//! that speaks them. Payloads are decoded into typed schemas at the boundary;
//! anything that does not match fails with `ExaminerError::Decode`.

use crate::config::ExaminerConfig;
use crate::document::{Document, DocumentRole};
use crate::error::{ExaminerError, Result};
use crate::identity::{Credential, IdentityKind};
use crate::transcript;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Deserializer, Serialize};

/// Response of the usage endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageResponse {
    /// Submissions already made in the current period
    pub used: u32,
    /// Allowance granted by the backend, overriding the configured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl UsageResponse {
    /// Usage without a backend limit
    #[inline]
    #[must_use]
    pub fn used(used: u32) -> Self {
        Self { used, limit: None }
    }
}

/// Everything the marking call needs
#[derive(Debug, Clone)]
pub struct MarkingSubmission {
    /// Paper being marked
    pub primary: Document,
    /// Mark scheme
    pub reference: Document,
    /// Identity kind at submission time
    pub identity: IdentityKind,
    /// Credential of an authenticated identity
    pub credential: Option<Credential>,
}

impl MarkingSubmission {
    /// Document for a role
    #[inline]
    #[must_use]
    pub fn document(&self, role: DocumentRole) -> &Document {
        match role {
            DocumentRole::Primary => &self.primary,
            DocumentRole::Reference => &self.reference,
        }
    }
}

/// One marked question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkedQuestion {
    /// Question number, e.g. `1.2` or `2(b)(ii)`
    #[serde(deserialize_with = "lenient_string")]
    pub question_number: String,
    /// Question text
    #[serde(alias = "question")]
    pub question_text: String,
    /// Marks available
    #[serde(deserialize_with = "lenient_string")]
    pub max_marks: String,
    /// Candidate's answer
    #[serde(alias = "studentAnswer")]
    pub answer_text: String,
    /// Mark awarded, usually `X/Y`
    #[serde(deserialize_with = "lenient_string")]
    pub mark: String,
    /// Examiner comment
    pub comment: String,
}

impl MarkedQuestion {
    /// Awarded and available marks, if both parse
    #[must_use]
    pub fn awarded(&self) -> Option<Score> {
        Score::parse(&self.mark).or_else(|| {
            let awarded = self.mark.trim().parse().ok()?;
            let available = self.max_marks.trim().parse().ok()?;
            Some(Score { awarded, available })
        })
    }
}

/// Structured marking breakdown
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarkingResult {
    /// Per-question results
    pub questions: Vec<MarkedQuestion>,
    /// Total, usually `X/Y`
    #[serde(deserialize_with = "lenient_string")]
    pub total: String,
}

impl MarkingResult {
    /// Parsed total score
    #[inline]
    #[must_use]
    pub fn total_score(&self) -> Option<Score> {
        Score::parse(&self.total)
    }

    /// Reject results that carry no marking at all
    ///
    /// # Errors
    /// `ExaminerError::Decode` if there are neither questions nor a total
    pub fn validate(self) -> Result<Self> {
        if self.questions.is_empty() && self.total.trim().is_empty() {
            return Err(ExaminerError::decode("marking result is empty"));
        }
        Ok(self)
    }
}

/// Awarded out of available marks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Score {
    /// Marks awarded
    pub awarded: u32,
    /// Marks available
    pub available: u32,
}

impl Score {
    /// Parse `X/Y`
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (awarded, available) = text.split_once('/')?;
        Some(Self {
            awarded: awarded.trim().parse().ok()?,
            available: available.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.awarded, self.available)
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(serde_json::Number),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

/// Remote backend used by the ledger and the submission controller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExaminerApi: Send + Sync {
    /// Fetch usage for the credential's identity, or the anonymous caller
    async fn usage(&self, credential: Option<Credential>) -> Result<UsageResponse>;

    /// Mark a document pair
    async fn mark(&self, submission: MarkingSubmission) -> Result<MarkingResult>;

    /// Migrate anonymous usage to the credential's identity
    async fn link(&self, credential: Credential) -> Result<()>;
}

/// `ExaminerApi` over HTTP
#[derive(Debug, Clone)]
pub struct HttpExaminerApi {
    client: reqwest::Client,
    base: url::Url,
}

impl HttpExaminerApi {
    /// Create client from configuration
    ///
    /// # Errors
    /// - `ExaminerError::Config` if the base URL is invalid
    /// - `ExaminerError::Network` if the HTTP client cannot be built
    pub fn new(config: &ExaminerConfig) -> Result<Self> {
        let mut base = config.api_base()?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(ExaminerError::network)?;

        Ok(Self { client, base })
    }

    /// Base URL all endpoints are resolved against
    #[inline]
    #[must_use]
    pub fn base(&self) -> &url::Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .map_err(|e| ExaminerError::Config(format!("invalid endpoint {path}: {e}")))
    }

    fn authorize(
        request: reqwest::RequestBuilder,
        credential: Option<&Credential>,
    ) -> reqwest::RequestBuilder {
        match credential {
            Some(credential) => request.bearer_auth(credential.token()),
            None => request,
        }
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let text = response.text().await.unwrap_or_default();
    Err(ExaminerError::Network(format!("{url} returned {status}: {text}")))
}

fn document_part(document: &Document) -> Result<Part> {
    Part::stream(reqwest::Body::from(document.payload().clone()))
        .file_name(document.name().to_string())
        .mime_str(document.media_type())
        .map_err(|e| ExaminerError::decode(format!("invalid media type: {e}")))
}

#[async_trait]
impl ExaminerApi for HttpExaminerApi {
    async fn usage(&self, credential: Option<Credential>) -> Result<UsageResponse> {
        let request = self.client.get(self.endpoint("usage")?);
        let response = Self::authorize(request, credential.as_ref()).send().await?;
        let body = ensure_success(response).await?.bytes().await?;

        let usage: UsageResponse = serde_json::from_slice(&body)?;
        tracing::debug!(used = usage.used, limit = ?usage.limit, "Usage fetched");
        Ok(usage)
    }

    async fn mark(&self, submission: MarkingSubmission) -> Result<MarkingResult> {
        let mut form = Form::new();
        for role in DocumentRole::ALL {
            form = form.part(role.form_field(), document_part(submission.document(role))?);
        }

        tracing::info!(
            primary = submission.primary.name(),
            reference = submission.reference.name(),
            identity = %submission.identity,
            "Submitting for marking"
        );

        let request = self.client.post(self.endpoint("mark")?).multipart(form);
        let response = Self::authorize(request, submission.credential.as_ref())
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let is_transcript = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/plain"));

        let result = if is_transcript {
            transcript::parse(&response.text().await?)?
        } else {
            serde_json::from_slice(&response.bytes().await?)?
        };
        result.validate()
    }

    async fn link(&self, credential: Credential) -> Result<()> {
        let request = self.client.post(self.endpoint("link")?);
        let response = Self::authorize(request, Some(&credential)).send().await?;
        ensure_success(response).await?;
        tracing::info!("Anonymous usage linked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn usage_schema() {
        let usage: UsageResponse = serde_json::from_str(r#"{"used": 2}"#).unwrap();
        assert_eq!(usage, UsageResponse::used(2));

        let usage: UsageResponse = serde_json::from_str(r#"{"used": 2, "limit": 20}"#).unwrap();
        assert_eq!(usage.limit, Some(20));
    }

    #[test]
    fn usage_schema_rejects_mismatch() {
        let err: ExaminerError = serde_json::from_str::<UsageResponse>(r#"{"used": -1}"#)
            .unwrap_err()
            .into();
        assert!(matches!(err, ExaminerError::Decode(_)));

        let err: ExaminerError = serde_json::from_str::<UsageResponse>(r#"{"count": 1}"#)
            .unwrap_err()
            .into();
        assert!(matches!(err, ExaminerError::Decode(_)));
    }

    #[test]
    fn marking_schema_accepts_service_field_names() {
        let json = r#"{
            "questions": [{
                "questionNumber": "1.2",
                "question": "Name the organelle.",
                "maxMarks": "1",
                "studentAnswer": "Nucleus",
                "mark": "1/1",
                "comment": "Correct."
            }],
            "total": "1/1"
        }"#;
        let result: MarkingResult = serde_json::from_str(json).unwrap();
        let q = &result.questions[0];
        assert_eq!(q.question_text, "Name the organelle.");
        assert_eq!(q.answer_text, "Nucleus");
        assert_eq!(q.awarded(), Some(Score { awarded: 1, available: 1 }));
        assert_eq!(result.total_score(), Some(Score { awarded: 1, available: 1 }));
    }

    #[test]
    fn marking_schema_accepts_numeric_marks() {
        let json = r#"{
            "questions": [{
                "questionNumber": 3,
                "questionText": "Q",
                "maxMarks": 4,
                "answerText": "A",
                "mark": 2,
                "comment": ""
            }],
            "total": "2/4"
        }"#;
        let result: MarkingResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.questions[0].max_marks, "4");
        assert_eq!(
            result.questions[0].awarded(),
            Some(Score { awarded: 2, available: 4 })
        );
    }

    #[test]
    fn marking_schema_rejects_missing_fields() {
        let json = r#"{"questions": [{"questionNumber": "1"}], "total": "0/1"}"#;
        assert!(serde_json::from_str::<MarkingResult>(json).is_err());
    }

    #[test]
    fn empty_result_fails_validation() {
        assert!(matches!(
            MarkingResult::default().validate(),
            Err(ExaminerError::Decode(_))
        ));
    }

    #[test]
    fn score_parse() {
        assert_eq!(Score::parse(" 7 / 10 "), Some(Score { awarded: 7, available: 10 }));
        assert_eq!(Score::parse("seven"), None);
        assert_eq!(Score { awarded: 3, available: 5 }.to_string(), "3/5");
    }

    #[test]
    fn http_api_normalizes_base_path() {
        let config = ExaminerConfig::new().with_api_base_url("https://marker.example.com/api");
        let api = HttpExaminerApi::new(&config).unwrap();
        assert_eq!(api.endpoint("usage").unwrap().as_str(), "https://marker.example.com/api/usage");
    }
}
