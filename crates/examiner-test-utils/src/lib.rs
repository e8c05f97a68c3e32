//! Testing utilities for the examiner workspace
//!
//! In-memory fakes of the remote backend and the rasterizer, plus fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use bytes::Bytes;
use examiner_core::{
    Credential, Document, ExaminerApi, ExaminerError, MarkedQuestion, MarkingResult,
    MarkingSubmission, RasterPage, Rasterizer, Result, UsageResponse,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const ANONYMOUS: &str = "anonymous";

/// Backend fake that counts calls and keeps per-principal usage
///
/// Principals are keyed by bearer token. Marking counts against the caller;
/// linking moves the anonymous count onto the credential's principal.
#[derive(Debug, Default)]
pub struct FakeExaminerApi {
    usage_calls: AtomicUsize,
    mark_calls: AtomicUsize,
    link_calls: AtomicUsize,
    used: Mutex<HashMap<String, u32>>,
    fail_usage: Mutex<bool>,
    fail_mark: Mutex<bool>,
    result: Mutex<Option<MarkingResult>>,
    held: Mutex<Option<Arc<Semaphore>>>,
    usage_held: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeExaminerApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed usage for a token (`None` for the anonymous caller)
    pub fn with_used(self, token: Option<&str>, used: u32) -> Self {
        self.used.lock().insert(key(token), used);
        self
    }

    pub fn with_result(self, result: MarkingResult) -> Self {
        *self.result.lock() = Some(result);
        self
    }

    /// Make usage calls fail as if unreachable
    pub fn set_offline(&self, offline: bool) {
        *self.fail_usage.lock() = offline;
    }

    /// Make mark calls fail with a non-success status
    pub fn set_mark_failing(&self, failing: bool) {
        *self.fail_mark.lock() = failing;
    }

    /// Park mark calls until [`Self::release_marks`]
    pub fn hold_marks(&self) {
        *self.held.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_marks(&self, count: usize) {
        if let Some(held) = self.held.lock().as_ref() {
            held.add_permits(count);
        }
    }

    /// Park usage calls until [`Self::release_usage`]
    pub fn hold_usage(&self) {
        *self.usage_held.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_usage(&self, count: usize) {
        if let Some(held) = self.usage_held.lock().as_ref() {
            held.add_permits(count);
        }
    }

    pub fn used(&self, token: Option<&str>) -> u32 {
        self.used.lock().get(&key(token)).copied().unwrap_or(0)
    }

    pub fn usage_calls(&self) -> usize {
        self.usage_calls.load(Ordering::SeqCst)
    }

    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    pub fn link_calls(&self) -> usize {
        self.link_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.usage_calls() + self.mark_calls() + self.link_calls()
    }
}

fn key(token: Option<&str>) -> String {
    token.unwrap_or(ANONYMOUS).to_string()
}

#[async_trait]
impl ExaminerApi for FakeExaminerApi {
    async fn usage(&self, credential: Option<Credential>) -> Result<UsageResponse> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);

        let held = self.usage_held.lock().clone();
        if let Some(held) = held {
            held.acquire().await.unwrap().forget();
        }

        if *self.fail_usage.lock() {
            return Err(ExaminerError::network("connection refused"));
        }
        Ok(UsageResponse::used(self.used(credential.as_ref().map(Credential::token))))
    }

    async fn mark(&self, submission: MarkingSubmission) -> Result<MarkingResult> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);

        let held = self.held.lock().clone();
        if let Some(held) = held {
            held.acquire().await.unwrap().forget();
        }

        if *self.fail_mark.lock() {
            return Err(ExaminerError::network("/mark returned 500 Internal Server Error"));
        }

        let principal = key(submission.credential.as_ref().map(Credential::token));
        *self.used.lock().entry(principal).or_default() += 1;
        Ok(self.result.lock().clone().unwrap_or_else(sample_result))
    }

    async fn link(&self, credential: Credential) -> Result<()> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        let mut used = self.used.lock();
        let anonymous = used.remove(ANONYMOUS).unwrap_or(0);
        *used.entry(credential.token().to_string()).or_default() += anonymous;
        Ok(())
    }
}

/// Rasterizer fake with per-document release control
///
/// The page it produces carries the document payload as its image bytes so
/// tests can tell which document a slot shows. Cancellation is ignored.
#[derive(Debug, Default)]
pub struct FakeRasterizer {
    held: Mutex<HashMap<String, Arc<Semaphore>>>,
    failing: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
}

impl FakeRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park renders of `name` until [`Self::release`]
    pub fn hold(&self, name: &str) {
        self.held
            .lock()
            .insert(name.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, name: &str) {
        if let Some(held) = self.held.lock().get(name) {
            held.add_permits(1);
        }
    }

    /// Fail renders of `name` as corrupt
    pub fn fail(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn rasterize_first_page(
        &self,
        document: &Document,
        _scale: f32,
        _cancel: &CancellationToken,
    ) -> Result<RasterPage> {
        self.started.lock().push(document.name().to_string());

        let held = self.held.lock().get(document.name()).cloned();
        if let Some(held) = held {
            held.acquire().await.unwrap().forget();
        }

        if self.failing.lock().contains(document.name()) {
            return Err(ExaminerError::decode(format!("{} is corrupt", document.name())));
        }
        Ok(RasterPage {
            width: u32::try_from(document.len()).unwrap(),
            height: 1,
            png: document.payload().clone(),
        })
    }
}

pub fn paper(name: &str) -> Document {
    Document::pdf(name, Bytes::from(format!("%PDF-1.7 paper {name}")))
}

pub fn scheme(name: &str) -> Document {
    Document::pdf(name, Bytes::from(format!("%PDF-1.7 scheme {name}")))
}

pub fn sample_result() -> MarkingResult {
    MarkingResult {
        questions: vec![
            MarkedQuestion {
                question_number: "1.1".to_string(),
                question_text: "Name the organelle that contains genetic material.".to_string(),
                max_marks: "1".to_string(),
                answer_text: "Nucleus".to_string(),
                mark: "1/1".to_string(),
                comment: "Correct.".to_string(),
            },
            MarkedQuestion {
                question_number: "1.2".to_string(),
                question_text: "Describe the function of ribosomes.".to_string(),
                max_marks: "2".to_string(),
                answer_text: "They make things".to_string(),
                mark: "0/2".to_string(),
                comment: "Protein synthesis not mentioned.".to_string(),
            },
        ],
        total: "1/3".to_string(),
    }
}
