#![allow(dead_code)]

use quickpost::client::{PostSubmitter, TraceSink};
use quickpost::credentials::{Credential, CredentialStore};
use quickpost::model::{PostDraft, SubmissionOutcome};
use quickpost::queue::QueueStore;
use quickpost::sync::{DriverStatus, SyncHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("queue.db").display())
}

/// File-backed store in a fresh temp directory.
pub async fn setup_store() -> (TempDir, QueueStore, CredentialStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(&database_url(&dir)).await.unwrap();
    let credentials = CredentialStore::new(store.pool().clone());
    (dir, store, credentials)
}

pub async fn login(credentials: &CredentialStore) {
    credentials
        .save(&Credential::new("pw").unwrap(), true)
        .await
        .unwrap();
}

pub fn titled(title: &str) -> PostDraft {
    PostDraft::new(format!("body of {}", title)).with_title(title)
}

pub fn success() -> SubmissionOutcome {
    SubmissionOutcome::Success {
        message: "Success".into(),
        published_path: Some("content/posts/x.md".into()),
    }
}

pub fn retryable(reason: &str) -> SubmissionOutcome {
    SubmissionOutcome::RetryableFailure {
        reason: reason.into(),
    }
}

pub fn permanent(reason: &str) -> SubmissionOutcome {
    SubmissionOutcome::PermanentFailure {
        reason: reason.into(),
    }
}

/// Submitter that records every call and replays scripted outcomes, then succeeds.
#[derive(Clone, Default)]
pub struct RecordingSubmitter {
    responses: Arc<Mutex<VecDeque<SubmissionOutcome>>>,
    calls: Arc<Mutex<Vec<(PostDraft, SubmissionOutcome)>>>,
}

impl RecordingSubmitter {
    pub fn with_responses(responses: Vec<SubmissionOutcome>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<(PostDraft, SubmissionOutcome)> {
        self.calls.lock().await.clone()
    }

    pub async fn titles(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(p, _)| p.display_title().to_string())
            .collect()
    }
}

#[async_trait::async_trait]
impl PostSubmitter for RecordingSubmitter {
    async fn submit(
        &self,
        post: &PostDraft,
        _credential: &Credential,
        trace: &dyn TraceSink,
    ) -> SubmissionOutcome {
        trace.trace(&format!("submit {}", post.display_title()));
        let outcome = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(success);
        self.calls.lock().await.push((post.clone(), outcome.clone()));
        outcome
    }
}

pub async fn queued_titles(store: &QueueStore) -> Vec<String> {
    store
        .list_all()
        .await
        .unwrap()
        .iter()
        .map(|p| p.post.display_title().to_string())
        .collect()
}

pub async fn wait_for_drains(handle: &SyncHandle, n: u64) -> DriverStatus {
    let mut rx = handle.subscribe();
    let status = tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|s| s.completed_drains >= n),
    )
    .await
    .expect("timed out waiting for drain")
    .expect("driver stopped")
    .clone();
    status
}
