use crate::client::{PostSubmitter, TraceSink};
use crate::credentials::Credential;
use crate::model::{PostDraft, SubmissionOutcome};
use crate::queue::QueueStore;
use crate::sync::SyncTrigger;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("a password is required to publish")]
    MissingCredential,
    #[error("failed to queue post: {0:#}")]
    Storage(anyhow::Error),
}

/// What happened to a user-initiated publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishReport {
    Published {
        message: String,
        path: Option<String>,
    },
    /// Sending failed; the post is queued and a background sync was requested.
    Queued { id: i64, reason: String },
    /// The endpoint refused the post for good; nothing was queued.
    Rejected { reason: String },
}

/// Try the network once; on a retryable failure hand the post to the queue.
pub struct ImmediatePublisher {
    store: QueueStore,
    submitter: Arc<dyn PostSubmitter>,
    trigger: Arc<dyn SyncTrigger>,
}

impl ImmediatePublisher {
    pub fn new(
        store: QueueStore,
        submitter: Arc<dyn PostSubmitter>,
        trigger: Arc<dyn SyncTrigger>,
    ) -> Self {
        Self {
            store,
            submitter,
            trigger,
        }
    }

    #[instrument(skip_all)]
    pub async fn publish(
        &self,
        post: PostDraft,
        credential: Option<&Credential>,
        trace: &dyn TraceSink,
    ) -> Result<PublishReport, PublishError> {
        let Some(credential) = credential else {
            trace.trace("x Password is required");
            return Err(PublishError::MissingCredential);
        };

        match self.submitter.submit(&post, credential, trace).await {
            SubmissionOutcome::Success {
                message,
                published_path,
            } => {
                info!(title = post.display_title(), path = ?published_path, "post published");
                Ok(PublishReport::Published {
                    message,
                    path: published_path,
                })
            }
            SubmissionOutcome::PermanentFailure { reason } => {
                warn!(title = post.display_title(), reason = %reason, "post rejected");
                Ok(PublishReport::Rejected { reason })
            }
            SubmissionOutcome::RetryableFailure { reason } => {
                trace.trace(&format!("x Failed or offline: {}", reason));
                trace.trace("Adding to sync queue...");
                let id = self
                    .store
                    .append(&post)
                    .await
                    .map_err(PublishError::Storage)?;
                self.trigger.arm();
                trace.trace("ok Added to queue. Will sync in background.");
                Ok(PublishReport::Queued { id, reason })
            }
        }
    }
}
