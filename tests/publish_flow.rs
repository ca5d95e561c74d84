mod support;

use quickpost::client::{PostSubmitter, TraceBuffer};
use quickpost::credentials::Credential;
use quickpost::publish::{ImmediatePublisher, PublishError, PublishReport};
use quickpost::queue::QueueStore;
use quickpost::sync::SyncTrigger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{permanent, queued_titles, retryable, setup_store, success, titled, RecordingSubmitter};

#[derive(Default)]
struct CountingTrigger {
    armed: AtomicUsize,
}

impl CountingTrigger {
    fn count(&self) -> usize {
        self.armed.load(Ordering::SeqCst)
    }
}

impl SyncTrigger for CountingTrigger {
    fn arm(&self) {
        self.armed.fetch_add(1, Ordering::SeqCst);
    }
}

fn publisher(
    store: &QueueStore,
    submitter: &RecordingSubmitter,
    trigger: &Arc<CountingTrigger>,
) -> ImmediatePublisher {
    let submitter: Arc<dyn PostSubmitter> = Arc::new(submitter.clone());
    let trigger: Arc<dyn SyncTrigger> = trigger.clone();
    ImmediatePublisher::new(store.clone(), submitter, trigger)
}

fn password() -> Credential {
    Credential::new("pw").unwrap()
}

#[tokio::test]
async fn successful_publish_queues_nothing() {
    let (_dir, store, _) = setup_store().await;
    let submitter = RecordingSubmitter::with_responses(vec![success()]);
    let trigger = Arc::new(CountingTrigger::default());

    let report = publisher(&store, &submitter, &trigger)
        .publish(titled("now"), Some(&password()), &TraceBuffer::default())
        .await
        .unwrap();

    assert_eq!(
        report,
        PublishReport::Published {
            message: "Success".into(),
            path: Some("content/posts/x.md".into())
        }
    );
    assert!(store.is_empty().await.unwrap());
    assert_eq!(trigger.count(), 0);
    assert_eq!(submitter.titles().await, vec!["now"]);
}

#[tokio::test]
async fn retryable_failure_queues_post_and_arms_sync() {
    let (_dir, store, _) = setup_store().await;
    store.append(&titled("earlier")).await.unwrap();
    let submitter = RecordingSubmitter::with_responses(vec![retryable("connection refused")]);
    let trigger = Arc::new(CountingTrigger::default());
    let trace = TraceBuffer::default();

    let report = publisher(&store, &submitter, &trigger)
        .publish(titled("offline"), Some(&password()), &trace)
        .await
        .unwrap();

    let (id, reason) = match report {
        PublishReport::Queued { id, reason } => (id, reason),
        other => panic!("expected Queued, got {:?}", other),
    };
    assert_eq!(reason, "connection refused");
    assert_eq!(store.peek_oldest().await.unwrap().unwrap().post.display_title(), "earlier");
    assert_eq!(store.list_all().await.unwrap().last().unwrap().id, id);
    assert_eq!(queued_titles(&store).await, vec!["earlier", "offline"]);
    assert_eq!(trigger.count(), 1);
    assert!(trace.text().contains("Adding to sync queue..."));
}

#[tokio::test]
async fn permanent_failure_is_rejected_without_queueing() {
    let (_dir, store, _) = setup_store().await;
    let submitter = RecordingSubmitter::with_responses(vec![permanent("HTTP 400: bad request")]);
    let trigger = Arc::new(CountingTrigger::default());

    let report = publisher(&store, &submitter, &trigger)
        .publish(titled("bad"), Some(&password()), &TraceBuffer::default())
        .await
        .unwrap();

    assert_eq!(
        report,
        PublishReport::Rejected {
            reason: "HTTP 400: bad request".into()
        }
    );
    assert!(store.is_empty().await.unwrap());
    assert_eq!(trigger.count(), 0);
}

#[tokio::test]
async fn missing_credential_fails_before_any_network_call() {
    let (_dir, store, _) = setup_store().await;
    let submitter = RecordingSubmitter::default();
    let trigger = Arc::new(CountingTrigger::default());

    let err = publisher(&store, &submitter, &trigger)
        .publish(titled("x"), None, &TraceBuffer::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::MissingCredential));
    assert!(submitter.calls().await.is_empty());
    assert!(store.is_empty().await.unwrap());
    assert_eq!(trigger.count(), 0);
}
