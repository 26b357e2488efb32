//! End-to-end correlation scenarios against a running aggregator.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use message_aggregator::{
    AggregationError, ChannelSink, ControlBus, CorrelationId, DiscardReason, EmissionError,
    EventFragment, FileGroupStore, FragmentKind, InboundMessage, MergedResult, MergedResultSink,
    MessageAggregator, MessagePayload, ReleaseKind,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn payload(tag: Option<&str>) -> MessagePayload {
    let payload = MessagePayload::new("message").with_correlation_key("1");
    match tag {
        Some(tag) => payload
            .with_business_key(tag)
            .with_variable("key", json!(tag)),
        None => payload,
    }
}

fn group_id() -> CorrelationId {
    CorrelationId::new("message", Some("1"), None)
}

fn aggregator() -> (MessageAggregator, UnboundedReceiver<MergedResult>) {
    let (sink, rx) = ChannelSink::new();
    let aggregator = MessageAggregator::builder()
        .sink(sink)
        .build()
        .expect("build should succeed");
    (aggregator, rx)
}

fn drain(rx: &mut UnboundedReceiver<MergedResult>) -> Vec<MergedResult> {
    let mut out = Vec::new();
    while let Ok(result) = rx.try_recv() {
        out.push(result);
    }
    out
}

/// Sink that fails while `fail` is set and counts successful emissions.
#[derive(Default)]
struct FlakySink {
    fail: AtomicBool,
    emitted: AtomicUsize,
}

#[async_trait]
impl MergedResultSink for FlakySink {
    async fn emit(&self, _result: &MergedResult) -> Result<(), EmissionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmissionError::new("transaction rolled back"));
        }
        self.emitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that rejects only its `fail_at`-th emission (zero-based) and records
/// the business keys it delivered.
struct FailOnceSink {
    fail_at: usize,
    calls: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl FailOnceSink {
    fn new(fail_at: usize) -> Self {
        Self {
            fail_at,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MergedResultSink for FailOnceSink {
    async fn emit(&self, result: &MergedResult) -> Result<(), EmissionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return Err(EmissionError::new("broker unavailable"));
        }
        let key = result.payload.business_key.clone().unwrap_or_default();
        self.delivered.lock().unwrap().push(key);
        Ok(())
    }
}

#[test]
fn correlation_ids_are_deterministic_and_distinct() {
    let sent = EventFragment::sent(payload(Some("sent1")));
    let waiting = EventFragment::waiting(payload(None));
    assert_eq!(sent.correlation_id(), waiting.correlation_id());

    let other_key = EventFragment::sent(MessagePayload::new("message").with_correlation_key("2"));
    let other_app = EventFragment::sent(payload(None)).with_app_name("billing");
    assert_ne!(sent.correlation_id(), other_key.correlation_id());
    assert_ne!(sent.correlation_id(), other_app.correlation_id());
}

#[tokio::test]
async fn start_then_sent_releases_and_retains_definition() {
    let (agg, mut rx) = aggregator();

    let released = agg
        .submit(EventFragment::start_deployed(payload(None)))
        .await
        .unwrap();
    assert!(released.is_empty());

    let released = agg
        .submit(EventFragment::sent(payload(Some("sent1"))))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].kind, ReleaseKind::StartMessage);
    assert_eq!(released[0].payload.variables["key"], json!("sent1"));
    assert_eq!(drain(&mut rx), released);

    let group = agg.group(&group_id()).await.unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].kind, FragmentKind::StartDeployed);
}

#[tokio::test]
async fn buffered_sends_are_released_oldest_first() {
    let (agg, mut rx) = aggregator();

    agg.submit(EventFragment::sent(payload(Some("sent1")))).await.unwrap();
    agg.submit(EventFragment::sent(payload(Some("sent2")))).await.unwrap();
    let released = agg
        .submit(EventFragment::waiting(payload(Some("waiting1"))))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].kind, ReleaseKind::ReceiveMessage);
    assert_eq!(released[0].payload.variables["key"], json!("sent1"));

    let group = agg.group(&group_id()).await.unwrap();
    let kinds: Vec<_> = group.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FragmentKind::Sent, FragmentKind::Waiting]);
    assert_eq!(group[0].payload.variables["key"], json!("sent2"));

    agg.submit(EventFragment::received(payload(None))).await.unwrap();
    let released = agg
        .submit(EventFragment::waiting(payload(Some("waiting2"))))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload.variables["key"], json!("sent2"));
    assert_eq!(drain(&mut rx).len(), 2);
}

#[tokio::test]
async fn duplicate_waiting_is_rejected_once() {
    let (agg, _rx) = aggregator();
    let waiting = EventFragment::waiting(payload(None)).with_event_id("evt-waiting");

    agg.submit(waiting.clone()).await.unwrap();
    let err = agg.submit(waiting).await.unwrap_err();

    match err {
        AggregationError::DuplicateDelivery {
            correlation_id,
            event_id,
        } => {
            assert_eq!(correlation_id, group_id());
            assert_eq!(event_id, "evt-waiting");
        }
        other => panic!("expected DuplicateDelivery, got: {other:?}"),
    }
    assert_eq!(agg.group(&group_id()).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_duplicates_admit_exactly_one() {
    let (agg, _rx) = aggregator();
    let waiting = EventFragment::waiting(payload(None)).with_event_id("evt-race");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let agg = agg.clone();
            let waiting = waiting.clone();
            tokio::spawn(async move { agg.submit(waiting).await })
        })
        .collect();

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(AggregationError::DuplicateDelivery { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(agg.group(&group_id()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancellation_clears_group() {
    let (agg, _rx) = aggregator();
    agg.submit(EventFragment::start_deployed(payload(None))).await.unwrap();
    agg.submit(EventFragment::waiting(payload(None))).await.unwrap();
    agg.submit(EventFragment::subscription_cancelled(payload(None)))
        .await
        .unwrap();

    assert!(agg.group(&group_id()).await.unwrap().is_empty());
    assert!(agg.group_ids().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_sends_against_one_definition() {
    let (agg, mut rx) = aggregator();
    agg.submit(EventFragment::start_deployed(payload(None))).await.unwrap();

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let agg = agg.clone();
            tokio::spawn(async move {
                agg.submit(EventFragment::sent(payload(Some(&format!("sent{i}")))))
                    .await
            })
        })
        .collect();

    let mut released = 0;
    for task in tasks {
        released += task.await.unwrap().unwrap().len();
    }
    assert_eq!(released, 100);
    assert_eq!(drain(&mut rx).len(), 100);
    assert_eq!(agg.group(&group_id()).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn definition_after_concurrent_buffered_sends() {
    let (agg, mut rx) = aggregator();

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let agg = agg.clone();
            tokio::spawn(async move {
                agg.submit(EventFragment::sent(payload(Some(&format!("sent{i}")))))
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap().is_empty());
    }
    assert_eq!(agg.group(&group_id()).await.unwrap().len(), 100);

    let released = agg
        .submit(EventFragment::start_deployed(payload(None)))
        .await
        .unwrap();
    assert_eq!(released.len(), 100);
    assert_eq!(drain(&mut rx), released);

    let group = agg.group(&group_id()).await.unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].kind, FragmentKind::StartDeployed);
}

#[tokio::test]
async fn failed_emission_rolls_back_and_retry_succeeds() {
    let sink = Arc::new(FlakySink::default());
    let agg = MessageAggregator::builder()
        .sink(Arc::clone(&sink))
        .build()
        .unwrap();

    agg.submit(EventFragment::start_deployed(payload(None))).await.unwrap();
    let before = agg.group(&group_id()).await.unwrap();

    sink.fail.store(true, Ordering::SeqCst);
    let sent = EventFragment::sent(payload(Some("sent1")));
    let err = agg.submit(sent.clone()).await.unwrap_err();
    assert!(matches!(err, AggregationError::Emission(_)), "got: {err:?}");
    assert_eq!(agg.group(&group_id()).await.unwrap(), before);
    assert_eq!(sink.emitted.load(Ordering::SeqCst), 0);

    sink.fail.store(false, Ordering::SeqCst);
    let released = agg.submit(sent).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(sink.emitted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_emission_restores_buffered_sends() {
    let sink = Arc::new(FlakySink::default());
    let agg = MessageAggregator::builder()
        .sink(Arc::clone(&sink))
        .build()
        .unwrap();

    agg.submit(EventFragment::sent(payload(Some("sent1")))).await.unwrap();
    agg.submit(EventFragment::sent(payload(Some("sent2")))).await.unwrap();
    let before = agg.group(&group_id()).await.unwrap();

    sink.fail.store(true, Ordering::SeqCst);
    let err = agg
        .submit(EventFragment::start_deployed(payload(None)))
        .await
        .unwrap_err();
    assert!(matches!(err, AggregationError::Emission(_)));
    assert_eq!(agg.group(&group_id()).await.unwrap(), before);
}

#[tokio::test]
async fn partial_emission_failure_keeps_delivered_results_consumed() {
    let sink = Arc::new(FailOnceSink::new(1));
    let agg = MessageAggregator::builder()
        .sink(Arc::clone(&sink))
        .build()
        .unwrap();

    agg.submit(EventFragment::sent(payload(Some("sent1")))).await.unwrap();
    agg.submit(EventFragment::sent(payload(Some("sent2")))).await.unwrap();

    let definition = EventFragment::start_deployed(payload(None));
    let err = agg.submit(definition.clone()).await.unwrap_err();
    assert!(matches!(err, AggregationError::Emission(_)), "got: {err:?}");

    // Only the send whose result never went out is buffered again.
    let group = agg.group(&group_id()).await.unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].payload.business_key.as_deref(), Some("sent2"));

    let released = agg.submit(definition).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(*sink.delivered.lock().unwrap(), vec!["sent1", "sent2"]);
}

#[tokio::test]
async fn stopped_aggregator_rejects_and_keeps_state() {
    let (agg, mut rx) = aggregator();
    agg.submit(EventFragment::start_deployed(payload(None))).await.unwrap();

    let mut bus = ControlBus::new();
    bus.register(agg.clone());
    bus.execute("@aggregator.stop()").unwrap();

    let err = agg
        .submit(EventFragment::sent(payload(Some("sent1"))))
        .await
        .unwrap_err();
    assert!(matches!(err, AggregationError::NotRunning { .. }));
    assert!(drain(&mut rx).is_empty());

    bus.execute("@aggregator.start()").unwrap();
    let group = agg.group(&group_id()).await.unwrap();
    assert_eq!(group.len(), 1);
    let released = agg
        .submit(EventFragment::sent(payload(Some("sent1"))))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
}

#[tokio::test]
async fn inbound_messages_correlate_and_discard() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let (sink, mut rx) = ChannelSink::new();
    let agg = MessageAggregator::builder()
        .sink(sink)
        .discard_log(tmp.path().join("discards.jsonl"))
        .build()
        .unwrap();

    let start = InboundMessage::new(r#"{"name":"message","correlationKey":"1"}"#)
        .with_header("messageEventType", "START_MESSAGE_DEPLOYED")
        .with_header("messageEventId", "evt-start")
        .with_header("appName", "shop");
    let sent = InboundMessage::new(r#"{"businessKey":"order-7","variables":{"key":"sent1"}}"#)
        .with_header("messageEventType", "MESSAGE_SENT")
        .with_header("messageEventName", "message")
        .with_header("messageEventCorrelationKey", "1")
        .with_header("messageEventId", "evt-sent")
        .with_header("appName", "shop");

    agg.submit_message(start).await.unwrap();
    let released = agg.submit_message(sent.clone()).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].app_name.as_deref(), Some("shop"));
    assert_eq!(released[0].payload.business_key.as_deref(), Some("order-7"));
    assert_eq!(released[0].event_ids, vec!["evt-start", "evt-sent"]);
    assert_eq!(drain(&mut rx), released);

    let err = agg.submit_message(sent).await.unwrap_err();
    assert!(matches!(err, AggregationError::DuplicateDelivery { .. }));
    let err = agg
        .submit_message(InboundMessage::new("{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, AggregationError::Validation(_)));

    let reasons: Vec<_> = agg.discards().unwrap().iter().map(|d| d.reason).collect();
    assert_eq!(reasons, vec![DiscardReason::Duplicate, DiscardReason::Invalid]);
}

#[tokio::test]
async fn file_store_keeps_groups_across_aggregators() {
    let tmp = TempDir::new().expect("failed to create temp dir");

    {
        let (agg, _rx) = aggregator_with_store(&tmp);
        agg.submit(EventFragment::sent(payload(Some("sent1")))).await.unwrap();
    }

    let (agg, mut rx) = aggregator_with_store(&tmp);
    assert_eq!(agg.group_ids().unwrap(), vec![group_id()]);
    let released = agg
        .submit(EventFragment::start_deployed(payload(None)))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload.variables["key"], json!("sent1"));
    assert_eq!(drain(&mut rx).len(), 1);
}

fn aggregator_with_store(tmp: &TempDir) -> (MessageAggregator, UnboundedReceiver<MergedResult>) {
    let (sink, rx) = ChannelSink::new();
    let aggregator = MessageAggregator::builder()
        .sink(sink)
        .group_store(FileGroupStore::new(tmp.path()))
        .build()
        .expect("build should succeed");
    (aggregator, rx)
}
