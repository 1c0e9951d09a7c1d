//! Inbound dispatch
//!
//! Classifies each received payload and routes it: media goes to the
//! playback buffer, detection sets replace the overlay's current set.
//! Blob payloads must be materialized before they can be classified;
//! materializations may overlap but results come out strictly in arrival
//! order, so routing sees one message at a time.

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesOrdered;
use futures_util::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::NetworkError;
use crate::network::InboundPayload;
use crate::overlay::DetectionStore;
use crate::playback::buffer::PlaybackBuffer;
use crate::protocol::{Detection, InboundMessage};

/// Classify a text payload. Only a JSON array of detections is accepted.
pub fn classify_text(text: &str) -> InboundMessage {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return InboundMessage::Unrecognized(format!("not JSON: {e}")),
    };
    if !value.is_array() {
        return InboundMessage::Unrecognized("JSON payload is not an array".into());
    }
    match serde_json::from_value::<Vec<Detection>>(value) {
        Ok(detections) => {
            InboundMessage::DetectionSet(detections.into_iter().map(Detection::normalized).collect())
        }
        Err(e) => InboundMessage::Unrecognized(format!("malformed detection array: {e}")),
    }
}

/// Classify one payload, materializing it first if needed
pub async fn classify(payload: InboundPayload) -> InboundMessage {
    match payload {
        InboundPayload::Binary(data) => InboundMessage::MediaChunk(data),
        InboundPayload::Text(text) => classify_text(&text),
        InboundPayload::Blob(blob) => match blob.materialize().await {
            Ok(data) => InboundMessage::MediaChunk(data),
            Err(e) => InboundMessage::Unrecognized(format!("blob unavailable: {e}")),
        },
    }
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    media_chunks: AtomicU64,
    detection_sets: AtomicU64,
    unrecognized: AtomicU64,
    playback_rejected: AtomicU64,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            media_chunks: self.media_chunks.load(Ordering::Relaxed),
            detection_sets: self.detection_sets.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            playback_rejected: self.playback_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub media_chunks: u64,
    pub detection_sets: u64,
    pub unrecognized: u64,
    pub playback_rejected: u64,
}

/// Orders, classifies and routes inbound payloads
#[derive(Default)]
pub struct InboundDispatcher {
    pending: FuturesOrdered<BoxFuture<'static, InboundMessage>>,
    counters: Arc<DispatchCounters>,
}

impl InboundDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        self.counters.clone()
    }

    /// Queue a payload behind everything received before it
    pub fn push(&mut self, payload: InboundPayload) {
        self.pending.push_back(classify(payload).boxed());
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Next classified message in arrival order. `None` when nothing is queued.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.pending.next().await
    }

    /// Hand a classified message to its consumer
    pub fn route(&self, message: InboundMessage, playback: &mut PlaybackBuffer, detections: &DetectionStore) {
        match message {
            InboundMessage::MediaChunk(data) => {
                self.counters.media_chunks.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = playback.append(data) {
                    self.counters.playback_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Media chunk dropped: {}", e);
                }
            }
            InboundMessage::DetectionSet(set) => {
                self.counters.detection_sets.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Detection set with {} entries", set.len());
                detections.replace(set);
            }
            InboundMessage::Unrecognized(reason) => {
                self.counters.unrecognized.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}", NetworkError::ReceiveError(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BlobHandle;
    use crate::playback::buffer::tests::ScriptedSink;
    use crate::playback::buffer::SinkState;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    #[test]
    fn test_detection_array() {
        let msg = classify_text(r#"[{"id":1,"label":"cat","box":[10,20,100,80],"confidence":0.92}]"#);
        match msg {
            InboundMessage::DetectionSet(set) => {
                assert_eq!(set.len(), 1);
                assert_eq!(set[0].label, "cat");
                assert_eq!(set[0].confidence, Some(0.92));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_array_clears() {
        assert_eq!(classify_text("[]"), InboundMessage::DetectionSet(Vec::new()));
    }

    #[test]
    fn test_confidence_clamped() {
        let msg = classify_text(r#"[{"id":2,"label":"dog","box":[0,0,1,1],"confidence":1.7}]"#);
        let InboundMessage::DetectionSet(set) = msg else {
            panic!("expected detections");
        };
        assert_eq!(set[0].confidence, Some(1.0));
    }

    #[test]
    fn test_rejects_non_arrays() {
        assert!(matches!(classify_text("hello"), InboundMessage::Unrecognized(_)));
        assert!(matches!(classify_text(r#"{"id":1}"#), InboundMessage::Unrecognized(_)));
        assert!(matches!(classify_text(r#"[{"id":"x"}]"#), InboundMessage::Unrecognized(_)));
    }

    #[tokio::test]
    async fn test_binary_is_media() {
        let msg = classify(InboundPayload::Binary(Bytes::from_static(b"\xff\xd8"))).await;
        assert_eq!(msg, InboundMessage::MediaChunk(Bytes::from_static(b"\xff\xd8")));
    }

    fn delayed_blob() -> (BlobHandle, oneshot::Sender<Bytes>) {
        let (tx, rx) = oneshot::channel::<Bytes>();
        let blob = BlobHandle::new(None, async move {
            rx.await
                .map_err(|_| NetworkError::ReceiveError("blob dropped".into()))
        });
        (blob, tx)
    }

    #[tokio::test]
    async fn test_blobs_are_appended_in_arrival_order() {
        let sink = ScriptedSink::new(SinkState::Open);
        let mut playback = PlaybackBuffer::new();
        playback.attach(Box::new(sink.clone()));
        let detections = DetectionStore::new();
        let mut dispatcher = InboundDispatcher::new();

        let (a, a_tx) = delayed_blob();
        let (b, b_tx) = delayed_blob();
        let (c, c_tx) = delayed_blob();
        dispatcher.push(InboundPayload::Blob(a));
        dispatcher.push(InboundPayload::Blob(b));
        dispatcher.push(InboundPayload::Blob(c));

        // Materialization finishes out of order
        c_tx.send(Bytes::from_static(b"C")).unwrap();
        b_tx.send(Bytes::from_static(b"B")).unwrap();
        a_tx.send(Bytes::from_static(b"A")).unwrap();

        while let Some(msg) = dispatcher.next().await {
            dispatcher.route(msg, &mut playback, &detections);
        }

        let order: Vec<Bytes> = sink.appended.lock().clone();
        assert_eq!(
            order,
            vec![Bytes::from_static(b"A"), Bytes::from_static(b"B"), Bytes::from_static(b"C")]
        );
        assert_eq!(dispatcher.counters().snapshot().media_chunks, 3);
        assert!(!dispatcher.has_pending());
    }

    #[tokio::test]
    async fn test_text_waits_behind_pending_blob() {
        let mut dispatcher = InboundDispatcher::new();
        let (blob, tx) = delayed_blob();
        dispatcher.push(InboundPayload::Blob(blob));
        dispatcher.push(InboundPayload::Text("[]".into()));

        tx.send(Bytes::from_static(b"M")).unwrap();
        assert_eq!(dispatcher.next().await, Some(InboundMessage::MediaChunk(Bytes::from_static(b"M"))));
        assert_eq!(dispatcher.next().await, Some(InboundMessage::DetectionSet(Vec::new())));
        assert_eq!(dispatcher.next().await, None);
    }

    #[tokio::test]
    async fn test_route_replaces_detections_and_counts_rejections() {
        let mut playback = PlaybackBuffer::new();
        let detections = DetectionStore::new();
        let dispatcher = InboundDispatcher::new();

        dispatcher.route(classify_text(r#"[{"id":1,"label":"a","box":[0,0,1,1]}]"#), &mut playback, &detections);
        dispatcher.route(InboundMessage::MediaChunk(Bytes::from_static(b"x")), &mut playback, &detections);
        dispatcher.route(classify_text("oops"), &mut playback, &detections);

        assert_eq!(detections.latest().len(), 1);
        let stats = dispatcher.counters().snapshot();
        assert_eq!(stats.detection_sets, 1);
        assert_eq!(stats.playback_rejected, 1);
        assert_eq!(stats.unrecognized, 1);
    }
}
