//! Response pipeline
//!
//! Applies a [`TransformDecision`] to the upstream response. Pass-through
//! responses stream untouched; transformed responses are buffered in full,
//! rewritten, and re-framed with a fresh `content-length` before the first
//! byte reaches the client.

use crate::proxy::dump::DiagnosticDump;
use crate::proxy::event_bus::{Continuation, InterceptEvent, InterceptionBus};
use crate::proxy::headers::{self, CONTENT_LENGTH};
use crate::proxy::resolver::{TextRewrite, TransformDecision};
use crate::proxy::types::{
    full_body, BodySizeLimit, BoxError, DumpName, ProxyBody, ProxyError, ProxyFuture, ProxyResult,
};
use bytes::Bytes;
use http::response::Parts;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Collected, LengthLimitError, Limited};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ResponsePipeline {
    bus: Arc<InterceptionBus>,
    dump: DiagnosticDump,
    max_body_size: BodySizeLimit,
    listener_timeout: Duration,
}

impl ResponsePipeline {
    pub fn new(
        bus: Arc<InterceptionBus>,
        dump: DiagnosticDump,
        max_body_size: BodySizeLimit,
        listener_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            dump,
            max_body_size,
            listener_timeout,
        }
    }

    /// Produce the response sent to the client
    ///
    /// Errors mean the response could not be completed; the caller must abort
    /// the client connection rather than write anything.
    pub fn handle(
        &self,
        decision: TransformDecision,
        response: Response<ProxyBody>,
    ) -> ProxyFuture<'_, Response<ProxyBody>> {
        Box::pin(async move {
            if decision.buffers_body() && !self.can_buffer(&response) {
                return Ok(response);
            }

            match decision {
                TransformDecision::NoTransform => Ok(response),
                TransformDecision::TextInject(rewrite) => {
                    self.inject_text(rewrite, response).await
                }
                TransformDecision::JsonIntercept { event, dump } => {
                    self.intercept_json(event, &dump, response).await
                }
            }
        })
    }

    /// Bodiless, encoded or oversized responses are forwarded as received
    fn can_buffer(&self, response: &Response<ProxyBody>) -> bool {
        let status = response.status();
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            debug!(%status, "Response has no body to transform; passing through");
            return false;
        }

        if headers::has_content_coding(response.headers()) {
            debug!("Response carries a content coding; passing through");
            return false;
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(length) = declared {
            if length > *self.max_body_size.as_ref() {
                warn!(
                    length,
                    max = %self.max_body_size,
                    "Response larger than transform limit; passing through"
                );
                return false;
            }
        }
        true
    }

    async fn inject_text(
        &self,
        rewrite: TextRewrite,
        response: Response<ProxyBody>,
    ) -> ProxyResult<Response<ProxyBody>> {
        let (parts, body) = response.into_parts();
        let raw = self.collect(body).await?;

        let rewritten = match std::str::from_utf8(&raw) {
            Ok(text) => Bytes::from(rewrite.apply(text)),
            Err(e) => {
                warn!(error = %e, "Battle page is not valid UTF-8; forwarding unmodified");
                raw
            }
        };

        Ok(Self::rebuild(parts, rewritten))
    }

    async fn intercept_json(
        &self,
        event: InterceptEvent,
        dump: &DumpName,
        response: Response<ProxyBody>,
    ) -> ProxyResult<Response<ProxyBody>> {
        let (parts, body) = response.into_parts();
        let raw = self.collect(body).await?;

        let parsed = serde_json::from_slice::<Value>(&raw);
        self.dump.dump(dump, raw.clone());

        let mut payload = match parsed {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%event, error = %e, "Failed to decode intercepted JSON; forwarding unmodified");
                return Ok(Self::rebuild(parts, raw));
            }
        };

        let (continuation, completion) = Continuation::channel(event);
        let invoked = self.bus.emit(event, &mut payload, &continuation);
        // Only listener-held clones may keep the channel open from here on
        drop(continuation);

        if invoked == 0 {
            debug!(%event, "Listeners went away before emit; forwarding unmodified");
            return Ok(Self::rebuild(parts, raw));
        }

        let payload = match tokio::time::timeout(self.listener_timeout, completion).await {
            Ok(Ok(resumed)) => resumed,
            Ok(Err(_)) => {
                warn!(%event, "Listeners returned without resuming; sending payload as mutated");
                payload
            }
            Err(_) => {
                warn!(
                    %event,
                    timeout_ms = self.listener_timeout.as_millis() as u64,
                    "Listeners did not resume in time; sending payload as mutated"
                );
                payload
            }
        };

        let encoded = serde_json::to_vec(&payload)?;
        Ok(Self::rebuild(parts, Bytes::from(encoded)))
    }

    async fn collect(&self, body: ProxyBody) -> ProxyResult<Bytes> {
        let max_size = self.max_body_size;
        let collecting: Pin<Box<dyn Future<Output = Result<Collected<Bytes>, BoxError>> + Send>> =
            Box::pin(Limited::new(body, *max_size.as_ref()).collect());
        match collecting.await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(ProxyError::ResponseTooLarge { max_size })
            }
            Err(e) => Err(ProxyError::Body(e)),
        }
    }

    fn rebuild(mut parts: Parts, body: Bytes) -> Response<ProxyBody> {
        headers::reframe(&mut parts.headers, body.len());
        Response::from_parts(parts, full_body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::headers::{CONTENT_ENCODING, TRANSFER_ENCODING};
    use rstest::rstest;
    use serde_json::json;

    const EVENT: InterceptEvent = InterceptEvent::BattleInitData;

    fn dump_name() -> DumpName {
        DumpName::try_new("get_battle_init_data").unwrap()
    }

    fn pipeline_with(bus: Arc<InterceptionBus>, dump: DiagnosticDump) -> ResponsePipeline {
        ResponsePipeline::new(
            bus,
            dump,
            BodySizeLimit::try_new(1024).unwrap(),
            Duration::from_millis(200),
        )
    }

    fn pipeline(bus: Arc<InterceptionBus>) -> ResponsePipeline {
        pipeline_with(bus, DiagnosticDump::disabled())
    }

    fn upstream(body: &'static [u8]) -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::OK)
            .header(TRANSFER_ENCODING, "chunked")
            .header("x-upstream", "1")
            .body(full_body(Bytes::from_static(body)))
            .unwrap()
    }

    async fn body_of(response: Response<ProxyBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn intercept() -> TransformDecision {
        TransformDecision::JsonIntercept {
            event: EVENT,
            dump: dump_name(),
        }
    }

    #[tokio::test]
    async fn test_no_transform_keeps_framing() {
        let pipeline = pipeline(Arc::new(InterceptionBus::new()));

        let response = pipeline
            .handle(TransformDecision::NoTransform, upstream(b"raw bytes"))
            .await
            .unwrap();

        assert_eq!(response.headers().get(TRANSFER_ENCODING).unwrap(), "chunked");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(body_of(response).await, "raw bytes");
    }

    #[tokio::test]
    async fn test_text_inject_rewrites_and_reframes() {
        let pipeline = pipeline(Arc::new(InterceptionBus::new()));
        let decision = TransformDecision::TextInject(TextRewrite::insert_before_closing_body(
            "<script></script>",
        ));

        let response = pipeline
            .handle(decision, upstream(b"<html><body>hi</body></html>"))
            .await
            .unwrap();

        let expected = "<html><body>hi<script></script></body></html>";
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "1");
        assert!(response.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(
            response.headers().get(CONTENT_LENGTH).unwrap(),
            &expected.len().to_string()
        );
        assert_eq!(body_of(response).await, expected);
    }

    #[tokio::test]
    async fn test_encoded_body_is_not_rewritten() {
        let pipeline = pipeline(Arc::new(InterceptionBus::new()));
        let mut response = upstream(b"\x1f\x8b compressed");
        response
            .headers_mut()
            .insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        let decision =
            TransformDecision::TextInject(TextRewrite::insert_before_closing_body("<x/>"));

        let response = pipeline.handle(decision, response).await.unwrap();

        assert_eq!(body_of(response).await, &b"\x1f\x8b compressed"[..]);
    }

    #[tokio::test]
    async fn test_oversized_body_fails_instead_of_truncating() {
        let pipeline = ResponsePipeline::new(
            Arc::new(InterceptionBus::new()),
            DiagnosticDump::disabled(),
            BodySizeLimit::try_new(4).unwrap(),
            Duration::from_millis(200),
        );
        let decision =
            TransformDecision::TextInject(TextRewrite::insert_before_closing_body("<x/>"));

        let result = pipeline.handle(decision, upstream(b"<body></body>")).await;

        assert!(matches!(result, Err(ProxyError::ResponseTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_json_listener_mutation_reaches_client() {
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |payload: &mut Value, continuation: &Continuation| {
            payload["injected"] = json!(true);
            continuation.resume(payload.clone());
        });

        let response = pipeline(bus)
            .handle(intercept(), upstream(br#"{"battle":{"rounds":3}}"#))
            .await
            .unwrap();

        let length: usize = response.headers()[CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_of(response).await;
        assert_eq!(body.len(), length);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "battle": { "rounds": 3 }, "injected": true }));
    }

    #[tokio::test]
    async fn test_json_round_trip_without_mutation() {
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |payload: &mut Value, continuation: &Continuation| {
            continuation.resume(payload.clone());
        });
        let original = br#"{ "battle": { "buddy": [1, 2, 3], "name": "Cid" } }"#;

        let response = pipeline(bus)
            .handle(intercept(), upstream(original))
            .await
            .unwrap();

        let sent: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        let expected: Value = serde_json::from_slice(original).unwrap();
        assert_eq!(sent, expected);
    }

    #[tokio::test]
    async fn test_malformed_json_forwards_original_bytes() {
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |_: &mut Value, _: &Continuation| {
            panic!("listener must not run for undecodable bodies");
        });

        let response = pipeline(bus)
            .handle(intercept(), upstream(b"{not json"))
            .await
            .unwrap();

        assert_eq!(body_of(response).await, "{not json");
    }

    #[tokio::test]
    async fn test_listener_resuming_later_from_a_task() {
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |payload: &mut Value, continuation: &Continuation| {
            let continuation = continuation.clone();
            let mut payload = payload.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                payload["late"] = json!(1);
                continuation.resume(payload);
            });
        });

        let response = pipeline(bus)
            .handle(intercept(), upstream(br#"{"a":1}"#))
            .await
            .unwrap();

        let value: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(value, json!({ "a": 1, "late": 1 }));
    }

    #[tokio::test]
    async fn test_listener_that_never_resumes_falls_back_to_mutated_payload() {
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |payload: &mut Value, _: &Continuation| {
            payload["touched"] = json!(true);
        });

        let response = pipeline(bus)
            .handle(intercept(), upstream(br#"{"a":1}"#))
            .await
            .unwrap();

        let value: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(value, json!({ "a": 1, "touched": true }));
    }

    #[tokio::test]
    async fn test_held_continuation_times_out() {
        let bus = Arc::new(InterceptionBus::new());
        let held = Arc::new(parking_lot::Mutex::new(None));
        let slot = held.clone();
        bus.on(EVENT, move |_: &mut Value, continuation: &Continuation| {
            *slot.lock() = Some(continuation.clone());
        });

        let response = pipeline(bus)
            .handle(intercept(), upstream(br#"{"a":1}"#))
            .await
            .unwrap();

        let value: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(value, json!({ "a": 1 }));
        let late = held.lock().take().unwrap();
        assert!(!late.resume(json!({})));
    }

    #[tokio::test]
    async fn test_intercept_dumps_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dump = DiagnosticDump::new(dir.path(), vec!["get_battle_init_data".to_string()]);
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |payload: &mut Value, continuation: &Continuation| {
            continuation.resume(payload.clone());
        });
        let raw = br#"{"battle" : 1}"#;

        pipeline_with(bus, dump)
            .handle(intercept(), upstream(raw))
            .await
            .unwrap();

        // The write runs in the background
        let mut files = Vec::new();
        for _ in 0..50 {
            files = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .collect();
            let complete = files
                .first()
                .is_some_and(|f| std::fs::read(f).unwrap().len() == raw.len());
            if complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), raw);
    }

    #[rstest]
    #[case(StatusCode::NOT_MODIFIED)]
    #[case(StatusCode::NO_CONTENT)]
    #[tokio::test]
    async fn test_bodiless_status_keeps_upstream_framing(#[case] status: StatusCode) {
        let pipeline = pipeline(Arc::new(InterceptionBus::new()));
        let decision = TransformDecision::TextInject(TextRewrite::insert_before_closing_body(
            "<script></script>",
        ));
        let response = Response::builder()
            .status(status)
            .header(CONTENT_LENGTH, "500")
            .body(full_body(Bytes::new()))
            .unwrap();

        let response = pipeline.handle(decision, response).await.unwrap();

        assert_eq!(response.status(), status);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "500");
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_intercept_keeps_upstream_key_order() {
        let bus = Arc::new(InterceptionBus::new());
        bus.on(EVENT, |payload: &mut Value, continuation: &Continuation| {
            payload["middle"] = json!(3);
            continuation.resume(payload.clone());
        });

        let response = pipeline(bus)
            .handle(intercept(), upstream(br#"{"zeta":1,"alpha":2}"#))
            .await
            .unwrap();

        assert_eq!(body_of(response).await, r#"{"zeta":1,"alpha":2,"middle":3}"#);
    }
}
