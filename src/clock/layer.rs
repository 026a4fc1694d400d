//! Response-observation hook for HTTP client stacks.
//!
//! [`ClockSyncLayer`] wraps any `tower` HTTP client service. Every response
//! (success or error status) carrying a server timestamp is turned into a
//! [`ClockSample`] and fed to the shared [`ClockOffsetEstimator`].

use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use tower::{Layer, Service};

use super::{ClockOffsetEstimator, ClockSample, OffsetEstimate, SampleOutcome};

/// Feed one response's headers to the estimator.
///
/// Returns the updated estimate, or `None` when the response had no usable
/// timestamp or the sample was discarded.
pub fn observe_response(
    estimator: &ClockOffsetEstimator,
    headers: &HeaderMap,
    request_sent_at: DateTime<Utc>,
    response_received_at: DateTime<Utc>,
) -> Option<OffsetEstimate> {
    let sample = ClockSample::from_headers(headers, Some(request_sent_at), response_received_at)?;
    match estimator.record(&sample) {
        SampleOutcome::Accepted(estimate) => Some(estimate),
        SampleOutcome::Rejected(_) => None,
    }
}

#[derive(Clone)]
pub struct ClockSyncLayer {
    estimator: Arc<ClockOffsetEstimator>,
}

impl ClockSyncLayer {
    pub fn new(estimator: Arc<ClockOffsetEstimator>) -> Self {
        Self { estimator }
    }
}

impl<S> Layer<S> for ClockSyncLayer {
    type Service = ClockSync<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClockSync {
            inner,
            estimator: self.estimator.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ClockSync<S> {
    inner: S,
    estimator: Arc<ClockOffsetEstimator>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ClockSync<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Keep the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let estimator = self.estimator.clone();

        Box::pin(async move {
            let sent_at = Utc::now();
            let response = inner.call(request).await?;
            let received_at = Utc::now();

            observe_response(&estimator, response.headers(), sent_at, received_at);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use http::{header::DATE, HeaderValue, StatusCode};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    use crate::clock::SERVER_TIME_HEADER;

    fn server_ahead_by(seconds: i64) -> String {
        (Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339()
    }

    #[tokio::test]
    async fn test_layer_feeds_estimator() {
        let estimator = Arc::new(ClockOffsetEstimator::new());
        let server_time = server_ahead_by(30);

        let service = ServiceBuilder::new()
            .layer(ClockSyncLayer::new(estimator.clone()))
            .service(service_fn(move |_req: Request<()>| {
                let server_time = server_time.clone();
                async move {
                    let response = Response::builder()
                        .header(SERVER_TIME_HEADER, server_time)
                        .body(())
                        .unwrap();
                    Ok::<_, Infallible>(response)
                }
            }));

        let response = service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let estimate = estimator.estimate();
        assert_eq!(estimate.sample_count, 1);
        assert!((estimate.offset_ms - 30_000.0).abs() < 1_000.0);
    }

    #[tokio::test]
    async fn test_error_status_is_still_observed() {
        let estimator = Arc::new(ClockOffsetEstimator::new());

        let service = ClockSyncLayer::new(estimator.clone()).layer(service_fn(
            |_req: Request<()>| async {
                let response = Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .header(DATE, HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"))
                    .body(())
                    .unwrap();
                Ok::<_, Infallible>(response)
            },
        ));

        service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(estimator.estimate().sample_count, 1);
        assert!(estimator.offset_ms() < 0.0);
    }

    #[tokio::test]
    async fn test_response_without_timestamp_is_ignored() {
        let estimator = Arc::new(ClockOffsetEstimator::new());

        let service = ClockSyncLayer::new(estimator.clone()).layer(service_fn(
            |_req: Request<()>| async { Ok::<_, Infallible>(Response::new(())) },
        ));

        service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(estimator.estimate().sample_count, 0);
    }

    #[test]
    fn test_observe_response_directly() {
        let estimator = ClockOffsetEstimator::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            SERVER_TIME_HEADER,
            HeaderValue::from_static("2025-03-01T12:00:00.950Z"),
        );

        let sent = DateTime::parse_from_rfc3339("2025-03-01T12:00:00.900Z")
            .unwrap()
            .with_timezone(&Utc);
        let received = DateTime::parse_from_rfc3339("2025-03-01T12:00:01Z")
            .unwrap()
            .with_timezone(&Utc);

        let estimate = observe_response(&estimator, &headers, sent, received).unwrap();
        assert_eq!(estimate.offset_ms, 0.0);
    }
}
