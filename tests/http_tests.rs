//! Integration tests for the HTTP recovery middleware.

use std::convert::Infallible;
use std::error::Error;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower::{service_fn, Layer, ServiceExt};

use panic_recovery::handler::{self, ErrorContext};
use panic_recovery::http::{self as recovery_http, AbortHandler, RecoveryLayer};
use panic_recovery::{fault, throw, Fault};

#[derive(Debug, Clone, PartialEq)]
struct Reported {
    context: String,
    message: String,
    is_panic: bool,
}

type Reports = Arc<Mutex<Vec<Reported>>>;

fn recording_layer() -> (RecoveryLayer, Reports) {
    let reports: Reports = Arc::default();
    let sink = Arc::clone(&reports);
    let layer = RecoveryLayer::with_shared_reporter(handler::from_fn(
        move |context: &ErrorContext, error: &(dyn Error + 'static)| {
            sink.lock().unwrap().push(Reported {
                context: context.to_string(),
                message: error.to_string(),
                is_panic: fault::is_panic(error),
            });
        },
    ));
    (layer, reports)
}

async fn ok_route() -> &'static str {
    "ok"
}

async fn panic_route() -> &'static str {
    panic!("handler exploded")
}

async fn throw_route() -> &'static str {
    throw("order 7 not found")
}

async fn abort_route() -> &'static str {
    recovery_http::abort()
}

fn create_test_app(layer: RecoveryLayer) -> Router {
    Router::new()
        .route("/ok", get(ok_route))
        .route("/panic", get(panic_route))
        .route("/throw", get(throw_route))
        .route("/abort", get(abort_route))
        .layer(layer)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_successful_request_is_untouched() {
    let (layer, reports) = recording_layer();
    let response = create_test_app(layer)
        .oneshot(get_request("/ok"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    assert_eq!(&body[..], b"ok");
    assert!(reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_panic_becomes_internal_server_error() {
    let (layer, reports) = recording_layer();
    let response = create_test_app(layer)
        .oneshot(get_request("/panic"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    assert!(body.is_empty());

    let reports = reports.lock().unwrap();
    assert_eq!(
        *reports,
        vec![Reported {
            context: "GET /panic".to_string(),
            message: "panic: handler exploded".to_string(),
            is_panic: true,
        }]
    );
}

#[tokio::test]
async fn test_thrown_error_is_reported_unwrapped() {
    let (layer, reports) = recording_layer();
    let response = create_test_app(layer)
        .oneshot(get_request("/throw"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].message, "order 7 not found");
    assert!(!reports[0].is_panic);
}

#[tokio::test]
async fn test_abort_drops_request_without_report() {
    let (layer, reports) = recording_layer();
    let app = create_test_app(layer);

    let joined = tokio::spawn(app.oneshot(get_request("/abort"))).await;
    let err = joined.expect_err("abort should unwind the task");
    assert!(err.is_panic());
    assert!(err.into_panic().is::<AbortHandler>());
    assert!(reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_upgrade_request_is_reported_then_aborted() {
    let (layer, reports) = recording_layer();
    let app = create_test_app(layer);

    let request = Request::builder()
        .uri("/panic")
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .body(Body::empty())
        .unwrap();

    let joined = tokio::spawn(app.oneshot(request)).await;
    let err = joined.expect_err("upgrade failure should unwind the task");
    assert!(err.into_panic().is::<AbortHandler>());

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].message, "panic: handler exploded");
}

#[tokio::test]
async fn test_panic_while_building_future_is_recovered() {
    let (layer, reports) = recording_layer();
    let service = layer.layer(service_fn(
        |_request: Request<Body>| -> std::future::Ready<Result<Response, Infallible>> {
            panic!("no future for you")
        },
    ));

    let response = service
        .oneshot(Request::post("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].context, "POST /jobs");
    assert_eq!(reports[0].message, "panic: no future for you");
}

#[tokio::test]
async fn test_reported_fault_carries_stack() {
    let stacks: Arc<Mutex<Vec<bool>>> = Arc::default();
    let sink = Arc::clone(&stacks);
    let layer = RecoveryLayer::with_shared_reporter(handler::from_fn(
        move |_context: &ErrorContext, error: &(dyn Error + 'static)| {
            let has_stack = error
                .downcast_ref::<Fault>()
                .is_some_and(Fault::has_stack);
            sink.lock().unwrap().push(has_stack);
        },
    ));

    let response = create_test_app(layer)
        .oneshot(get_request("/panic"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(*stacks.lock().unwrap(), vec![true]);
}
