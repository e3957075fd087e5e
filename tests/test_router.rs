//! End-to-end behavior of the query router over scripted backends

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tsrouter::backend::BackendServer;
use tsrouter::config::RouterConfig;
use tsrouter::errors::{ApiStatus, RouterError};
use tsrouter::routing::RoutingCache;
use tsrouter::router::QueryRouter;
use tsrouter::stats::{Stats, StatsSink};
use tsrouter::types::{MultiFetchRequest, MultiGlobRequest, Timeouts};

use test_helpers::{group, metric, MockBackend};

/// Sink that records every published snapshot
#[derive(Default)]
struct RecordingSink {
    snapshots: Mutex<Vec<Stats>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    fn last(&self) -> Option<Stats> {
        self.snapshots.lock().unwrap().last().copied()
    }
}

impl StatsSink for RecordingSink {
    fn publish(&self, stats: &Stats) {
        self.snapshots.lock().unwrap().push(*stats);
    }
}

fn router_over(
    children: Vec<Arc<dyn BackendServer>>,
) -> (QueryRouter, Arc<RecordingSink>) {
    let root = group(children, Timeouts::default())
        .into_root(RoutingCache::new(Duration::from_secs(600)));
    let sink = Arc::new(RecordingSink::default());
    let config = RouterConfig::default();
    let router = QueryRouter::start(Arc::new(root), &config, Arc::clone(&sink) as _);
    (router, sink)
}

#[tokio::test]
async fn test_fetch_returns_merged_data_and_publishes_stats() {
    let backend = Arc::new(
        MockBackend::named("b1").with_metrics(vec![metric("a.b.c", vec![1.0, 2.0, 3.0])]),
    );
    let (router, sink) = router_over(vec![backend]);

    let outcome = router
        .fetch(&MultiFetchRequest::single("a.b.c", 60, 180))
        .await
        .unwrap();

    assert_eq!(outcome.data.metrics.len(), 1);
    assert!(outcome.partial_errors.is_empty());
    assert_eq!(sink.count(), 1);
    assert_eq!(sink.last().unwrap().render_requests, 1);
    router.stop();
}

#[tokio::test]
async fn test_fetch_with_no_backends_answering_maps_to_service_unavailable() {
    let broken = Arc::new(MockBackend::named("broken").failing(
        RouterError::BackendFailed {
            backend: "broken".to_string(),
            reason: "connection refused".to_string(),
        },
    ));
    let (router, sink) = router_over(vec![broken]);

    let err = router
        .fetch(&MultiFetchRequest::single("a.b.c", 60, 180))
        .await
        .unwrap_err();

    assert_eq!(err.status, ApiStatus::ServiceUnavailable);
    assert_eq!(err.status.as_u16(), 503);
    // Counters still published on failure
    assert_eq!(sink.count(), 1);
    router.stop();
}

#[tokio::test]
async fn test_empty_fetch_rejected_as_bad_request() {
    let backend = Arc::new(MockBackend::named("b1"));
    let (router, sink) = router_over(vec![backend]);

    let err = router
        .fetch(&MultiFetchRequest::default())
        .await
        .unwrap_err();

    assert_eq!(err.status, ApiStatus::BadRequest);
    assert_eq!(sink.count(), 0);
    router.stop();
}

#[tokio::test]
async fn test_find_miss_maps_to_not_found() {
    let backend = Arc::new(MockBackend::named("b1"));
    let (router, _sink) = router_over(vec![backend]);

    let err = router
        .find(&MultiGlobRequest::single("no.such.*"))
        .await
        .unwrap_err();

    assert_eq!(err.status, ApiStatus::NotFound);
    assert_eq!(err.status.as_u16(), 404);
    router.stop();
}

#[tokio::test]
async fn test_partial_failure_surfaces_as_partial_errors() {
    let healthy = Arc::new(
        MockBackend::named("healthy").with_metrics(vec![metric("a.b.c", vec![1.0])]),
    );
    let broken = Arc::new(MockBackend::named("broken").failing(
        RouterError::BackendFailed {
            backend: "broken".to_string(),
            reason: "connection refused".to_string(),
        },
    ));
    let (router, _sink) = router_over(vec![healthy, broken]);

    let outcome = router
        .fetch(&MultiFetchRequest::single("a.b.c", 60, 180))
        .await
        .unwrap();

    assert_eq!(outcome.data.metrics.len(), 1);
    assert_eq!(outcome.partial_errors.len(), 1);
    router.stop();
}

#[tokio::test]
async fn test_startup_probe_warms_routing_cache() {
    let backend = Arc::new(MockBackend::named("b1").with_tlds(&["carbon"]));
    let root = Arc::new(
        group(
            vec![Arc::clone(&backend) as Arc<dyn BackendServer>],
            Timeouts::default(),
        )
        .into_root(RoutingCache::new(Duration::from_secs(600))),
    );
    let cache = Arc::clone(root.routing_cache().unwrap());

    let router = QueryRouter::start(
        Arc::clone(&root),
        &RouterConfig::default(),
        Arc::new(RecordingSink::default()) as _,
    );

    // The probe loop fires immediately on startup; give it a beat
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.tlds(), vec!["carbon"]);
    router.stop();
}

#[tokio::test]
async fn test_tag_queries_pass_through_and_publish_stats() {
    let backend = Arc::new(MockBackend::named("b1").with_tags(&["dc", "host"]));
    let (router, sink) = router_over(vec![backend]);

    let names = router.tag_names("h", 0).await.unwrap();
    assert_eq!(names.data, vec!["host"]);
    assert_eq!(sink.count(), 1);

    let values = router.tag_values("host", "", 0).await.unwrap();
    assert_eq!(values.data, vec!["dc", "host"]);
    // Each tag call publishes one counter snapshot, like every other call
    assert_eq!(sink.count(), 2);
    router.stop();
}

#[tokio::test]
async fn test_list_and_details_round_trip() {
    let backend = Arc::new(
        MockBackend::named("b1")
            .with_list(&["a.one", "a.two"])
            .with_details(&["a.one"]),
    );
    let (router, sink) = router_over(vec![backend]);

    let listed = router.list().await.unwrap();
    assert_eq!(listed.data, vec!["a.one", "a.two"]);

    let details = router.details().await.unwrap();
    assert!(details.data["b1"].metrics.contains_key("a.one"));
    assert_eq!(sink.count(), 2);
    router.stop();
}

#[tokio::test]
async fn test_details_not_supported_anywhere_is_an_error() {
    // MockBackend without scripted details uses "not supported"
    let backend = Arc::new(MockBackend::named("b1"));
    let (router, _sink) = router_over(vec![backend]);

    let err = router.details().await.unwrap_err();
    assert_eq!(err.status, ApiStatus::NotFound);
    router.stop();
}

#[tokio::test]
async fn test_info_not_supported_anywhere_maps_to_not_found() {
    // MockBackend uses the default info implementation ("not supported")
    let backend = Arc::new(MockBackend::named("b1"));
    let (router, _sink) = router_over(vec![backend]);

    let err = router.info(&["a.b.c".to_string()]).await.unwrap_err();
    assert_eq!(err.status, ApiStatus::NotFound);
    router.stop();
}
