use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Query, State as AxumState, rejection::QueryRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::{
    error::AppError,
    page::{NOBODY, UNRECOGNIZED, render},
    state::State,
    utils::origin_address,
};

pub const NFCID: &str = "nfcid";

/// Value of the first `nfcid` in the query. Missing or empty is `None`.
fn first_nfcid(query: Result<Query<Vec<(String, String)>>, QueryRejection>) -> Option<String> {
    let Query(pairs) = query
        .map_err(|e| warn!("Unreadable query string: {e}"))
        .ok()?;

    pairs
        .into_iter()
        .find(|(key, _)| key == NFCID)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

pub async fn tap_handler(
    AxumState(state): AxumState<Arc<State>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let Some(nfcid) = first_nfcid(query) else {
        info!("No NFC-ID found");
        return render(NOBODY, UNRECOGNIZED).into_response();
    };

    let ip = origin_address(&headers, peer);

    match state.checkpoint.toggle(&nfcid, &ip).await {
        Ok(outcome) => render(&nfcid, &outcome.message()).into_response(),
        Err(e) => AppError::from_toggle(&nfcid, e).into_response(),
    }
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::{Body, to_bytes},
        extract::connect_info::MockConnectInfo,
        http::Request,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        build_router,
        checkpoint::tests::{ManualClock, at},
        config::{Backend, Config},
        memory::MemoryStore,
        store::{Status, StatusStore},
    };

    fn app() -> (Router, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::at(at(10, 0, 0));
        let config = Config {
            port: 0,
            backend: Backend::Memory,
            table_name: "tapevents".to_string(),
        };
        let state = State::with_store(config, store.clone(), clock.clone());
        let peer: SocketAddr = "192.168.1.20:51000".parse().unwrap();

        (build_router(state).layer(MockConnectInfo(peer)), store, clock)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_missing_nfcid_is_unrecognized() {
        let (app, store, _) = app();

        for uri in ["/", "/?nfcid=", "/?other=1"] {
            let (status, body) = get(&app, uri).await;

            assert_eq!(status, StatusCode::OK);
            assert!(body.contains("Hi nobody"));
            assert!(body.contains("I didn&#39;t recognize you (got no NFC-ID)"));
        }

        assert_eq!(store.status_count(), 0);
        assert_eq!(store.visit_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_nfcid_uses_the_first() {
        let (app, store, _) = app();

        let (status, body) = get(&app, "/?nfcid=a&nfcid=b").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Hi a"));
        assert!(body.contains("enjoy your stay!"));
        assert_eq!(store.status_count(), 1);
        assert_eq!(store.get_status("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_odd_query_strings_still_render_a_page() {
        let (app, store, _) = app();

        for uri in ["/?nfcid", "/?&&=", "/?nfcid=%ZZ", "/?%E0%A4%A=1"] {
            let (status, body) = get(&app, uri).await;

            assert_eq!(status, StatusCode::OK, "{uri}");
            assert!(body.contains("<html>"), "{uri}");
        }

        assert_eq!(store.visit_count(), 0);
    }

    #[tokio::test]
    async fn test_enter_then_exit() {
        let (app, store, clock) = app();

        let (status, body) = get(&app, "/?nfcid=04A2B3").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Hi 04A2B3"));
        assert!(body.contains("enjoy your stay!"));

        clock.set(at(10, 2, 30));
        let (_, body) = get(&app, "/?nfcid=04A2B3").await;
        assert!(body.contains("you stayed for 2 minutes and 30 seconds. Thanks for visiting!"));

        let visits = store.list_visits("04A2B3").await.unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].ip.as_deref(), Some("192.168.1.20"));
    }

    #[tokio::test]
    async fn test_forwarded_for_is_recorded() {
        let (app, store, _) = app();

        get(&app, "/?nfcid=abc").await;
        let response = app
            .clone()
            .oneshot(
                Request::get("/?nfcid=abc")
                    .header("x-forwarded-for", "203.0.113.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let visits = store.list_visits("abc").await.unwrap();
        assert_eq!(visits[0].ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_corruption_renders_error_page() {
        let (app, store, _) = app();
        store.insert_raw("abc", "wandering", at(9, 0, 0));

        let (status, body) = get(&app, "/?nfcid=abc").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("corrupted"));
        assert_eq!(store.visit_count(), 0);

        let (status, _) = get(&app, "/?nfcid=other").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            store.get_status("other").await.unwrap().unwrap().status,
            Status::Entering
        );
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
