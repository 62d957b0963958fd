pub mod round;
pub mod ws;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::common::state::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/entries", post(round::create_entry))
        .route("/entries/{id}", delete(round::delete_entry))
        .route("/admin/start", post(round::force_start))
        .route("/admin/end", post(round::force_end))
        .route("/round", get(round::round_status))
        .route("/results", get(round::results))
        .route("/roster", get(round::roster))
        .route("/protocol", get(round::protocol))
        .route("/diagnostics", get(round::diagnostics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use marble_core::config::GameConfig;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::service::simulation::Simulation;

    fn build_test_app() -> Router {
        let mut config = GameConfig::default();
        config.physics.seed = Some(9);
        config.physics.steps = 100;
        let (simulation, commands) = Simulation::new(config);
        tokio::spawn(simulation.clone().run_tick_loop(commands));
        app(AppState::new(simulation))
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("expected request to build")
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("expected request to build")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("expected response body");
        serde_json::from_slice(&body).expect("expected json body")
    }

    #[tokio::test]
    async fn when_round_is_fresh_then_status_is_entering() {
        let app = build_test_app();

        let response = app.oneshot(empty_request("GET", "/round")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["phase"], "entering");
        assert_eq!(payload["round"], 1);
        assert_eq!(payload["time_remaining_ms"], Value::Null);
    }

    #[tokio::test]
    async fn when_entry_name_is_blank_then_returns_400_and_error_message() {
        let app = build_test_app();

        let response = app
            .oneshot(json_request("POST", "/entries", r#"{"display_name":"   "}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "Display name must not be empty");
    }

    #[tokio::test]
    async fn when_entry_is_valid_then_it_appears_in_roster() {
        let app = build_test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/entries",
                r##"{"owner_id":"u1","display_name":"Marble","color":"#ff0000"}"##,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["id"], 0);

        let response = app.oneshot(empty_request("GET", "/roster")).await.unwrap();
        let payload = json_body(response).await;
        assert_eq!(payload.as_array().map(Vec::len), Some(1));
        assert_eq!(payload[0]["display_name"], "Marble");
    }

    #[tokio::test]
    async fn when_removing_unknown_marble_then_returns_404() {
        let app = build_test_app();

        let response = app
            .oneshot(empty_request("DELETE", "/entries/42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "Marble 42 not found");
    }

    #[tokio::test]
    async fn when_no_round_finished_then_results_returns_404() {
        let app = build_test_app();

        let response = app.oneshot(empty_request("GET", "/results")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn when_forcing_start_twice_then_second_returns_409() {
        let app = build_test_app();

        let response = app
            .clone()
            .oneshot(empty_request("POST", "/admin/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // No marbles entered, so the race finishes immediately.
        assert_eq!(json_body(response).await["phase"], "finished");

        let response = app
            .clone()
            .oneshot(empty_request("POST", "/admin/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.oneshot(empty_request("GET", "/results")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["finish_order"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn when_protocol_is_requested_then_returns_route_table() {
        let app = build_test_app();

        let response = app.oneshot(empty_request("GET", "/protocol")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["version"], 1);
        assert_eq!(payload["routes"][2]["route"], "snapshot");
        assert_eq!(payload["routes"][2]["code"], 2);
    }

    #[tokio::test]
    async fn when_no_clients_then_diagnostics_is_empty() {
        let app = build_test_app();

        let response = app
            .oneshot(empty_request("GET", "/diagnostics"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["clients"].as_array().map(Vec::len), Some(0));
        assert_eq!(payload["state_hash"].as_str().map(str::len), Some(16));
    }

    #[tokio::test]
    async fn when_entries_route_is_called_with_get_then_returns_405() {
        let app = build_test_app();

        let response = app.oneshot(empty_request("GET", "/entries")).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
