use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::driver::SimulationDriver;
use super::models::{NewOrder, OrderStatus, ProcessStep, parse_step_chain};
use super::simulator::Simulator;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::FactoryError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub simulator: Simulator,
    pub driver: SimulationDriver,
    pub default_interval: Duration,
}

impl AppState {
    /// Wire up simulator and driver around one database handle and event channel.
    pub fn new(
        db: DbHandle,
        clock: Arc<dyn super::clock::Clock>,
        ws_tx: broadcast::Sender<String>,
        default_interval: Duration,
    ) -> Self {
        let simulator = Simulator::new(db.clone(), clock, ws_tx.clone());
        let driver = SimulationDriver::new(simulator.clone());
        Self {
            db,
            ws_tx,
            simulator,
            driver,
            default_interval,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

/// A step chain given either as `[1, 2, 3]` or as `"1->2->3"`.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum StepChainInput {
    List(Vec<i64>),
    Text(String),
}

impl StepChainInput {
    fn into_ids(self) -> Vec<i64> {
        match self {
            StepChainInput::List(ids) => ids,
            StepChainInput::Text(text) => parse_step_chain(&text),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub order_id: Option<String>,
    pub step_chain: StepChainInput,
    pub amount: i64,
    pub customer: Option<String>,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct UpsertStepRequest {
    pub name: String,
    pub station: String,
    pub estimated_seconds: Option<i64>,
    pub description: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct StartDriverRequest {
    pub interval_ms: Option<u64>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<FactoryError>() {
            Some(fe) if fe.is_not_found() => ApiError::NotFound(fe.to_string()),
            Some(fe) if fe.is_client_error() => ApiError::BadRequest(fe.to_string()),
            Some(fe) if fe.is_conflict() => ApiError::Conflict(fe.to_string()),
            _ => ApiError::Internal(format!("{:#}", err)),
        }
    }
}

/// Order creation refers to steps by id; an unknown one is bad input, not a
/// missing resource.
fn creation_error(err: anyhow::Error) -> ApiError {
    if let Some(fe @ FactoryError::StepNotFound { .. }) = err.downcast_ref::<FactoryError>() {
        return ApiError::BadRequest(fe.to_string());
    }
    err.into()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/process-steps", get(list_steps).post(create_step))
        .route("/api/process-steps/{id}", put(update_step).delete(delete_step))
        .route("/api/orders", get(list_orders).post(create_order))
        .route("/api/orders/{id}", get(get_order))
        .route("/api/orders/{id}/status", patch(update_order_status))
        .route("/api/orders/{id}/init", post(init_order))
        .route("/api/orders/{id}/tick", post(tick_order))
        .route("/api/orders/{id}/simulation", get(view_order))
        .route("/api/orders/{id}/reset", post(reset_order))
        .route("/api/orders/{id}/driver", post(start_driver).delete(stop_driver))
        .route("/api/tick", post(tick_all))
        .route("/api/debug/state", get(debug_state))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_steps(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let steps = state.db.call(|db| db.list_process_steps()).await?;
    Ok(Json(steps))
}

async fn create_step(
    State(state): State<SharedState>,
    Json(step): Json<ProcessStep>,
) -> Result<impl IntoResponse, ApiError> {
    let step = state.db.call(move |db| db.upsert_process_step(&step)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::ProcessStepUpdated { step: step.clone() });
    Ok((StatusCode::CREATED, Json(step)))
}

async fn update_step(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpsertStepRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let step = ProcessStep {
        step_id: id,
        name: req.name,
        station: req.station,
        estimated_seconds: req.estimated_seconds.unwrap_or(0),
        description: req.description.unwrap_or_default(),
    };
    let step = state.db.call(move |db| db.upsert_process_step(&step)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::ProcessStepUpdated { step: step.clone() });
    Ok(Json(step))
}

async fn delete_step(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_process_step(id)).await?;
    match deleted {
        true => {
            broadcast_message(&state.ws_tx, &WsMessage::ProcessStepDeleted { step_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ApiError::NotFound(format!("Process step {} not found", id))),
    }
}

async fn list_orders(
    State(state): State<SharedState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(OrderStatus::from_str(s).map_err(ApiError::BadRequest)?),
        None => None,
    };
    let orders = state.db.call(move |db| db.list_orders(status)).await?;
    Ok(Json(orders))
}

async fn create_order(
    State(state): State<SharedState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new = NewOrder {
        order_id: req.order_id,
        step_chain: req.step_chain.into_ids(),
        amount: req.amount,
        customer: req.customer.unwrap_or_default(),
        note: req.note.unwrap_or_default(),
    };
    let order = state
        .db
        .call(move |db| db.create_order(&new))
        .await
        .map_err(creation_error)?;
    tracing::info!(order_id = %order.order_id, amount = order.amount, "order created");
    broadcast_message(&state.ws_tx, &WsMessage::OrderCreated { order: order.clone() });
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let order = state.db.call(move |db| db.get_order(&lookup)).await?;
    match order {
        Some(order) => Ok(Json(order)),
        None => Err(ApiError::NotFound(format!("Order {} not found", id))),
    }
}

async fn update_order_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = OrderStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let order = state
        .db
        .call(move |db| db.set_order_status(&id, status))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::OrderStatusChanged {
            order_id: order.order_id.clone(),
            status: order.status,
        },
    );
    Ok(Json(order))
}

async fn init_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.simulator.init(&id).await? {
        Some(summary) => Ok(Json(summary)),
        None => Err(ApiError::NotFound(format!("Order {} not found", id))),
    }
}

async fn tick_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.simulator.tick(&id).await?;
    Ok(Json(report))
}

async fn tick_all(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.simulator.tick_all().await?;
    Ok(Json(report))
}

async fn view_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.simulator.view(&id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::NotFound(format!("Order {} not found", id))),
    }
}

async fn reset_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    if state.db.call(move |db| db.get_order(&lookup)).await?.is_none() {
        return Err(ApiError::NotFound(format!("Order {} not found", id)));
    }
    let summary = state.simulator.reset(&id).await?;
    Ok(Json(summary))
}

async fn start_driver(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: StartDriverRequest = if body.is_empty() {
        StartDriverRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid driver request: {}", e)))?
    };
    let interval = req
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(state.default_interval);

    let lookup = id.clone();
    let order = state.db.call(move |db| db.get_order(&lookup)).await?;
    match order {
        None => return Err(ApiError::NotFound(format!("Order {} not found", id))),
        Some(o) if !o.status.is_dispatchable() => {
            return Err(ApiError::BadRequest(format!(
                "Order {} is {}, not active",
                id, o.status
            )));
        }
        Some(_) => {}
    }

    state.driver.start(&id, interval).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "order_id": id,
            "interval_ms": interval.as_millis() as u64,
        })),
    ))
}

async fn stop_driver(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.driver.stop(&id).await {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound(format!("No driver running for order {}", id))),
    }
}

async fn debug_state(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.simulator.debug_state().await?;
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::clock::SystemClock;
    use crate::factory::db::FactoryDb;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let db = FactoryDb::new_in_memory().unwrap();
        db.seed_default_catalog().unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        Arc::new(AppState::new(
            DbHandle::new(db),
            Arc::new(SystemClock),
            ws_tx,
            Duration::from_millis(1000),
        ))
    }

    fn test_app() -> Router {
        api_router().with_state(test_state())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app().oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_seeded_steps() {
        let response = test_app()
            .oneshot(empty_request("GET", "/api/process-steps"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let steps: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(steps.len(), 9);
        assert_eq!(steps[0]["step_id"], 1);
    }

    #[tokio::test]
    async fn test_create_order_accepts_text_chain() {
        let response = test_app()
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"order_id": "fb-1", "step_chain": "1->2->3", "amount": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let order: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(order["order_id"], "fb-1");
        assert_eq!(order["step_chain"], serde_json::json!([1, 2, 3]));
        assert_eq!(order["status"], "active");
    }

    #[tokio::test]
    async fn test_create_order_validation_errors() {
        let app = test_app();
        let bad_amount = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"step_chain": [1], "amount": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(bad_amount.status(), StatusCode::BAD_REQUEST);

        let unknown_step = app
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"step_chain": [1, 99], "amount": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_step.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(unknown_step.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("99"));
    }

    #[tokio::test]
    async fn test_duplicate_order_is_conflict() {
        let app = test_app();
        let req = || {
            json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"order_id": "dup", "step_chain": [1], "amount": 1}),
            )
        };
        assert_eq!(app.clone().oneshot(req()).await.unwrap().status(), StatusCode::CREATED);
        assert_eq!(app.oneshot(req()).await.unwrap().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_get_missing_order_is_404() {
        let response = test_app()
            .oneshot(empty_request("GET", "/api/orders/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_simulation_view_dispatches_first_step() {
        let app = test_app();
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"order_id": "v", "step_chain": [1, 2], "amount": 1}),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(empty_request("GET", "/api/orders/v/simulation"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(view["tick"]["dispatched"].as_array().unwrap().len(), 1);
        assert_eq!(view["steps"][0]["state"], "running");
        assert_eq!(view["steps"][1]["state"], "pending");
    }

    #[tokio::test]
    async fn test_tick_unknown_order_is_not_an_error() {
        let response = test_app()
            .oneshot(empty_request("POST", "/api/orders/ghost/tick"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value = body_json(response.into_body()).await;
        assert!(report["order_status"].is_null());
    }

    #[tokio::test]
    async fn test_status_patch_and_filter() {
        let app = test_app();
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"order_id": "c", "step_chain": [1], "amount": 1}),
            ))
            .await
            .unwrap();

        let bad = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/orders/c/status",
                serde_json::json!({"status": "paused"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/orders/c/status",
                serde_json::json!({"status": "cancelled"}),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let list = app
            .oneshot(empty_request("GET", "/api/orders?status=cancelled"))
            .await
            .unwrap();
        let orders: Vec<serde_json::Value> = body_json(list.into_body()).await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["order_id"], "c");
    }

    #[tokio::test]
    async fn test_reset_and_debug_state() {
        let app = test_app();
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"order_id": "r", "step_chain": [1], "amount": 3}),
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(empty_request("POST", "/api/orders/r/tick"))
            .await
            .unwrap();

        let debug: serde_json::Value = body_json(
            app.clone()
                .oneshot(empty_request("GET", "/api/debug/state"))
                .await
                .unwrap()
                .into_body(),
        )
        .await;
        assert_eq!(debug["running"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(empty_request("POST", "/api/orders/r/reset"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(summary["stations_released"], 1);
        assert_eq!(summary["rows_cleared"], 3);

        let missing = app
            .oneshot(empty_request("POST", "/api/orders/none/reset"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_step_crud() {
        let app = test_app();
        let put = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/process-steps/42",
                serde_json::json!({"name": "Label", "station": "L Labeler", "estimated_seconds": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::OK);
        let step: serde_json::Value = body_json(put.into_body()).await;
        assert_eq!(step["station"], "L Labeler");

        let deleted = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/process-steps/42"))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let again = app
            .oneshot(empty_request("DELETE", "/api/process-steps/42"))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_driver_start_conflict_and_stop() {
        let state = test_state();
        let app = api_router().with_state(state.clone());
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/orders",
                serde_json::json!({"order_id": "d", "step_chain": [1], "amount": 1}),
            ))
            .await
            .unwrap();

        let start = || {
            json_request(
                "POST",
                "/api/orders/d/driver",
                serde_json::json!({"interval_ms": 60000}),
            )
        };
        assert_eq!(app.clone().oneshot(start()).await.unwrap().status(), StatusCode::ACCEPTED);
        assert_eq!(app.clone().oneshot(start()).await.unwrap().status(), StatusCode::CONFLICT);
        assert!(state.driver.is_running("d").await);

        let stop = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/orders/d/driver"))
            .await
            .unwrap();
        assert_eq!(stop.status(), StatusCode::NO_CONTENT);

        let missing = app
            .oneshot(empty_request("POST", "/api/orders/zzz/driver"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
