//! HTTP routes and handlers.
//!
//! Every body is a single codec value; every response is result-wrapped.
//! Engine and registry calls may block (providers shell out to docker)
//! and run on the blocking pool.

use axum::extract::{FromRequest, Path, Request, State};
use axum::http::header;
use axum::middleware as axum_mw;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tower_http::trace::TraceLayer;

use super::{AppState, STOP_DELAY, ServerError};
use super::{access, expiry};
use crate::ipc::codec::{self, Value};
use crate::ipc::protocol::{self, CONTENT_TYPE, ListRequest, ResolveRequest};
use crate::resolver::{Properties, PropertyEntries};
use crate::scope::Scope;

/// Build the router with access control (outermost) and idle tracking.
pub fn build_router(state: AppState) -> Router {
    let access = state.access.clone();
    let expiry = state.expiry.clone();
    Router::new()
        .route(protocol::PATH_LIST, get(list).post(list_with))
        .route(protocol::PATH_REQUIRED_ENTRIES, get(required_entries))
        .route("/requirements/expr/:expression", get(required_properties))
        .route(protocol::PATH_RESOLVE, post(resolve))
        .route(protocol::PATH_CLOSE_ALL, get(close_all))
        .route("/close/:scope", get(close_scope))
        .route(protocol::PATH_RESOURCES, get(resources))
        .route("/testcontainers/:scope", get(resources_in))
        .route(protocol::PATH_STOP, post(stop))
        .with_state(state)
        .layer(axum_mw::from_fn_with_state(expiry, expiry::track_access))
        .layer(axum_mw::from_fn_with_state(access, access::enforce_access))
        .layer(TraceLayer::new_for_http())
}

/// Request body decoded with the wire codec. An empty body is `Null`.
pub struct WireBody(pub Value);

#[axum::async_trait]
impl<S: Send + Sync> FromRequest<S> for WireBody {
    type Rejection = ServerError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(request, state)
            .await
            .map_err(|e| ServerError::Body(e.body_text()))?;
        if bytes.is_empty() {
            return Ok(Self(Value::Null));
        }
        Ok(Self(codec::from_slice(&bytes)?))
    }
}

/// Response body encoded with the wire codec.
pub struct Wire(pub Value);

impl IntoResponse for Wire {
    fn into_response(self) -> Response {
        match codec::result_to_bytes(&self.0) {
            Ok(bytes) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], bytes).into_response(),
            Err(e) => ServerError::from(e).into_response(),
        }
    }
}

async fn list(State(state): State<AppState>) -> Wire {
    let names = state
        .engine
        .resolvable_properties(&PropertyEntries::new(), &Properties::new());
    Wire(Value::from(names))
}

async fn list_with(
    State(state): State<AppState>,
    WireBody(body): WireBody,
) -> Result<Wire, ServerError> {
    let request = match body {
        Value::Null => ListRequest::default(),
        body => ListRequest::from_value(&body)?,
    };
    let names = state
        .engine
        .resolvable_properties(&request.property_entries, &request.config);
    Ok(Wire(Value::from(names)))
}

async fn required_entries(State(state): State<AppState>) -> Wire {
    Wire(Value::from(state.engine.required_property_entries()))
}

async fn required_properties(
    State(state): State<AppState>,
    Path(expression): Path<String>,
) -> Wire {
    Wire(Value::from(state.engine.required_properties(&expression)))
}

async fn resolve(
    State(state): State<AppState>,
    WireBody(body): WireBody,
) -> Result<Wire, ServerError> {
    let request = ResolveRequest::from_value(&body)?;
    let engine = state.engine.clone();
    let value = tokio::task::spawn_blocking(move || {
        engine.resolve(&request.name, &request.properties, &request.config)
    })
    .await??;
    Ok(Wire(Value::from(value)))
}

async fn close_all(State(state): State<AppState>) -> Result<Wire, ServerError> {
    let registry = state.registry.clone();
    let closed = tokio::task::spawn_blocking(move || registry.close_all()).await?;
    Ok(Wire(Value::Bool(closed)))
}

async fn close_scope(
    State(state): State<AppState>,
    Path(scope): Path<String>,
) -> Result<Wire, ServerError> {
    let registry = state.registry.clone();
    let scope = Scope::parse(&scope);
    let closed = tokio::task::spawn_blocking(move || registry.close_scope(&scope)).await?;
    Ok(Wire(Value::Bool(closed)))
}

async fn resources(State(state): State<AppState>) -> Wire {
    list_resources(&state, &Scope::root())
}

async fn resources_in(State(state): State<AppState>, Path(scope): Path<String>) -> Wire {
    list_resources(&state, &Scope::parse(&scope))
}

fn list_resources(state: &AppState, scope: &Scope) -> Wire {
    let descriptors = state
        .registry
        .list(scope)
        .iter()
        .map(|snapshot| snapshot.descriptor().to_value())
        .collect();
    Wire(Value::List(descriptors))
}

/// Answer, then shut down once the answer had time to leave.
async fn stop(State(state): State<AppState>) -> Wire {
    tracing::info!("stop requested");
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(STOP_DELAY).await;
        shutdown.cancel();
    });
    Wire(Value::Bool(true))
}
