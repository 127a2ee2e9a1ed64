mod models;
mod routes;
mod services;
mod ws;

pub use routes::ProgressSyncApi;

use std::sync::Arc;

use poem::{
    Endpoint, EndpointExt, Route, get,
    middleware::{Cors, Tracing as PoemTracing},
};
use poem_openapi::OpenApiService;

use crate::{auth::TokenValidator, config::SyncConfig, sync::SyncCoordinator};

/// Shared handles for the HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub tokens: Arc<TokenValidator>,
    pub sync: Arc<SyncConfig>,
}

/// The complete application: REST API, docs and the `/ws` upgrade endpoint.
pub fn app(state: AppState, public_url: &str) -> impl Endpoint + use<> {
    let version = env!("CARGO_PKG_VERSION");
    let api = ProgressSyncApi {
        state: state.clone(),
    };
    let api_service =
        OpenApiService::new(api, "Reading Progress Sync API", version).server(public_url);
    let ui = api_service.rapidoc();
    let spec = api_service.spec();
    Route::new()
        .at("/ws", get(ws::sync_socket.data(state)))
        .nest("/", api_service)
        .nest("/ui", ui)
        .nest("/spec", poem::endpoint::make_sync(move |_| spec.clone()))
        .with(Cors::new())
        .with(PoemTracing)
}
