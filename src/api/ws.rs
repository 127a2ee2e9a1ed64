use chrono::Utc;
use futures::StreamExt;
use poem::{
    IntoResponse, Response, handler,
    http::StatusCode,
    web::{Data, Query, websocket::WebSocket},
};
use serde::Deserialize;

use super::AppState;
use crate::{
    domain::DeviceId,
    hub::{Connection, serve},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketParams {
    token: Option<String>,
    device_id: Option<String>,
}

fn reject(status: StatusCode, message: &str) -> Response {
    Response::builder().status(status).body(message.to_string())
}

/// Upgrades an authenticated device to a live sync connection.
///
/// The token and device id are checked before the upgrade so bad callers get a plain HTTP error.
#[handler]
pub async fn sync_socket(
    Query(params): Query<SocketParams>,
    Data(state): Data<&AppState>,
    ws: poem::Result<WebSocket>,
) -> Response {
    let Some(token) = params.token.as_deref() else {
        return reject(StatusCode::UNAUTHORIZED, "missing token");
    };
    let user_id = match state.tokens.verify(token, Utc::now()) {
        Ok(user_id) => user_id,
        Err(e) => return reject(StatusCode::UNAUTHORIZED, &e.to_string()),
    };
    let device_id = match DeviceId::parse(params.device_id.as_deref().unwrap_or_default()) {
        Ok(device_id) => device_id,
        Err(e) => return reject(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };

    let state = state.clone();
    ws.on_upgrade(move |socket| async move {
        let (connection, outbound) =
            match Connection::open(state.coordinator.hub(), user_id, device_id).await {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::error!(error = %e, "could not register connection");
                    return;
                }
            };
        let (sink, stream) = socket.split();
        serve(
            connection,
            outbound,
            stream,
            sink,
            &state.coordinator,
            &state.sync,
        )
        .await;
    })
    .into_response()
}
