// ABOUTME: WebSocket upgrade endpoint handing the connection to the attach
// pipeline; auth happens post-upgrade so failures close with proper codes

use std::collections::HashMap;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use uuid::Uuid;

use super::AppState;
use crate::terminal::PtyAttachPipeline;

pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    let pipeline = PtyAttachPipeline::new(
        state.store.clone(),
        state.auth.clone(),
        state.reconciler.clone(),
        state.containers.clone(),
    );
    ws.on_upgrade(move |socket| async move {
        pipeline.handle(socket, session_id, token).await;
    })
}
