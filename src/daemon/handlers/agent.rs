//! Reverse agent registration over WebSocket

use crate::agent::AgentConn;
use crate::api::short_id;
use crate::daemon::error::{ApiError, ApiResult};
use crate::daemon::extract::Params;
use crate::daemon::AppState;
use crate::error::SockerlessError;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

/// `GET /agent/connect?id=&token=`; the token must match the container's.
///
/// Credentials are checked before the upgrade headers.
pub async fn connect(
    State(state): State<AppState>,
    params: Params,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let id = params.get("id");
    let container = state
        .backend
        .resolve_container(id)
        .map_err(|_| ApiError(SockerlessError::Unauthorized("unknown agent".to_string())))?;
    if container.agent_token != params.get("token") {
        return Err(ApiError(SockerlessError::Unauthorized(
            "invalid agent token".to_string(),
        )));
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let backend = state.backend.clone();
    let container_id = container.id;
    Ok(ws.on_upgrade(move |socket| async move {
        info!("Agent connected for {}", short_id(&container_id));
        let (conn, outbound) = AgentConn::channel();
        backend.agents.register(&container_id, conn.clone());
        serve_agent(socket, conn, outbound).await;
        backend.agents.remove(&container_id);
        info!("Agent disconnected for {}", short_id(&container_id));
    }))
}

async fn serve_agent(
    socket: WebSocket,
    conn: std::sync::Arc<AgentConn>,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<crate::agent::Message>,
) {
    let (mut sink, mut stream) = socket.split();
    let done = conn.done();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = done.cancelled() => break,
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => conn.dispatch(&text),
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                debug!("Agent socket error: {}", e);
                break;
            }
            Ok(_) => {}
        }
    }
    conn.close();
    let _ = writer.await;
}
