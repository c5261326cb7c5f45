use super::TransportState;
use crate::models::{AgentRecord, AgentTaskResponse, CompletionDetails, ResponseStatus, TransportKind};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Messages on the agent WebSocket; the same schema as the HTTP surface,
/// discriminated by `type`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        agent_id: String,
        capabilities: Vec<String>,
        max_concurrent_tasks: Option<usize>,
        #[serde(default)]
        force: bool,
    },
    #[serde(rename_all = "camelCase")]
    Registered {
        agent_id: String,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        agent_id: String,
        task_id: String,
        status: ResponseStatus,
        response: String,
        completion_details: Option<CompletionDetails>,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { agent_id: String },
    #[serde(rename_all = "camelCase")]
    Ack { task_id: String },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

pub fn build_router(state: TransportState) -> Router {
    let path = state.config.transport.websocket.path.clone();
    Router::new().route(&path, get(upgrade)).with_state(state)
}

async fn upgrade(State(state): State<TransportState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Registration handshake first, then a bidirectional task/response loop.
async fn handle_socket(state: TransportState, mut socket: WebSocket) {
    // First frame must register the agent.
    let agent_id = match read_registration(&state, &mut socket).await {
        Some(agent_id) => agent_id,
        None => return,
    };

    let mut outbound = state.delivery.register_ws(&agent_id);
    info!(agent_id, "websocket agent attached");

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_incoming(&state, &agent_id, text.as_str(), &mut socket).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(agent_id, "websocket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.delivery.unregister_ws(&agent_id);
    info!(agent_id, "websocket agent detached");
}

async fn read_registration(state: &TransportState, socket: &mut WebSocket) -> Option<String> {
    let first = loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => break text,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                warn!("websocket handshake failed: {e}");
                return None;
            }
        }
    };

    let message: WsMessage = match serde_json::from_str(first.as_str()) {
        Ok(message) => message,
        Err(e) => {
            send_error(socket, &format!("malformed registration: {e}")).await;
            return None;
        }
    };

    let WsMessage::Register {
        agent_id,
        capabilities,
        max_concurrent_tasks,
        force,
    } = message
    else {
        send_error(socket, "first message must register the agent").await;
        return None;
    };

    let session = match state.auth.authenticate(&agent_id, "agent") {
        Ok(session) => session,
        Err(e) => {
            send_error(socket, &e.to_string()).await;
            return None;
        }
    };

    let mut agent = AgentRecord::new(&agent_id, capabilities, TransportKind::Websocket);
    agent.session_id = Some(session.session_id.clone());
    if let Some(max) = max_concurrent_tasks {
        agent.config.max_concurrent_tasks = max.clamp(1, 32);
    }
    if let Err(e) = state.registry.register(agent, force) {
        send_error(socket, &e.to_string()).await;
        return None;
    }

    let ack = WsMessage::Registered {
        agent_id: agent_id.clone(),
        session_id: session.session_id,
    };
    if let Ok(text) = serde_json::to_string(&ack) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    Some(agent_id)
}

async fn handle_incoming(
    state: &TransportState,
    connection_agent: &str,
    text: &str,
    socket: &mut WebSocket,
) {
    let message: WsMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            send_error(socket, &format!("malformed frame: {e}")).await;
            return;
        }
    };

    match message {
        WsMessage::Response {
            agent_id,
            task_id,
            status,
            response,
            completion_details,
        } => {
            if agent_id != connection_agent {
                send_error(socket, "agent id does not match this connection").await;
                return;
            }
            let result = state
                .processor
                .process(AgentTaskResponse {
                    agent_id,
                    task_id: task_id.clone(),
                    status,
                    response,
                    completion_details,
                    received_at: Utc::now(),
                })
                .await;
            match result {
                Ok(_) => {
                    let ack = WsMessage::Ack { task_id };
                    if let Ok(text) = serde_json::to_string(&ack) {
                        let _ = socket.send(Message::Text(text.into())).await;
                    }
                }
                Err(e) => send_error(socket, &e.to_string()).await,
            }
        }
        WsMessage::Heartbeat { agent_id } => {
            if agent_id == connection_agent {
                let _ = state.registry.update_heartbeat(&agent_id);
            }
        }
        WsMessage::Ack { task_id } => {
            debug!(agent_id = connection_agent, task_id, "task acknowledged");
        }
        other => {
            debug!(agent_id = connection_agent, "ignoring frame: {other:?}");
        }
    }
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let frame = WsMessage::Error {
        message: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}
