// ABOUTME: WebSocket <-> container pty bridge: authenticate, reconcile,
// attach to the persistent mux session, then shuttle bytes and control

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{ClientMessage, ServerMessage};
use super::pty_mux;
use crate::auth::Auth;
use crate::docker::{ContainerManager, ExecHandle, FrameParser, StreamKind};
use crate::models::{Session, SessionStatus, SessionType};
use crate::session::SessionReconciler;
use crate::store::Store;

/// Close codes used by the attach pipeline.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PtyAttachPipeline {
    store: Store,
    auth: Auth,
    reconciler: Arc<SessionReconciler>,
    containers: Arc<ContainerManager>,
}

impl PtyAttachPipeline {
    pub fn new(
        store: Store,
        auth: Auth,
        reconciler: Arc<SessionReconciler>,
        containers: Arc<ContainerManager>,
    ) -> Self {
        Self {
            store,
            auth,
            reconciler,
            containers,
        }
    }

    /// Drive one websocket connection for a session from authentication to
    /// close. Multiple connections for the same session may run at once;
    /// each gets its own exec against the shared mux session.
    pub async fn handle(&self, mut socket: WebSocket, session_id: Uuid, token: Option<String>) {
        let principal = match token.as_deref().map(|t| self.auth.authenticate(t)) {
            Some(Ok(principal)) => principal,
            _ => {
                close_socket(&mut socket, CLOSE_POLICY_VIOLATION, "authentication").await;
                return;
            }
        };

        let (session, env) = match self.store.get_session_with_environment(session_id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                close_socket(&mut socket, CLOSE_INTERNAL_ERROR, "session not found").await;
                return;
            }
            Err(e) => {
                close_socket(&mut socket, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                return;
            }
        };
        if env.user_id != principal.user_id {
            close_socket(&mut socket, CLOSE_POLICY_VIOLATION, "access_denied").await;
            return;
        }

        let container_id = match self.reconciler.ensure_session_container(session_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!("terminal setup for session {session_id} failed: {e}");
                close_socket(&mut socket, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                return;
            }
        };

        // Reconnects attach to the surviving mux session; only a fresh
        // container (or a reaped session) creates one.
        let existing = matches!(
            self.containers
                .exec_capture(&container_id, pty_mux::has_session_argv(&session.pty_mux_name))
                .await,
            Ok(ref out) if out.success()
        );
        debug!(
            "mux session {} {}",
            session.pty_mux_name,
            if existing { "exists, attaching" } else { "missing, creating" }
        );

        let argv = pty_mux::attach_or_create_argv(&session.pty_mux_name, &session.working_directory);
        let exec = match self
            .containers
            .exec_interactive(&container_id, argv, Some(session.working_directory.clone()))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                close_socket(&mut socket, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                return;
            }
        };

        if let Err(e) = self.store.touch_session_activity(session_id).await {
            warn!("recording attach activity for {session_id} failed: {e}");
        }

        info!(
            "terminal attached: session {session_id}, mux {}, container {container_id}",
            session.pty_mux_name
        );
        self.bridge(socket, exec, &session).await;
    }

    async fn bridge(&self, socket: WebSocket, mut exec: ExecHandle, session: &Session) {
        let (mut tx, mut rx) = socket.split();

        if session.session_type == SessionType::Agent {
            let banner = self.agent_banner(session).await;
            let _ = send_message(&mut tx, &ServerMessage::output(banner)).await;
        }
        let _ = send_message(&mut tx, &ServerMessage::RequestResize).await;

        let mut parser = FrameParser::new();
        let mut saw_output = false;
        let mut fatal = false;
        let mut client_closed = false;
        let attach_deadline = tokio::time::sleep(ATTACH_TIMEOUT);
        tokio::pin!(attach_deadline);

        loop {
            tokio::select! {
                chunk = exec.output.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.feed(&bytes) {
                            saw_output = true;
                            if frame.kind == StreamKind::Stderr
                                && String::from_utf8_lossy(&frame.data).contains("ERROR:")
                            {
                                fatal = true;
                                close_sink(
                                    &mut tx,
                                    CLOSE_INTERNAL_ERROR,
                                    "fatal error in terminal output",
                                )
                                .await;
                                break;
                            }
                            let data = String::from_utf8_lossy(&frame.data).to_string();
                            if send_message(&mut tx, &ServerMessage::output(data)).await.is_err() {
                                client_closed = true;
                                break;
                            }
                        }
                        if client_closed || fatal {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = send_message(&mut tx, &ServerMessage::error(e.to_string())).await;
                        close_sink(&mut tx, CLOSE_INTERNAL_ERROR, "terminal stream failed").await;
                        fatal = true;
                        break;
                    }
                    None => {
                        // The exec ended; a non-zero exit marks the session dead.
                        match self.containers.runtime().exec_status(&exec.exec_id).await {
                            Ok(status) if status.exit_code.unwrap_or(0) != 0 => fatal = true,
                            Err(e) => debug!("exec status after end unavailable: {e}"),
                            _ => {}
                        }
                        close_sink(&mut tx, CLOSE_NORMAL, "terminal ended").await;
                        break;
                    }
                },

                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Input { data }) => {
                                if ContainerManager::write_input(&mut exec, data.as_bytes())
                                    .await
                                    .is_err()
                                {
                                    fatal = true;
                                    close_sink(&mut tx, CLOSE_INTERNAL_ERROR, "input failed").await;
                                    break;
                                }
                                if let Err(e) =
                                    self.store.touch_session_activity(session.id).await
                                {
                                    debug!("activity update failed: {e}");
                                }
                            }
                            Ok(ClientMessage::Resize { cols, rows }) => {
                                if let Err(e) = self
                                    .containers
                                    .runtime()
                                    .resize_exec(&exec.exec_id, cols, rows)
                                    .await
                                {
                                    debug!("resize failed: {e}");
                                }
                            }
                            Err(e) => debug!("ignoring malformed client message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        client_closed = true;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("websocket receive error: {e}");
                        client_closed = true;
                        break;
                    }
                },

                () = &mut attach_deadline, if !saw_output => {
                    let _ = send_message(
                        &mut tx,
                        &ServerMessage::error("terminal did not respond"),
                    )
                    .await;
                    close_sink(&mut tx, CLOSE_INTERNAL_ERROR, "terminal did not respond").await;
                    fatal = true;
                    break;
                },
            }
        }

        // The exec (this client's attach) dies here with the handle; the
        // mux session inside the container lives on as the persistence.
        if fatal {
            if let Err(e) = self.store.mark_session_dead(session.id).await {
                warn!("marking session {} dead failed: {e}", session.id);
            }
        } else {
            if client_closed {
                debug!("client closed terminal for session {}", session.id);
            }
            if let Err(e) = self
                .store
                .set_session_status(session.id, SessionStatus::Inactive)
                .await
            {
                warn!("marking session {} inactive failed: {e}", session.id);
            }
        }
    }

    /// One informational line for agent-type sessions before bytes flow.
    /// Agent process supervision is deliberately not wired up.
    async fn agent_banner(&self, session: &Session) -> String {
        let detail = match session.agent_id {
            Some(agent_id) => match self.store.get_agent(agent_id).await {
                Ok(Some(agent)) => format!("{} ({})", agent.name, agent.agent_type),
                _ => "unknown agent".to_string(),
            },
            None => "unconfigured agent".to_string(),
        };
        format!("[agent session: {detail}]\r\n")
    }
}

async fn send_message(
    tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    tx.send(Message::Text(msg.to_json().into())).await
}

async fn close_sink(tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
