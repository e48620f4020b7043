//! Operator console: an HTTP+WebSocket control surface exposing the fleet
//! command set (bridge address, gateway/device CRUD, toggles, MAC commands,
//! payload/location changes, on-demand uplink), each returning the
//! `{ code, id, error? }` status shape.
//!
//! Grounded on `axum`'s router/handler style as used in
//! `examples/other_examples/manifests/arx-os-arxos` and
//! `joshuapetersen-Sarah-John-Genesis/zhtp`; commands are forwarded to the
//! Simulator over an `mpsc` channel with a `oneshot` reply, so the console
//! never touches fleet state directly. Only the Simulator task ever
//! mutates a device or gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::StatusCode;
use crate::persistence::{DeviceRecord, GatewayRecord};

/// One operator command, tagged by `cmd` in its JSON wire form.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ConsoleCommand {
    SetBridgeAddress { address: String },
    GetBridgeAddress,
    AddGateway { gateway: GatewayRecord },
    UpdateGateway { gateway: GatewayRecord },
    DeleteGateway { mac: String },
    AddDevice { device: DeviceRecord },
    UpdateDevice { device: DeviceRecord },
    DeleteDevice { dev_eui: String },
    ToggleDevice { dev_eui: String, active: bool },
    ToggleGateway { mac: String, active: bool },
    SendMacCommand { dev_eui: String, cid: u8, payload: Vec<u8> },
    ChangePayload { dev_eui: String, device_type: String, data_type: String, axis: u8 },
    SendUplinkNow { dev_eui: String },
    ChangeLocation { dev_eui: String, lat: f64, lon: f64, alt: f64 },
}

/// The `{ code, id, error? }` response shape. `id` echoes whichever
/// address/DevEUI/MAC the command targeted (empty for commands with no
/// natural subject); `data` carries a command's return
/// value (e.g. the current bridge address for `GetBridgeAddress`).
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleResponse {
    pub code: StatusCode,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ConsoleResponse {
    pub fn ok(id: impl Into<String>) -> Self {
        Self { code: StatusCode::Ok, id: id.into(), error: None, data: None }
    }

    pub fn ok_with_data(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self { code: StatusCode::Ok, id: id.into(), error: None, data: Some(data.into()) }
    }

    pub fn err(code: StatusCode, id: impl Into<String>, error: impl Into<String>) -> Self {
        Self { code, id: id.into(), error: Some(error.into()), data: None }
    }
}

/// A command paired with the channel its issuer expects the reply on.
pub type CommandEnvelope = (ConsoleCommand, oneshot::Sender<ConsoleResponse>);

#[derive(Clone)]
struct ConsoleState {
    commands: mpsc::Sender<CommandEnvelope>,
}

/// Serves the operator console on `addr` until `shutdown` fires.
pub async fn run_console(addr: SocketAddr, commands: mpsc::Sender<CommandEnvelope>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let state = ConsoleState { commands };
    let app = Router::new()
        .route("/command", post(handle_command))
        .route("/ws", get(handle_ws_upgrade))
        .with_state(Arc::new(state));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("operator console failed to bind {addr}: {e}");
            return;
        }
    };
    info!(%addr, "operator console listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    });
    if let Err(e) = serve.await {
        warn!("operator console server error: {e}");
    }
}

async fn handle_command(State(state): State<Arc<ConsoleState>>, Json(cmd): Json<ConsoleCommand>) -> impl IntoResponse {
    Json(dispatch(&state.commands, cmd).await)
}

async fn dispatch(commands: &mpsc::Sender<CommandEnvelope>, cmd: ConsoleCommand) -> ConsoleResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    if commands.send((cmd, reply_tx)).await.is_err() {
        return ConsoleResponse::err(StatusCode::NoBridge, "", "simulator control loop is not running");
    }
    match reply_rx.await {
        Ok(response) => response,
        Err(_) => ConsoleResponse::err(StatusCode::NoBridge, "", "simulator dropped the command without replying"),
    }
}

async fn handle_ws_upgrade(State(state): State<Arc<ConsoleState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<ConsoleState>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else { continue };
        let response = match serde_json::from_str::<ConsoleCommand>(&text) {
            Ok(cmd) => dispatch(&state.commands, cmd).await,
            Err(e) => ConsoleResponse::err(StatusCode::ErrorValidation, "", format!("malformed command: {e}")),
        };
        let Ok(encoded) = serde_json::to_string(&response) else { continue };
        if socket.send(WsMessage::Text(encoded)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_command_parses_tagged_json() {
        let json = r#"{"cmd":"toggle_device","dev_eui":"0102030405060708","active":false}"#;
        let cmd: ConsoleCommand = serde_json::from_str(json).unwrap();
        match cmd {
            ConsoleCommand::ToggleDevice { dev_eui, active } => {
                assert_eq!(dev_eui, "0102030405060708");
                assert!(!active);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_serializes_without_null_fields() {
        let response = ConsoleResponse::ok("0102030405060708");
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("\"data\""));
    }

    #[tokio::test]
    async fn dispatch_reports_no_bridge_when_simulator_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let response = dispatch(&tx, ConsoleCommand::GetBridgeAddress).await;
        assert_eq!(response.code, StatusCode::NoBridge);
    }
}
