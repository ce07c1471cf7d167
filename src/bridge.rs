//! HTTP bridge: a thin REST adapter over one [`Thermostat`], shaped for
//! home-automation hosts that cannot speak the LAN protocol directly.
//!
//! `GET /health` is open; `GET /status` and `POST /command` require a
//! bearer token.

use crate::dps::{
    DP_FAN, DP_HORIZ_SWING, DP_MODE, DP_POWER, DP_TARGET_TEMP, DP_VERT_SWING, FanSpeed,
    HorizontalSwing, Mode, VerticalSwing,
};
use crate::error::TuyaError;
use crate::thermostat::{StatusView, Thermostat};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct BridgeState {
    pub thermostat: Thermostat,
    pub device_id: String,
    pub device_ip: String,
    pub token: String,
}

/// One `{command, value}` request, already mapped onto its DP write.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    Power(bool),
    TargetTemp(f64),
    Mode(Mode),
    Fan(FanSpeed),
    VertSwing(VerticalSwing),
    HorizSwing(HorizontalSwing),
}

impl BridgeCommand {
    /// Map a command string and JSON value to a typed write. Booleans
    /// tolerate the string spellings hosts tend to send.
    pub fn parse(command: &str, value: &Value) -> Result<Self, String> {
        match command {
            "power" => parse_bool(value).map(BridgeCommand::Power),
            "target_temp" => value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| format!("target_temp needs a number, got {value}"))
                .map(BridgeCommand::TargetTemp),
            "mode" => parse_enum::<Mode>(value, "mode").map(BridgeCommand::Mode),
            "fan" => parse_enum::<FanSpeed>(value, "fan").map(BridgeCommand::Fan),
            "vert_swing" => {
                parse_enum::<VerticalSwing>(value, "vert_swing").map(BridgeCommand::VertSwing)
            }
            "horiz_swing" => {
                parse_enum::<HorizontalSwing>(value, "horiz_swing").map(BridgeCommand::HorizSwing)
            }
            other => Err(format!("unknown command: {other}")),
        }
    }

    /// The DP id this command writes.
    pub fn dp(&self) -> u32 {
        match self {
            BridgeCommand::Power(_) => DP_POWER,
            BridgeCommand::TargetTemp(_) => DP_TARGET_TEMP,
            BridgeCommand::Mode(_) => DP_MODE,
            BridgeCommand::Fan(_) => DP_FAN,
            BridgeCommand::VertSwing(_) => DP_VERT_SWING,
            BridgeCommand::HorizSwing(_) => DP_HORIZ_SWING,
        }
    }
}

fn parse_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Ok(true),
            "false" | "0" | "off" | "no" => Ok(false),
            _ => Err(format!("cannot read {s:?} as a boolean")),
        },
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        _ => Err(format!("cannot read {value} as a boolean")),
    }
}

fn parse_enum<T: std::str::FromStr>(value: &Value, what: &str) -> Result<T, String> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("invalid value {value} for {what}"))
}

#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub value: Value,
}

#[derive(Serialize)]
struct CommandResponse {
    success: bool,
    command: String,
    value: Value,
    dp: u32,
    status: StatusView,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    device_id: String,
    device_ip: String,
    connected: bool,
}

#[derive(Deserialize, Default)]
pub struct StatusQuery {
    #[serde(default)]
    refresh: bool,
}

fn error_response(err: &TuyaError) -> Response {
    let code = match err {
        TuyaError::BadValue(_) | TuyaError::Config(_) => StatusCode::BAD_REQUEST,
        TuyaError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        TuyaError::NotConnected | TuyaError::ConnectionFailed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Bearer-token check on everything except `/health`.
async fn auth_middleware(
    State(state): State<BridgeState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match header {
        Some(h) if h.starts_with("Bearer ") => {
            if &h[7..] == state.token {
                Ok(next.run(request).await)
            } else {
                warn!("Rejected request with an invalid bearer token");
                Err(StatusCode::FORBIDDEN)
            }
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn health(State(state): State<BridgeState>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        device_id: state.device_id.clone(),
        device_ip: state.device_ip.clone(),
        connected: state.thermostat.is_connected(),
    })
}

async fn status(
    State(state): State<BridgeState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if query.refresh {
        match state.thermostat.refresh().await {
            Ok(view) => Json(view).into_response(),
            Err(e) => error_response(&e),
        }
    } else {
        Json(state.thermostat.status()).into_response()
    }
}

async fn command(
    State(state): State<BridgeState>,
    Json(req): Json<CommandRequest>,
) -> Response {
    let parsed = match BridgeCommand::parse(&req.command.to_ascii_lowercase(), &req.value) {
        Ok(p) => p,
        Err(msg) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg })).into_response();
        }
    };
    info!("Bridge command: {} = {}", req.command, req.value);

    let result = match &parsed {
        BridgeCommand::Power(true) => state.thermostat.on().await,
        BridgeCommand::Power(false) => state.thermostat.off().await,
        BridgeCommand::TargetTemp(f) => state.thermostat.set_target_temp(*f).await,
        BridgeCommand::Mode(m) => state.thermostat.set_mode(*m).await,
        BridgeCommand::Fan(f) => state.thermostat.set_fan(*f).await,
        BridgeCommand::VertSwing(v) => state.thermostat.set_vertical_swing(*v).await,
        BridgeCommand::HorizSwing(h) => state.thermostat.set_horizontal_swing(*h).await,
    };
    if let Err(e) = result {
        return error_response(&e);
    }

    // The write ack already folded the echoed DPs into the snapshot; a
    // forced query picks up anything the firmware adjusted on its own.
    let status = match state.thermostat.refresh().await {
        Ok(view) => view,
        Err(_) => state.thermostat.status(),
    };
    Json(CommandResponse {
        success: true,
        command: req.command,
        value: req.value,
        dp: parsed.dp(),
        status,
    })
    .into_response()
}

/// Build the bridge router.
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/command", post(command))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
