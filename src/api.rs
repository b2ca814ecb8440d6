//! HTTP frontend: operator dashboard queries plus the device-notify/post
//! variants that mirror the UDP protocol's event and data frames.
//!
//! State is a single `Arc<AppState>` handed to every handler through
//! axum's `State` extractor, holding the channel table, the UDP engine
//! handle (for originating commands), the monitor, and the resolved
//! config.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use telehub_service::clock::Clock;
use telehub_service::payload::apply_payload;
use telehub_service::ChannelTable;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::monitor::{Monitor, Signal};
use crate::udp::{SendCommandError, UdpEngine};

pub struct AppState {
    pub table: Arc<ChannelTable>,
    pub engine: Arc<UdpEngine>,
    pub monitor: Arc<Monitor>,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/test", get(test))
        .route("/api/notify", get(notify).post(notify))
        .route("/api/post", get(post_gps).post(post_pids))
        .route("/api/push", get(push))
        .route("/api/channels", get(channels))
        .route("/api/get", get(get_channel))
        .route("/api/command", get(command).post(command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the HTTP API on `config.net.http_bind` until `shutdown` resolves.
pub async fn serve(state: Arc<AppState>, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let bind = state.config.net.http_bind;
    let app = router(state);
    log::info!("http frontend listening on {bind}");
    let listener = TcpListener::bind(bind).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn test(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.monitor.record(Signal::HttpRequest);
    let now = state.clock.now_ms();
    let (date, time) = format_date_time(now);
    Json(json!({ "date": date, "time": time, "tick": now }))
}

/// Render a millisecond epoch tick as `YYMMDD`/`HHMMSS`, UTC.
fn format_date_time(epoch_ms: u64) -> (String, String) {
    let dt: DateTime<Utc> = DateTime::from_timestamp_millis(epoch_ms as i64).unwrap_or_default();
    (dt.format("%y%m%d").to_string(), dt.format("%H%M%S").to_string())
}

#[derive(Deserialize)]
struct NotifyParams {
    id: String,
    #[serde(rename = "EV")]
    ev: u32,
    #[serde(rename = "VIN")]
    vin: Option<String>,
    #[serde(rename = "DF")]
    dev_flags: Option<String>,
    #[serde(rename = "SSI")]
    ssi: Option<i64>,
}

async fn notify(State(state): State<Arc<AppState>>, Query(q): Query<NotifyParams>) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);
    let now = state.clock.now_ms();

    match q.ev {
        1 => {
            let channel_id = match state.table.admit(&q.id, now) {
                Ok(id) => id,
                Err(e) => {
                    return (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": e.to_string()})))
                }
            };
            state.table.login(&channel_id, now, q.vin.as_deref(), q.dev_flags.as_deref(), q.ssi, None, None);
            (StatusCode::OK, Json(json!({"id": channel_id, "result": "done"})))
        }
        2 => {
            let Some(channel_id) = state.table.resolve_id(&q.id) else {
                return (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"})));
            };
            state.table.logout(&channel_id, now);
            (StatusCode::OK, Json(json!({"result": "done"})))
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({"result": "failed", "error": "unsupported event"}))),
    }
}

#[derive(Deserialize)]
struct PostGpsParams {
    id: String,
    lat: Option<f64>,
    lon: Option<f64>,
    timestamp: Option<u64>,
    altitude: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
}

async fn post_gps(State(state): State<Arc<AppState>>, Query(q): Query<PostGpsParams>) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);
    let Some(channel_id) = state.table.resolve_id(&q.id) else {
        return (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"})));
    };

    let now = state.clock.now_ms();
    let ts = q.timestamp.unwrap_or(now);
    let mut pairs = vec![(0u32, ts.to_string())];
    if let Some(lat) = q.lat {
        pairs.push((0x200, lat.to_string()));
    }
    if let Some(lon) = q.lon {
        pairs.push((0x201, lon.to_string()));
    }
    if let Some(alt) = q.altitude {
        pairs.push((0x202, alt.to_string()));
    }
    if let Some(speed) = q.speed {
        pairs.push((0x203, speed.to_string()));
    }
    if let Some(heading) = q.heading {
        pairs.push((0x204, heading.to_string()));
    }

    state.table.with_channel_mut(&channel_id, |c| apply_payload(c, &pairs, now, 0));
    (StatusCode::OK, Json(json!({"result": "OK"})))
}

#[derive(Deserialize)]
struct PostIdParam {
    id: String,
}

async fn post_pids(State(state): State<Arc<AppState>>, Query(q): Query<PostIdParam>, body: String) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);
    let Some(channel_id) = state.table.resolve_id(&q.id) else {
        return (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"})));
    };

    let pairs = parse_colon_pairs(&body);
    let now = state.clock.now_ms();
    let payload_len = body.len() as u64;
    let stored = state
        .table
        .with_channel_mut(&channel_id, |c| apply_payload(c, &pairs, now, payload_len))
        .unwrap_or(0);

    (StatusCode::OK, Json(json!({"result": format!("OK {stored}")})))
}

fn parse_colon_pairs(body: &str) -> Vec<(u32, String)> {
    body.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            let colon = pair.find(':')?;
            let pid = u32::from_str_radix(&pair[..colon], 16).ok()?;
            Some((pid, pair[colon + 1..].to_string()))
        })
        .collect()
}

async fn push(State(state): State<Arc<AppState>>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);

    let Some(id) = q.get("id") else {
        return (StatusCode::BAD_REQUEST, Json(json!({"result": "failed", "error": "missing id"})));
    };
    let Some(channel_id) = state.table.resolve_id(id) else {
        return (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"})));
    };

    let ts: u64 = q.get("ts").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut pairs = vec![(0u32, ts.to_string())];
    for (key, value) in &q {
        if key == "id" || key == "ts" {
            continue;
        }
        if let Ok(pid) = u32::from_str_radix(key, 16) {
            pairs.push((pid, value.clone()));
        }
    }

    let now = state.clock.now_ms();
    let stored = state
        .table
        .with_channel_mut(&channel_id, |c| apply_payload(c, &pairs, now, 0))
        .unwrap_or(0);

    (StatusCode::OK, Json(json!({"result": stored})))
}

#[derive(Deserialize)]
struct ChannelsParams {
    cmd: Option<String>,
    id: Option<String>,
    devid: Option<String>,
    extend: Option<bool>,
    data: Option<bool>,
}

async fn channels(State(state): State<Arc<AppState>>, Query(q): Query<ChannelsParams>) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);

    if q.cmd.as_deref() == Some("clear") {
        if let Some(id) = &q.id {
            let removed = state.table.evict(id);
            return (StatusCode::OK, Json(json!({"result": removed}))).into_response();
        }
        return (StatusCode::BAD_REQUEST, Json(json!({"result": "failed", "error": "missing id"}))).into_response();
    }

    let now = state.clock.now_ms();

    if let Some(devid) = &q.devid {
        return match state.table.find_by_device_id(devid) {
            Some(snapshot) => {
                (StatusCode::OK, Json(listing_entry(&snapshot, now, q.extend.unwrap_or(false), q.data.unwrap_or(false)))).into_response()
            }
            None => (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"}))).into_response(),
        };
    }

    let entries: Vec<Value> = state
        .table
        .snapshot()
        .iter()
        .map(|s| listing_entry(s, now, q.extend.unwrap_or(false), q.data.unwrap_or(false)))
        .collect();

    (StatusCode::OK, Json(json!({ "channels": entries }))).into_response()
}

fn dev_flags_as_number(snapshot: &telehub_service::ChannelSnapshot) -> i64 {
    snapshot.dev_flags.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn listing_entry(snapshot: &telehub_service::ChannelSnapshot, now: u64, extend: bool, data: bool) -> Value {
    let age_data = if snapshot.server_data_tick > 0 { now.saturating_sub(snapshot.server_data_tick) } else { 0 };
    let age_ping = if snapshot.server_ping_tick > 0 { now.saturating_sub(snapshot.server_ping_tick) } else { 0 };

    let mut entry = json!({
        "id": snapshot.id,
        "devid": snapshot.devid,
        "recv": snapshot.data_received,
        "rate": snapshot.sample_rate,
        "tick": snapshot.server_data_tick,
        "devtick": snapshot.device_tick,
        "elapsed": snapshot.elapsed,
        "age": { "data": age_data, "ping": age_ping },
        "rssi": snapshot.rssi,
        "flags": dev_flags_as_number(snapshot),
        "parked": if snapshot.flags & telehub_service::channel::RUNNING == 0 { 1 } else { 0 },
    });

    if extend {
        entry["vin"] = json!(snapshot.vin);
        entry["ip"] = json!(snapshot.ip_addr);
    }

    if data {
        entry["data"] = json!(snapshot
            .data
            .iter()
            .map(|(pid, value, ts)| json!([pid, value, ts]))
            .collect::<Vec<_>>());
    }

    entry
}

#[derive(Deserialize)]
struct GetParams {
    id: String,
}

async fn get_channel(State(state): State<Arc<AppState>>, Query(q): Query<GetParams>) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);

    match state.table.find_by_device_id(&q.id) {
        Some(snapshot) => {
            let now = state.clock.now_ms();
            let age_data = if snapshot.server_data_tick > 0 { now.saturating_sub(snapshot.server_data_tick) } else { 0 };
            let age_ping = if snapshot.server_ping_tick > 0 { now.saturating_sub(snapshot.server_ping_tick) } else { 0 };

            let data: Vec<Value> = snapshot
                .data
                .iter()
                .map(|(pid, value, ts)| json!([pid, value, snapshot.server_data_tick.saturating_sub(*ts)]))
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "stats": {
                        "tick": snapshot.server_data_tick,
                        "devtick": snapshot.device_tick,
                        "elapsed": snapshot.elapsed,
                        "age": { "data": age_data, "ping": age_ping },
                        "rssi": snapshot.rssi,
                        "flags": dev_flags_as_number(&snapshot),
                        "parked": if snapshot.flags & telehub_service::channel::RUNNING == 0 { 1 } else { 0 },
                    },
                    "data": data,
                })),
            )
        }
        None => (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"}))),
    }
}

#[derive(Deserialize)]
struct CommandParams {
    id: String,
    cmd: String,
}

async fn command(State(state): State<Arc<AppState>>, Query(q): Query<CommandParams>) -> impl IntoResponse {
    state.monitor.record(Signal::HttpRequest);

    let timeout = Duration::from_secs(state.config.session.command_timeout_secs);
    match state.engine.send_command(&q.id, &q.cmd, timeout).await {
        Ok(token) => (StatusCode::OK, Json(json!({"result": "pending", "token": token}))),
        Err(SendCommandError::UnknownChannel) => {
            (StatusCode::FORBIDDEN, Json(json!({"result": "failed", "error": "unknown device"})))
        }
        Err(SendCommandError::NotConnected) => {
            (StatusCode::OK, Json(json!({"result": "failed", "error": "Device not connected via UDP"})))
        }
        Err(SendCommandError::Unsent(e)) => {
            (StatusCode::OK, Json(json!({"result": "failed", "error": format!("Command unsent: {e}")})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_epoch() {
        // 2024-01-02 03:04:05 UTC
        let (date, time) = format_date_time(1_704_164_645_000);
        assert_eq!(date, "240102");
        assert_eq!(time, "030405");
    }

    #[test]
    fn colon_pairs_skip_malformed() {
        let pairs = parse_colon_pairs("104:1,garbage,zz:2");
        assert_eq!(pairs, vec![(104, "1".to_string())]);
    }
}
