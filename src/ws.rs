//! WebSocket fan-out route (spec §4.D, §6). First-frame auth, then a
//! predicate-built subscription against the market-data [`Hub`], racing
//! hub events / disconnect / heartbeat / client frames in a
//! `tokio::select!` loop — grounded on the teacher's
//! `websocket_handler`/`handle_socket` in `main.rs`, generalized from a
//! single broadcast channel to the predicate-subscribed generic hub.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use tracing::warn;

use crate::auth::JwtVerifier;
use crate::hub::{match_all, Hub};
use crate::model::{DisconnectFrame, DisconnectReason, InstrumentKey, Timeframe, WsEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<Hub<WsEvent>>,
    pub verifier: Arc<JwtVerifier>,
}

#[derive(Debug, Deserialize)]
struct AuthFrame {
    token: String,
    #[serde(default)]
    instrument_key: Option<InstrumentKey>,
    #[serde(default)]
    timeframe: Option<Timeframe>,
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    let auth = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await;
    let Ok(Some(Ok(Message::Text(text)))) = auth else {
        let _ = socket.send(close_frame(DisconnectReason::AuthExpired)).await;
        return;
    };
    let Ok(frame) = serde_json::from_str::<AuthFrame>(&text) else {
        let _ = socket.send(close_frame(DisconnectReason::AuthExpired)).await;
        return;
    };
    if state.verifier.verify(&frame.token).is_err() {
        let _ = socket.send(close_frame(DisconnectReason::AuthExpired)).await;
        return;
    }

    let predicate = build_predicate(frame.instrument_key, frame.timeframe);
    let mut sub = state.hub.subscribe(predicate);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            event = sub.events.recv() => {
                match event {
                    Some(event) => {
                        let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                            warn!(error = %e, "failed to serialize ws event");
                            "{}".to_string()
                        });
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            reason = &mut sub.disconnect => {
                if let Ok(reason) = reason {
                    let _ = socket.send(close_frame(reason)).await;
                }
                break;
            }
            _ = heartbeat.tick() => {
                let hb = WsEvent::Heartbeat { timestamp: now_ms() };
                let msg = serde_json::to_string(&hb).unwrap_or_default();
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unsubscribe(sub.handle);
}

fn build_predicate(
    instrument_key: Option<InstrumentKey>,
    timeframe: Option<Timeframe>,
) -> crate::hub::Predicate<WsEvent> {
    match (instrument_key, timeframe) {
        (None, None) => match_all(),
        (ik, tf) => std::sync::Arc::new(move |event: &WsEvent| {
            let ik_matches = ik.as_ref().map(|want| event.instrument_key() == Some(want)).unwrap_or(true);
            let tf_matches = tf.map(|want| event.timeframe() == Some(want)).unwrap_or(true);
            ik_matches && tf_matches
        }),
    }
}

fn close_frame(reason: DisconnectReason) -> Message {
    let frame = DisconnectFrame::new(reason);
    Message::Text(serde_json::to_string(&frame).unwrap_or_default())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bar;

    fn bar_event(ik: InstrumentKey, tf: Timeframe) -> WsEvent {
        WsEvent::BarClosed {
            instrument_key: ik.clone(),
            timeframe: tf,
            payload: Bar {
                instrument_key: ik,
                timeframe: tf,
                bucket_start: 0,
                open: 1,
                high: 1,
                low: 1,
                close: 1,
                volume: 0,
                open_interest_last: 0,
                tick_count: 0,
                closed_at: Some(60_000),
            },
        }
    }

    #[test]
    fn predicate_matches_instrument_and_timeframe() {
        let ik = InstrumentKey::Equity { symbol: "A".into() };
        let other = InstrumentKey::Equity { symbol: "B".into() };
        let pred = build_predicate(Some(ik.clone()), Some(Timeframe::M1));
        assert!(pred(&bar_event(ik, Timeframe::M1)));
        assert!(!pred(&bar_event(other, Timeframe::M1)));
    }

    #[test]
    fn no_filter_matches_everything() {
        let pred = build_predicate(None, None);
        assert!(pred(&bar_event(InstrumentKey::Equity { symbol: "A".into() }, Timeframe::H1)));
    }
}
