//! Per-connection plumbing: WebSocket read loop, a writer task owning the
//! socket's write half, and a bridge turning engine events into JSON
//! frames. On close, every user the socket registered is torn down against
//! this connection's identity, so a reconnect that already took over an id
//! is left alone.

use std::collections::HashSet;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use dispatch_core::engine::Engine;
use dispatch_core::events::{InboundEvent, OutboundEvent, UserId};
use dispatch_core::presence::ConnectionHandle;
use dispatch_core::store::{RideRecord, RideStore};

use crate::wire::{ControlFrame, ServerFrame};

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, engine: Engine) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("websocket handshake with {addr} failed: {err}");
            return;
        }
    };
    info!("connection established from {addr}");
    let (mut ws_sender, mut ws_receiver) = ws.split();

    // Writer task: sole owner of the socket's write half.
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Bridge engine events into wire frames on the same writer.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    let bridge_tx = msg_tx.clone();
    let bridge = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if bridge_tx.send(Message::Text(json)).is_err() {
                        break;
                    }
                }
                Err(err) => warn!("failed to serialize {}: {err}", event.kind()),
            }
        }
    });

    let handle = ConnectionHandle::new(event_tx);
    // Users this socket registered, for teardown when it closes.
    let mut bound_users: HashSet<UserId> = HashSet::new();

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &engine, &handle, &mut bound_users, &msg_tx).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = msg_tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("websocket error from {addr}: {err}");
                        break;
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    for user_id in &bound_users {
        engine.disconnect(user_id, handle.conn_id()).await;
    }
    info!("connection from {addr} closed");
    writer.abort();
    bridge.abort();
}

async fn handle_frame(
    text: &str,
    engine: &Engine,
    handle: &ConnectionHandle,
    bound_users: &mut HashSet<UserId>,
    msg_tx: &mpsc::UnboundedSender<Message>,
) {
    if let Ok(event) = serde_json::from_str::<InboundEvent>(text) {
        bind_user(&event, bound_users);
        if let Err(err) = engine.handle_event(event, handle).await {
            send_frame(
                msg_tx,
                &ServerFrame::Error {
                    message: err.to_string(),
                },
            );
        }
        return;
    }

    match serde_json::from_str::<ControlFrame>(text) {
        Ok(ControlFrame::RequestRide {
            rider_id,
            pickup,
            destination,
        }) => {
            let ride_id = Uuid::new_v4().to_string();
            let record = RideRecord::new(ride_id.clone(), rider_id, pickup, destination);
            if let Err(err) = engine.store().create_ride(record) {
                send_frame(
                    msg_tx,
                    &ServerFrame::Error {
                        message: err.to_string(),
                    },
                );
                return;
            }
            send_frame(
                msg_tx,
                &ServerFrame::RideRequested {
                    ride_id: ride_id.clone(),
                },
            );
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.dispatch_ride(&ride_id).await {
                    warn!("ride {ride_id}: dispatch failed: {err}");
                }
            });
        }
        Err(err) => send_frame(
            msg_tx,
            &ServerFrame::Error {
                message: format!("invalid frame: {err}"),
            },
        ),
    }
}

/// Records which user ids this socket speaks for, so closing it tears down
/// exactly the state it registered.
fn bind_user(event: &InboundEvent, bound_users: &mut HashSet<UserId>) {
    match event {
        InboundEvent::Connect { user_id } => {
            bound_users.insert(user_id.clone());
        }
        InboundEvent::DriverOnline { driver_id, .. } => {
            bound_users.insert(driver_id.clone());
        }
        InboundEvent::RiderLooking { rider_id, .. } => {
            bound_users.insert(rider_id.clone());
        }
        _ => {}
    }
}

fn send_frame(msg_tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = msg_tx.send(Message::Text(json));
        }
        Err(err) => warn!("failed to serialize server frame: {err}"),
    }
}
