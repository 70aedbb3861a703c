//! Bridges the engine's [`gateway_core::EventBus`] to a single WebSocket
//! connection, following the bridging shape of the teacher's
//! `daemon/src/http/websocket.rs` (there bridging a transport `Hub`
//! instead of an event bus).

use anyhow::Context;
use futures::SinkExt;
use gateway_core::{Event, EventBus, GeneralEvent};
use hyper_tungstenite::HyperWebsocket;
use serde_json::json;
use tungstenite::Message;

pub async fn websocket_event_bridge(ws: HyperWebsocket, events: EventBus) -> Result<(), anyhow::Error> {
    let mut websocket = ws.await.context("ws await failed")?;
    let mut subscription = events.subscribe();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let payload = render(event);
                if websocket.send(Message::Text(payload)).await.is_err() {
                    return Ok(());
                }
            }
            incoming = websocket.next_message() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(_)) => return Ok(()),
                    // The protocol is push-only; any other client frame is ignored.
                    _ => continue,
                }
            }
        }
    }
}

fn render(event: Event) -> String {
    let value = match event {
        Event::DeviceUpdate(snapshot) => json!({"type": "device_update", "device": snapshot}),
        Event::General(GeneralEvent::Devices(devices)) => json!({"type": "devices", "devices": devices}),
        Event::General(GeneralEvent::Telemetry { device, data }) => {
            json!({"type": "telemetry", "device": device, "data": data})
        }
        Event::General(GeneralEvent::StatusMessage { device, message }) => {
            json!({"type": "status_message", "device": device, "message": message})
        }
        Event::General(GeneralEvent::Recovery { device, message }) => {
            json!({"type": "recovery", "device": device, "message": message})
        }
        Event::General(GeneralEvent::NvmDump { device, data }) => {
            json!({"type": "nvm_dump", "device": device, "data": data})
        }
        Event::General(GeneralEvent::Log {
            timestamp_secs,
            level,
            message,
        }) => {
            json!({"type": "log", "timestamp": timestamp_secs, "level": format!("{level:?}"), "message": message})
        }
    };
    value.to_string()
}

/// Minimal extension trait giving the websocket stream a `next_message`
/// that can live inside a `tokio::select!` alongside the event future.
trait NextMessage {
    fn next_message(&mut self) -> futures::future::BoxFuture<'_, Option<Result<Message, tungstenite::Error>>>;
}

impl<S> NextMessage for S
where
    S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send,
{
    fn next_message(&mut self) -> futures::future::BoxFuture<'_, Option<Result<Message, tungstenite::Error>>> {
        use futures::StreamExt;
        Box::pin(self.next())
    }
}
