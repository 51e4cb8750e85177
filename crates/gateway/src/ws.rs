//! Operator control channel over WebSocket.
//!
//! Each socket becomes the broadcaster's single subscriber for as long as it
//! stays open. Frames are server-to-client only; anything the client sends
//! is ignored apart from close.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
    wagate_whatsapp::ControlEvent,
};

use crate::state::GatewayState;

pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlEvent>();

    let id = state.broadcaster.attach(tx).await;
    info!(subscriber = id, remote = %remote, "control channel attached");

    // Ends when the broadcaster drops our sender, i.e. a newer socket
    // replaced this one.
    let write_loop = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode control event");
                    continue;
                },
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => {},
            Err(e) => {
                debug!(subscriber = id, error = %e, "control channel read error");
                break;
            },
        }
    }

    state.broadcaster.detach(id).await;
    write_loop.abort();
    info!(subscriber = id, remote = %remote, "control channel closed");
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_support::TestGateway,
        serde_json::{Value, json},
        std::time::Duration,
        tokio::net::TcpListener,
        tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite},
        wagate_whatsapp::StatusUpdate,
    };

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve(gw: &TestGateway) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = gw.app();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn open(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws
    }

    async fn next_frame(ws: &mut Client) -> Option<Value> {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        match msg {
            Some(Ok(tungstenite::Message::Text(text))) => Some(serde_json::from_str(&text).unwrap()),
            _ => None,
        }
    }

    fn loading() -> Vec<Value> {
        vec![
            json!({ "event": "qrstatus", "data": "./assets/loader.gif" }),
            json!({ "event": "log", "data": "Registering QR Code, please wait!" }),
        ]
    }

    #[tokio::test]
    async fn attach_replays_then_streams_updates() {
        let gw = TestGateway::new();
        let addr = serve(&gw).await;
        let mut ws = open(addr).await;

        assert_eq!(next_frame(&mut ws).await, Some(loading()[0].clone()));
        assert_eq!(next_frame(&mut ws).await, Some(loading()[1].clone()));

        gw.connect().await;
        let mut frames = Vec::new();
        while frames.last()
            != Some(&json!({ "event": "log", "data": "WhatsApp connected!" }))
        {
            frames.push(next_frame(&mut ws).await.unwrap());
        }
        assert!(frames.contains(&json!({ "event": "qrstatus", "data": "./assets/check.svg" })));
    }

    #[tokio::test]
    async fn new_socket_replaces_previous() {
        let gw = TestGateway::new();
        let addr = serve(&gw).await;

        let mut first = open(addr).await;
        next_frame(&mut first).await.unwrap();
        next_frame(&mut first).await.unwrap();

        let mut second = open(addr).await;
        next_frame(&mut second).await.unwrap();
        next_frame(&mut second).await.unwrap();

        // The replaced socket is closed by the server.
        assert_eq!(next_frame(&mut first).await, None);

        gw.state.broadcaster.publish(StatusUpdate::Connected).await;
        assert_eq!(
            next_frame(&mut second).await,
            Some(json!({ "event": "qrstatus", "data": "./assets/check.svg" }))
        );
        assert!(gw.state.broadcaster.has_subscriber().await);
    }
}
