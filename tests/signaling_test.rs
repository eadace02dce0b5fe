//! Signaling client end-to-end tests against an in-process WebSocket server

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use proxchat::network::{ClientMessage, ServerMessage, SignalingClient, SignalingEvent};

/// Accept one connection and hand both directions to the test body
async fn one_shot_server() -> (
    TcpListener,
    u16,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_client_receives_typed_events() {
    let (listener, port) = one_shot_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let roster = serde_json::to_string(&ServerMessage::NearbyPeers(vec![
            "peer-a".to_string(),
            "peer-b".to_string(),
        ]))
        .unwrap();
        ws.send(Message::Text(roster)).await.unwrap();

        let error = serde_json::to_string(&ServerMessage::Error("channel full".to_string())).unwrap();
        ws.send(Message::Text(error)).await.unwrap();

        // hold the connection open until the client is done reading
        let _ = ws.next().await;
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = SignalingClient::connect("127.0.0.1", port, events_tx)
        .await
        .unwrap();

    assert_eq!(
        events_rx.recv().await.unwrap(),
        SignalingEvent::NearbyPeers(vec!["peer-a".to_string(), "peer-b".to_string()])
    );
    assert_eq!(
        events_rx.recv().await.unwrap(),
        SignalingEvent::ServerError("channel full".to_string())
    );

    let stats = client.stats();
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.malformed_frames, 0);

    client.disconnect();
    server.await.unwrap();
}

#[tokio::test]
async fn test_client_sends_are_serialized_in_order() {
    let (listener, port) = one_shot_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let mut received = Vec::new();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let msg: ClientMessage = serde_json::from_str(&text).unwrap();
            let done = msg == ClientMessage::Disconnect;
            received.push(msg);
            if done {
                break;
            }
        }
        received
    });

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let client = SignalingClient::connect("127.0.0.1", port, events_tx)
        .await
        .unwrap();

    client.send(ClientMessage::RequestPeerRefresh).unwrap();
    client
        .send(ClientMessage::UpdatePosition {
            client_id: "me".to_string(),
            map_id: 1,
            x: 2,
            y: 3,
            channel: 4,
        })
        .unwrap();
    client
        .send(ClientMessage::SendOffer {
            target_id: "peer-a".to_string(),
            offer: "{}".to_string(),
        })
        .unwrap();
    client.disconnect();

    let received = server.await.unwrap();
    assert_eq!(received.len(), 4);
    assert_eq!(received[0], ClientMessage::RequestPeerRefresh);
    assert!(matches!(received[1], ClientMessage::UpdatePosition { .. }));
    assert!(matches!(received[2], ClientMessage::SendOffer { .. }));
    assert_eq!(received[3], ClientMessage::Disconnect);
}

#[tokio::test]
async fn test_malformed_frames_are_counted_and_skipped() {
    let (listener, port) = one_shot_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        ws.send(Message::Text("{broken".to_string())).await.unwrap();
        ws.send(Message::Text(r#"{"type":"NoSuchThing"}"#.to_string()))
            .await
            .unwrap();
        let roster =
            serde_json::to_string(&ServerMessage::NearbyPeers(vec!["peer-a".to_string()])).unwrap();
        ws.send(Message::Text(roster)).await.unwrap();

        let _ = ws.next().await;
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = SignalingClient::connect("127.0.0.1", port, events_tx)
        .await
        .unwrap();

    // The well-formed roster still arrives after two bad frames
    assert_eq!(
        events_rx.recv().await.unwrap(),
        SignalingEvent::NearbyPeers(vec!["peer-a".to_string()])
    );
    assert_eq!(client.malformed_count(), 2);

    client.disconnect();
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_drop_reports_disconnected_once() {
    let (listener, port) = one_shot_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = SignalingClient::connect("127.0.0.1", port, events_tx)
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(events_rx.recv().await.unwrap(), SignalingEvent::Disconnected);
    assert!(events_rx.recv().await.is_none());
    assert!(!client.is_connected());

    // sending into a dead connection is an error, not a panic
    assert!(client.send(ClientMessage::RequestPeerRefresh).is_err());
}
