use std::sync::Arc;

use async_trait::async_trait;
use nkc_store::models::RoutingHints;
use nkc_transport::tcp::{read_frame, serve, write_frame, DeliveryFrame};
use nkc_transport::{
    CancellationToken, DirectTcpTransport, ExternalProxyBridge, InboundSink, OnionBridge, OnionProvider,
    OutgoingMessage, Socks5Transport, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Default)]
struct CollectingSink {
    received: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl InboundSink for CollectingSink {
    async fn deliver(&self, id: &str, _conv_id: &str, from: &str, payload: &str) -> Result<(), TransportError> {
        self.received
            .lock()
            .push((id.to_string(), from.to_string(), payload.to_string()));
        Ok(())
    }
}

fn message(routing: RoutingHints) -> OutgoingMessage {
    OutgoingMessage {
        id: "evt-1".into(),
        conv_id: "c1".into(),
        to_device_id: "dev-b".into(),
        ciphertext: r#"{"sealed":true}"#.into(),
        routing,
    }
}

#[tokio::test]
async fn direct_tcp_delivers_and_waits_for_ack() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve(listener, sink.clone(), cancel.clone()));

    let transport = DirectTcpTransport::new("dev-a");
    let msg = message(RoutingHints {
        direct_addr: Some(addr.to_string()),
        onion_addr: None,
    });
    transport.send(&msg, CancellationToken::new()).await.unwrap();

    assert_eq!(
        sink.received.lock().clone(),
        vec![("evt-1".to_string(), "dev-a".to_string(), r#"{"sealed":true}"#.to_string())]
    );
    cancel.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn direct_tcp_without_address_fails_fast() {
    let transport = DirectTcpTransport::new("dev-a");
    let err = transport
        .send(&message(RoutingHints::default()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Failed { .. }));
}

/// Minimal SOCKS5 proxy that accepts one CONNECT and then plays the
/// receiving peer itself.
async fn fake_proxy(listener: TcpListener) -> (String, u16) {
    let (mut s, _) = listener.accept().await.unwrap();
    let mut greeting = [0u8; 3];
    s.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [0x05, 0x01, 0x00]);
    s.write_all(&[0x05, 0x00]).await.unwrap();

    let mut head = [0u8; 5];
    s.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
    let mut host = vec![0u8; head[4] as usize];
    s.read_exact(&mut host).await.unwrap();
    let port = s.read_u16().await.unwrap();
    s.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0]).await.unwrap();

    match read_frame(&mut s).await.unwrap() {
        DeliveryFrame::Deliver { id, .. } => write_frame(&mut s, &DeliveryFrame::Ack { id }).await.unwrap(),
        other => panic!("unexpected frame {other:?}"),
    }
    (String::from_utf8(host).unwrap(), port)
}

#[tokio::test]
async fn socks_transport_connects_by_name_through_bridge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let proxy = tokio::spawn(fake_proxy(listener));

    let bridge = Arc::new(ExternalProxyBridge::new(
        OnionProvider::Tor,
        format!("socks5h://{proxy_addr}"),
    ));
    bridge.start().await.unwrap();
    let transport = Socks5Transport::new(bridge, "dev-a");
    let msg = message(RoutingHints {
        direct_addr: None,
        onion_addr: Some("peerabcdef.onion:7000".into()),
    });
    transport.send(&msg, CancellationToken::new()).await.unwrap();

    let (host, port) = proxy.await.unwrap();
    assert_eq!(host, "peerabcdef.onion");
    assert_eq!(port, 7000);
}

#[tokio::test]
async fn socks_transport_requires_running_bridge() {
    let bridge = Arc::new(ExternalProxyBridge::new(OnionProvider::Tor, "socks5h://127.0.0.1:9"));
    let transport = Socks5Transport::new(bridge, "dev-a");
    let msg = message(RoutingHints {
        direct_addr: None,
        onion_addr: Some("peer.onion:7000".into()),
    });
    let err = transport.send(&msg, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TransportError::Bridge(_)));
}
