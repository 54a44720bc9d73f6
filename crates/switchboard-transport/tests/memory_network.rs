//! Integration test: the in-process network seen through the public traits.
use switchboard_transport::{
    memory, signal_channel, Connector, LinkId, Listener, ReadyState, TransportError,
    TransportSignal,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn listener_closes_once_every_connector_is_gone() {
    init_tracing();
    let (connector, mut listener) = memory::network();
    let second = connector.clone();
    drop(connector);

    let (signals, _rx) = signal_channel(LinkId::new(1));
    let pending = second.connect("mem://a", signals).unwrap();
    drop(second);

    // The peer dialed before the connector went away is still handed out.
    let (server_signals, _server_rx) = signal_channel(LinkId::new(1));
    let accepted = listener.accept(server_signals.clone()).await.unwrap();
    assert_eq!(accepted.ready_state(), ReadyState::Open);
    assert_eq!(pending.ready_state(), ReadyState::Open);

    assert!(matches!(
        listener.accept(server_signals).await,
        Err(TransportError::ListenerClosed)
    ));
}

#[tokio::test]
async fn abandoned_dial_is_skipped() {
    init_tracing();
    let (connector, mut listener) = memory::network();

    let (gone_signals, _gone_rx) = signal_channel(LinkId::new(1));
    let gone = connector.connect("mem://a", gone_signals).unwrap();
    drop(gone);

    let (signals, mut rx) = signal_channel(LinkId::new(2));
    let _live = connector.connect("mem://a", signals).unwrap();

    let (server_signals, mut server_rx) = signal_channel(LinkId::new(7));
    let mut server = listener.accept(server_signals).await.unwrap();
    assert!(matches!(server_rx.recv().await, Some((_, TransportSignal::Open))));
    assert!(matches!(rx.recv().await, Some((_, TransportSignal::Open))));

    server.send(r#"["hello"]"#).unwrap();
    let (link, signal) = rx.recv().await.unwrap();
    assert_eq!(link, LinkId::new(2));
    assert!(matches!(signal, TransportSignal::Message(ref f) if f == r#"["hello"]"#));
}

#[tokio::test]
async fn dropping_a_transport_closes_the_link() {
    init_tracing();
    let (connector, mut listener) = memory::network();
    let (signals, mut rx) = signal_channel(LinkId::new(1));
    let (server_signals, mut server_rx) = signal_channel(LinkId::new(1));

    let client = connector.connect("mem://a", signals).unwrap();
    let mut server = listener.accept(server_signals).await.unwrap();
    let _ = rx.recv().await;
    let _ = server_rx.recv().await;

    drop(client);
    assert!(matches!(server_rx.recv().await, Some((_, TransportSignal::Close))));
    assert!(matches!(server.send("late"), Err(TransportError::NotOpen)));
}
