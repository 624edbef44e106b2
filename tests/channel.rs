//! Integration tests for the realtime channel, run against an in-process
//! WebSocket server so no external service is needed.

use coin_link::{
    ChannelConnection, CoinLinkError, CoinLinkTimeouts, ConnectionOptions, EventHandlers,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

const INIT_FRAME: &str = r#"{"type":"INIT","score":2000,"place":7,"randomId":1534}"#;

async fn bind_server() -> (TcpListener, String) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let url = format!("ws://{addr}/channel/1/?vk_user_id=33&ver=1&upd=1&pass=32");
    (listener, url)
}

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept test connection");
    accept_async(stream).await.expect("websocket handshake")
}

async fn send_text(ws: &mut ServerWs, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("server send");
}

/// Read frames until a text frame arrives, answering pings along the way.
async fn next_text(ws: &mut ServerWs) -> Option<String> {
    while let Some(frame) = ws.next().await {
        match frame.ok()? {
            Message::Text(text) => return Some(text.to_string()),
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Correlation id of a pushed command frame (`P<id> <command>`).
fn push_id(frame: &str) -> u64 {
    frame
        .strip_prefix('P')
        .and_then(|rest| rest.split_once(' '))
        .and_then(|(id, _)| id.parse().ok())
        .unwrap_or_else(|| panic!("not a push frame: {frame}"))
}

fn test_connection(url: &str) -> ChannelConnection {
    let conn = ChannelConnection::new(
        ConnectionOptions::default().with_auto_reconnect(false),
        CoinLinkTimeouts::fast(),
        EventHandlers::new(),
    );
    conn.set_channel_url(url);
    conn
}

/// Poll `check` until it passes or the deadline elapses.
async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn test_start_delivers_init_payload() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;
        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    let init = conn.start(None).await.expect("start");

    assert_eq!(init.score, 2000);
    assert_eq!(init.place, 7);
    assert_eq!(conn.balance(), Some(2000));
    assert!(conn.is_connected());

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_answers_correlate_out_of_order() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;

        let first = next_text(&mut ws).await.expect("first command");
        let second = next_text(&mut ws).await.expect("second command");
        // Answer in reverse order of arrival.
        send_text(&mut ws, &format!("C{} 500", push_id(&second))).await;
        send_text(&mut ws, &format!("C{} 1500", push_id(&first))).await;

        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    conn.start(None).await.expect("start");

    let (first, second) = tokio::join!(conn.command("GS 1"), conn.command("GS 2"));
    assert_eq!(first.expect("first answer"), "1500");
    assert_eq!(second.expect("second answer"), "500");

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_error_answer_becomes_service_error() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;

        let frame = next_text(&mut ws).await.expect("command");
        send_text(&mut ws, &format!("R{} NOT_ENOUGH_COINS", push_id(&frame))).await;

        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    conn.start(None).await.expect("start");

    let err = conn
        .transfer(290331922, 100_000_000, false, None, None)
        .await
        .expect_err("transfer must fail");
    match err {
        CoinLinkError::ServiceError { code, .. } => assert_eq!(code, "NOT_ENOUGH_COINS"),
        other => panic!("expected ServiceError, got {other:?}"),
    }

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;
        // Swallow every command without answering.
        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    conn.start(None).await.expect("start");

    let err = conn.command("X").await.expect_err("command must time out");
    assert!(matches!(err, CoinLinkError::ProtocolTimeout(_)));

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_transfer_event_and_balance_update() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;
        // An incoming transfer is announced twice: TR carries the event,
        // TZ carries the authoritative balance.
        send_text(&mut ws, "TR 5 290331922 570760228").await;
        send_text(&mut ws, "TZ 5 290331922 570760228 1999").await;
        while next_text(&mut ws).await.is_some() {}
    });

    let transfers = Arc::new(Mutex::new(Vec::new()));
    let handlers = EventHandlers::new();
    {
        let transfers = transfers.clone();
        handlers.on_transfer(move |transfer| {
            transfers.lock().unwrap().push(transfer);
        });
    }

    let conn = ChannelConnection::new(
        ConnectionOptions::default().with_auto_reconnect(false),
        CoinLinkTimeouts::fast(),
        handlers,
    );
    conn.set_channel_url(url.as_str());
    conn.start(None).await.expect("start");

    {
        let conn = conn.clone();
        wait_for(move || conn.balance() == Some(1999)).await;
    }

    // Exactly one transfer event for the pair of frames.
    let transfers = transfers.lock().unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].amount, 5);
    assert_eq!(transfers[0].from_id, 290331922);
    assert_eq!(transfers[0].tx_id, 570760228);

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_transfer_parses_receipt() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;

        let frame = next_text(&mut ws).await.expect("command");
        let id = push_id(&frame);
        assert!(frame.ends_with("T 290331922 5 0"));
        send_text(
            &mut ws,
            &format!(r#"C{id} {{"id":570760228,"amount":5,"current":1995}}"#),
        )
        .await;

        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    conn.start(None).await.expect("start");

    let receipt = conn
        .transfer(290331922, 5, false, None, None)
        .await
        .expect("transfer");
    assert_eq!(receipt.id, 570760228);
    assert_eq!(receipt.amount, 5);
    assert_eq!(receipt.current, 1995);

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_merchant_key_answer_is_unquoted() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;

        let frame = next_text(&mut ws).await.expect("command");
        let id = push_id(&frame);
        assert!(frame.ends_with(" NM"));
        send_text(&mut ws, &format!(r#"C{id} "a1b2c3d4e5""#)).await;

        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    conn.start(None).await.expect("start");

    let key = conn.get_merchant_key().await.expect("merchant key");
    assert_eq!(key, "a1b2c3d4e5");

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_broken_signal_fails_start() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, "BROKEN").await;
        while next_text(&mut ws).await.is_some() {}
    });

    let conn = test_connection(&url);
    let err = conn.start(None).await.expect_err("start must fail");
    match err {
        CoinLinkError::ServiceError { code, .. } => assert_eq!(code, "BROKEN"),
        other => panic!("expected ServiceError, got {other:?}"),
    }

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let (listener, url) = bind_server().await;
    let server = tokio::spawn(async move {
        // First connection: init, then drop without a close frame.
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;
        drop(ws);

        // The client must come back on its own.
        let mut ws = accept_ws(&listener).await;
        send_text(&mut ws, INIT_FRAME).await;
        while next_text(&mut ws).await.is_some() {}
    });

    let connects = Arc::new(AtomicUsize::new(0));
    let handlers = EventHandlers::new();
    {
        let connects = connects.clone();
        handlers.on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let conn = ChannelConnection::new(
        ConnectionOptions::default()
            .with_reconnect_delay_ms(20)
            .with_max_reconnect_delay_ms(100),
        CoinLinkTimeouts::fast(),
        handlers,
    );
    conn.set_channel_url(url.as_str());
    conn.start(None).await.expect("start");

    {
        let connects = connects.clone();
        wait_for(move || connects.load(Ordering::SeqCst) >= 2).await;
    }
    {
        let conn = conn.clone();
        wait_for(move || conn.is_connected()).await;
    }

    conn.disconnect().expect("disconnect");
    server.await.expect("server task");
}

#[tokio::test]
async fn test_command_before_connect_is_a_lifecycle_error() {
    let conn = ChannelConnection::new(
        ConnectionOptions::default(),
        CoinLinkTimeouts::fast(),
        EventHandlers::new(),
    );
    let err = conn.command("X").await.expect_err("must fail");
    assert!(matches!(err, CoinLinkError::LifecycleError(_)));

    let err = conn.disconnect().expect_err("must fail");
    assert!(matches!(err, CoinLinkError::LifecycleError(_)));
}
