//! Version handshake behavior over real sockets: admission, rejection,
//! timeout, and the gating of traffic sent before admission.

use netmux::config::NetmuxConfig;
use netmux::core::codec::{encode_body, HEADER_LEN};
use netmux::protocol::{zero, ProtocolDefinition};
use netmux::service::{NetworkClient, NetworkServer, ServerProtocolBuilder};
use netmux::{ClientProtocolBuilder, HandshakeEvent, ReleaseType, Version};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn chat_definition() -> ProtocolDefinition {
    ProtocolDefinition::build("chat", |b| {
        b.client_message::<String>("Say")?;
        b.server_message::<String>("Said")?;
        Ok(())
    })
    .unwrap()
}

fn config_for(addr: Option<SocketAddr>) -> NetmuxConfig {
    NetmuxConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.handshake_timeout = Duration::from_millis(300);
        c.server.version = Version::new(1, 4, 0, ReleaseType::Release);
        c.client.version = Version::new(1, 4, 2, ReleaseType::Beta);
        if let Some(addr) = addr {
            c.client.address = addr.to_string();
        }
    })
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// Raw frame helpers for tests that deliberately misbehave.
fn frame(protocol_id: u16, message_tag: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&protocol_id.to_be_bytes());
    out.extend_from_slice(&message_tag.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

async fn read_frame(stream: &mut TcpStream) -> Option<(u16, u16, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.ok()?;
    let protocol_id = u16::from_be_bytes([header[0], header[1]]);
    let message_tag = u16::from_be_bytes([header[2], header[3]]);
    let body_len = u16::from_be_bytes([header[4], header[5]]);
    let mut body = vec![0u8; usize::from(body_len)];
    stream.read_exact(&mut body).await.ok()?;
    Some((protocol_id, message_tag, body))
}

// Zero-protocol wire tags, derived the same way both peers derive them.
struct WireTags {
    my_version: u16,
    lets_agree: u16,
    not_ready: u16,
    timeout: u16,
    version_match: u16,
    already_done: u16,
}

fn wire_tags() -> WireTags {
    let def = zero::definition().unwrap();
    WireTags {
        my_version: def.client_tag(zero::messages::MY_VERSION).unwrap(),
        lets_agree: def.server_tag(zero::messages::LETS_AGREE).unwrap(),
        not_ready: def.server_tag(zero::messages::NOT_READY).unwrap(),
        timeout: def.server_tag(zero::messages::TIMEOUT).unwrap(),
        version_match: def.server_tag(zero::messages::VERSION_MATCH).unwrap(),
        already_done: def.server_tag(zero::messages::ALREADY_DONE).unwrap(),
    }
}

#[tokio::test]
async fn matching_versions_admit_and_deliver_traffic() {
    let mut server = NetworkServer::new(&config_for(None));
    server
        .register(
            ServerProtocolBuilder::new(chat_definition()).handle::<String, _, _>(
                "Say",
                |handle, conn, text| async move {
                    handle.send(conn, "chat", "Said", &format!("echo: {text}")).await?;
                    Ok(())
                },
            )
            .unwrap(),
        )
        .unwrap();
    let addr = server.listen().await.unwrap();

    let (said_tx, mut said_rx) = mpsc::unbounded_channel();
    let mut client = NetworkClient::new(&config_for(Some(addr)));
    client
        .register(
            ClientProtocolBuilder::new(chat_definition())
                .handle::<String, _, _>("Said", move |_, text| {
                    let said_tx = said_tx.clone();
                    async move {
                        let _ = said_tx.send(text);
                        Ok(())
                    }
                })
                .unwrap(),
        )
        .unwrap();
    client.connect().await.unwrap();

    wait_until(|| client.is_ready()).await;
    client
        .send("chat", "Say", &"hello".to_string())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let said = tokio::time::timeout(Duration::from_secs(5), said_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(said, "echo: hello");

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn mismatching_versions_are_rejected_and_closed() {
    let mut server = NetworkServer::new(&config_for(None));
    server
        .register(ServerProtocolBuilder::new(chat_definition()))
        .unwrap();
    let addr = server.listen().await.unwrap();

    let config = NetmuxConfig::default_with_overrides(|c| {
        c.client.address = addr.to_string();
        c.client.version = Version::new(9, 9, 0, ReleaseType::Release);
    });
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut client = NetworkClient::new(&config);
    client
        .register(ClientProtocolBuilder::new(chat_definition()))
        .unwrap();
    client.on_handshake(move |event| {
        let _ = events_tx.send(event);
    });
    client.connect().await.unwrap();

    assert_eq!(events_rx.recv().await, Some(HandshakeEvent::Started));
    assert_eq!(events_rx.recv().await, Some(HandshakeEvent::Mismatched));
    // The server hangs up after the notice.
    wait_until(|| !client.is_connected()).await;
    assert!(!client.is_ready());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_peer_is_timed_out_exactly_once() {
    let mut server = NetworkServer::new(&config_for(None));
    server
        .register(ServerProtocolBuilder::new(chat_definition()))
        .unwrap();
    let addr = server.listen().await.unwrap();

    // Raw socket that never answers the greeting.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut frames = Vec::new();
    while let Some(received) = read_frame(&mut stream).await {
        frames.push(received);
    }

    let tags = wire_tags();
    assert_eq!(frames.first(), Some(&(0, tags.lets_agree, Vec::new())));
    let timeouts = frames
        .iter()
        .filter(|(pid, tag, _)| *pid == 0 && *tag == tags.timeout)
        .count();
    assert_eq!(timeouts, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn traffic_before_admission_gets_not_ready_and_is_dropped() {
    let handled = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&handled);

    let mut server = NetworkServer::new(&config_for(None));
    server
        .register(
            ServerProtocolBuilder::new(chat_definition())
                .handle::<String, _, _>("Say", move |_, _, _| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap(),
        )
        .unwrap();
    let addr = server.listen().await.unwrap();

    let tags = wire_tags();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let greeting = read_frame(&mut stream).await.unwrap();
    assert_eq!(greeting, (0, tags.lets_agree, Vec::new()));

    // Jump the gun: a chat message before MyVersion.
    let body = encode_body(&"early".to_string(), 1024).unwrap();
    stream.write_all(&frame(1, 0, &body)).await.unwrap();
    let refusal = read_frame(&mut stream).await.unwrap();
    assert_eq!(refusal, (0, tags.not_ready, Vec::new()));
    assert!(!handled.load(Ordering::SeqCst));

    // Now complete the handshake; the same message goes through.
    let version = encode_body(&Version::new(1, 4, 0, ReleaseType::Release), 1024).unwrap();
    stream
        .write_all(&frame(0, tags.my_version, &version))
        .await
        .unwrap();
    let verdict = read_frame(&mut stream).await.unwrap();
    assert_eq!(verdict, (0, tags.version_match, Vec::new()));

    stream.write_all(&frame(1, 0, &body)).await.unwrap();
    wait_until(|| handled.load(Ordering::SeqCst)).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn repeated_version_answer_gets_already_done() {
    let mut server = NetworkServer::new(&config_for(None));
    server
        .register(ServerProtocolBuilder::new(chat_definition()))
        .unwrap();
    let addr = server.listen().await.unwrap();

    let tags = wire_tags();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let greeting = read_frame(&mut stream).await.unwrap();
    assert_eq!(greeting, (0, tags.lets_agree, Vec::new()));

    let version = encode_body(&Version::new(1, 4, 0, ReleaseType::Release), 1024).unwrap();
    stream
        .write_all(&frame(0, tags.my_version, &version))
        .await
        .unwrap();
    let verdict = read_frame(&mut stream).await.unwrap();
    assert_eq!(verdict, (0, tags.version_match, Vec::new()));

    // A second MyVersion on an admitted connection draws the notice but
    // leaves the connection open.
    stream
        .write_all(&frame(0, tags.my_version, &version))
        .await
        .unwrap();
    let notice = read_frame(&mut stream).await.unwrap();
    assert_eq!(notice, (0, tags.already_done, Vec::new()));

    server.stop().await.unwrap();
}
