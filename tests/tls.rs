//! End-to-end traffic over TLS: handshake, admission, and echo, with a
//! self-signed certificate trusted explicitly by the client.

use netmux::config::NetmuxConfig;
use netmux::protocol::ProtocolDefinition;
use netmux::service::{NetworkClient, NetworkServer, ServerProtocolBuilder};
use netmux::{ClientProtocolBuilder, ProtocolError, TlsClientConfig, TlsServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

fn chat_definition() -> ProtocolDefinition {
    ProtocolDefinition::build("chat", |b| {
        b.client_message::<String>("Say")?;
        b.server_message::<String>("Said")?;
        Ok(())
    })
    .unwrap()
}

fn config_at(addr: Option<SocketAddr>) -> NetmuxConfig {
    NetmuxConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        if let Some(addr) = addr {
            c.client.address = addr.to_string();
        }
    })
}

/// Writes a fresh self-signed certificate and key, returns their paths.
fn self_signed_material(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();
    (cert_path, key_path)
}

async fn tls_server(dir: &tempfile::TempDir) -> (NetworkServer, SocketAddr, PathBuf) {
    let (cert_path, key_path) = self_signed_material(dir);

    let mut server = NetworkServer::new(&config_at(None));
    server
        .with_tls(TlsServerConfig::new(&cert_path, &key_path))
        .unwrap();
    server
        .register(
            ServerProtocolBuilder::new(chat_definition())
                .handle::<String, _, _>("Say", |handle, conn, text| async move {
                    handle
                        .send(conn, "chat", "Said", &format!("echo: {text}"))
                        .await?;
                    Ok(())
                })
                .unwrap(),
        )
        .unwrap();
    let addr = server.listen().await.unwrap();
    (server, addr, cert_path)
}

#[tokio::test]
async fn traffic_round_trips_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr, cert_path) = tls_server(&dir).await;

    let (said_tx, mut said_rx) = mpsc::unbounded_channel();
    let mut client = NetworkClient::new(&config_at(Some(addr)));
    client
        .with_tls(
            TlsClientConfig::new("localhost").with_root_ca(cert_path.to_string_lossy()),
        )
        .unwrap();
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

    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.is_ready() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("handshake did not complete");

    client
        .send("chat", "Say", &"secure".to_string())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let said = tokio::time::timeout(Duration::from_secs(5), said_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(said, "echo: secure");

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn untrusted_certificate_fails_the_connect() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr, _cert_path) = tls_server(&dir).await;

    // No root CA configured: the self-signed certificate is not trusted and
    // the TLS handshake fails before any session state exists.
    let mut client = NetworkClient::new(&config_at(Some(addr)));
    client.with_tls(TlsClientConfig::new("localhost")).unwrap();
    client
        .register(ClientProtocolBuilder::new(chat_definition()))
        .unwrap();
    let result = client.connect().await;
    assert!(matches!(result, Err(ProtocolError::TlsError(_))));
    assert!(!client.is_connected());

    server.stop().await.unwrap();
}
