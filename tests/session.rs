//! Session-manager behavior: lifecycle ordering, broadcasts, id reuse, and
//! connection queries, over real sockets.

use netmux::config::NetmuxConfig;
use netmux::protocol::ProtocolDefinition;
use netmux::service::{NetworkClient, NetworkServer, ServerProtocolBuilder};
use netmux::{ClientProtocolBuilder, ConnectionId, HOST_CONNECTION_ID};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
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

fn config_at(addr: Option<SocketAddr>) -> NetmuxConfig {
    NetmuxConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
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

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event not received in time")
        .expect("channel closed")
}

/// A server whose connected/disconnected listeners report into channels.
async fn observed_server() -> (
    NetworkServer,
    SocketAddr,
    mpsc::UnboundedReceiver<ConnectionId>,
    mpsc::UnboundedReceiver<ConnectionId>,
) {
    let (connected_tx, connected_rx) = mpsc::unbounded_channel();
    let (disconnected_tx, disconnected_rx) = mpsc::unbounded_channel();

    let mut server = NetworkServer::new(&config_at(None));
    server
        .register(
            ServerProtocolBuilder::new(chat_definition())
                .on_connected(move |_, conn| {
                    let connected_tx = connected_tx.clone();
                    async move {
                        let _ = connected_tx.send(conn);
                        Ok(())
                    }
                })
                .on_disconnected(move |_, conn| {
                    let disconnected_tx = disconnected_tx.clone();
                    async move {
                        let _ = disconnected_tx.send(conn);
                        Ok(())
                    }
                }),
        )
        .unwrap();
    let addr = server.listen().await.unwrap();
    (server, addr, connected_rx, disconnected_rx)
}

async fn ready_client(addr: SocketAddr, said_log: Arc<Mutex<Vec<String>>>) -> NetworkClient {
    let mut client = NetworkClient::new(&config_at(Some(addr)));
    client
        .register(
            ClientProtocolBuilder::new(chat_definition())
                .handle::<String, _, _>("Said", move |_, text| {
                    let said_log = Arc::clone(&said_log);
                    async move {
                        said_log.lock().unwrap().push(text);
                        Ok(())
                    }
                })
                .unwrap(),
        )
        .unwrap();
    client.connect().await.unwrap();
    wait_until(|| client.is_ready()).await;
    client
}

#[tokio::test]
async fn broadcast_reaches_all_and_reports_per_target() {
    let (server, addr, mut connected_rx, _disconnected_rx) = observed_server().await;

    let log_a = Arc::new(Mutex::new(Vec::new()));
    let log_b = Arc::new(Mutex::new(Vec::new()));
    let mut client_a = ready_client(addr, Arc::clone(&log_a)).await;
    let mut client_b = ready_client(addr, Arc::clone(&log_b)).await;
    let id_a = recv(&mut connected_rx).await;
    let id_b = recv(&mut connected_rx).await;

    let handle = server.handle().unwrap();

    // Broadcast to everyone.
    let results = handle
        .broadcast(None, "chat", "Said", &"all hands".to_string())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    for completion in results.into_values() {
        completion.expect("live target").wait().await.unwrap();
    }
    wait_until(|| log_a.lock().unwrap().len() == 1).await;
    wait_until(|| log_b.lock().unwrap().len() == 1).await;

    // Targeted broadcast with one bogus id: partial results, no abort.
    let bogus: ConnectionId = 999;
    let results = handle
        .broadcast(Some(&[id_a, bogus]), "chat", "Said", &"just you".to_string())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.get(&id_a).unwrap().is_some());
    assert!(results.get(&bogus).unwrap().is_none());

    wait_until(|| log_a.lock().unwrap().len() == 2).await;
    assert_eq!(log_b.lock().unwrap().len(), 1);
    let _ = id_b;

    client_a.close().await.unwrap();
    client_b.close().await.unwrap();
    let mut server = server;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn ids_are_reused_only_after_teardown_events() {
    let (server, addr, mut connected_rx, mut disconnected_rx) = observed_server().await;
    let handle = server.handle().unwrap();

    let mut first = ready_client(addr, Arc::new(Mutex::new(Vec::new()))).await;
    let first_id = recv(&mut connected_rx).await;

    first.close().await.unwrap();
    // The disconnected listener fires before the id can recycle.
    assert_eq!(recv(&mut disconnected_rx).await, first_id);
    wait_until(|| !handle.connection_exists(first_id)).await;

    let mut second = ready_client(addr, Arc::new(Mutex::new(Vec::new()))).await;
    let second_id = recv(&mut connected_rx).await;
    assert_eq!(second_id, first_id);

    second.close().await.unwrap();
    let mut server = server;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn connection_queries_track_liveness() {
    let (server, addr, mut connected_rx, mut disconnected_rx) = observed_server().await;
    let handle = server.handle().unwrap();

    assert!(!handle.connection_exists(HOST_CONNECTION_ID));

    let mut client = ready_client(addr, Arc::new(Mutex::new(Vec::new()))).await;
    let conn = recv(&mut connected_rx).await;
    assert!(handle.connection_exists(conn));
    assert_eq!(handle.connections(), vec![conn]);

    // Unknown targets are a no-op, not an error.
    assert!(!handle.close(conn + 1));
    let sent = handle
        .send(conn + 1, "chat", "Said", &"nobody".to_string())
        .await
        .unwrap();
    assert!(sent.is_none());

    // Server-side close tears the connection down.
    assert!(handle.close(conn));
    assert_eq!(recv(&mut disconnected_rx).await, conn);
    wait_until(|| !handle.connection_exists(conn)).await;
    wait_until(|| !client.is_connected()).await;

    let _ = client.close().await;
    let mut server = server;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn typed_senders_bind_once_and_check_types() {
    let (server, addr, mut connected_rx, _disconnected_rx) = observed_server().await;
    let handle = server.handle().unwrap();

    // Type mismatch is caught at sender construction.
    assert!(handle.make_sender::<u32>("chat", "Said").is_err());
    assert!(handle.make_sender::<String>("chat", "Missing").is_err());
    assert!(handle.make_sender::<String>("nope", "Said").is_err());

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut client = ready_client(addr, Arc::clone(&log)).await;
    let conn = recv(&mut connected_rx).await;

    let sender = handle.make_sender::<String>("chat", "Said").unwrap();
    sender
        .send(conn, &"bound".to_string())
        .await
        .unwrap()
        .expect("live target")
        .wait()
        .await
        .unwrap();
    wait_until(|| log.lock().unwrap().as_slice() == ["bound".to_string()]).await;

    let broadcaster = handle.make_broadcaster::<String>("chat", "Said").unwrap();
    let results = broadcaster.broadcast(None, &"again".to_string()).await.unwrap();
    assert_eq!(results.len(), 1);
    wait_until(|| log.lock().unwrap().len() == 2).await;

    client.close().await.unwrap();
    let mut server = server;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_fires_server_lifecycle_and_disconnects_clients() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<&'static str>();
    let started_tx = events_tx.clone();
    let stopped_tx = events_tx.clone();

    let mut server = NetworkServer::new(&config_at(None));
    server
        .register(
            ServerProtocolBuilder::new(chat_definition())
                .on_server_started(move |_| {
                    let started_tx = started_tx.clone();
                    async move {
                        let _ = started_tx.send("started");
                        Ok(())
                    }
                })
                .on_server_stopped(move |_| {
                    let stopped_tx = stopped_tx.clone();
                    async move {
                        let _ = stopped_tx.send("stopped");
                        Ok(())
                    }
                }),
        )
        .unwrap();
    let addr = server.listen().await.unwrap();
    assert_eq!(recv(&mut events_rx).await, "started");

    let client = ready_client(addr, Arc::new(Mutex::new(Vec::new()))).await;

    server.stop().await.unwrap();
    assert_eq!(recv(&mut events_rx).await, "stopped");
    wait_until(|| !client.is_connected()).await;
    assert!(!server.is_listening());
}

#[tokio::test]
async fn stop_during_a_burst_of_connects_leaves_no_live_connection() {
    let mut server = NetworkServer::new(&config_at(None));
    server
        .register(ServerProtocolBuilder::new(chat_definition()))
        .unwrap();
    let addr = server.listen().await.unwrap();

    // Raw sockets racing the stop: any the server accepted must still be
    // torn down, the rest fail or are reset when the listener drops.
    let connector = tokio::spawn(async move {
        let mut sockets = Vec::new();
        for _ in 0..32 {
            match TcpStream::connect(addr).await {
                Ok(stream) => sockets.push(stream),
                Err(_) => break,
            }
        }
        sockets
    });

    server.stop().await.unwrap();
    assert!(!server.is_listening());

    let sockets = connector.await.unwrap();
    for mut stream in sockets {
        // Every socket reaches EOF or an error; none is left pumping.
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut buf = [0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("socket not released after stop");
    }
}
