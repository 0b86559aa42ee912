mod common;

use common::{dial_options, math_service, start_server, Operands, TIMEOUT};
use srpc::echo::{self, EchoRequest, EchoResponse};
use srpc::local::LocalUpgrader;
use srpc::{Client, DialOptions, Registry, Server, ServerOptions};
use std::sync::Arc;

async fn start_upgrading_server(socket: &std::path::Path) -> common::TestServer {
    let upgrader = LocalUpgrader::new(socket.to_string_lossy()).map(Arc::new);
    let registry = Registry::with_local_upgrader(upgrader);
    registry.register(echo::service()).unwrap();
    registry.register(math_service()).unwrap();
    start_server(Server::new(Arc::new(registry)).with_options(ServerOptions {
        plaintext_method_powers: true,
        ..ServerOptions::default()
    }))
    .await
}

#[tokio::test]
async fn test_same_host_connection_moves_to_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_upgrading_server(&dir.path().join("srpc.sock")).await;

    let client = Client::dial(&server.addr, &DialOptions::default().with_timeout(TIMEOUT))
        .await
        .unwrap();
    assert!(client.is_unix());
    assert_eq!(client.keep_alive().unwrap(), None);
    client.set_keep_alive(true).unwrap();

    let echoed: EchoResponse = client
        .request_reply("Echo.Echo", &EchoRequest { text: "unix".into() })
        .await
        .unwrap();
    assert_eq!(echoed.text, "unix");
    let sum: i64 = client
        .request_reply("Math.Add", &Operands { a: 5, b: 6 })
        .await
        .unwrap();
    assert_eq!(sum, 11);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_several_clients_upgrade_independently() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_upgrading_server(&dir.path().join("srpc.sock")).await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        let client = Client::dial(&server.addr, &DialOptions::default().with_timeout(TIMEOUT))
            .await
            .unwrap();
        assert!(client.is_unix());
        clients.push(client);
    }
    for (n, client) in clients.iter().enumerate() {
        let sum: i64 = client
            .request_reply("Math.Add", &Operands { a: n as i64, b: 1 })
            .await
            .unwrap();
        assert_eq!(sum, n as i64 + 1);
    }
}

#[tokio::test]
async fn test_upgrade_can_be_declined_by_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_upgrading_server(&dir.path().join("srpc.sock")).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();
    assert!(!client.is_unix());
    client.set_keep_alive(true).unwrap();
    assert_eq!(client.keep_alive().unwrap(), Some(true));
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_server_without_socket_keeps_tcp() {
    let registry = Registry::with_local_upgrader(None);
    registry.register(echo::service()).unwrap();
    let server = start_server(Server::new(Arc::new(registry))).await;

    let client = Client::dial(&server.addr, &DialOptions::default().with_timeout(TIMEOUT))
        .await
        .unwrap();
    assert!(!client.is_unix());
    let echoed: EchoResponse = client
        .request_reply("Echo.Echo", &EchoRequest { text: "tcp".into() })
        .await
        .unwrap();
    assert_eq!(echoed.text, "tcp");
}
