mod common;

use common::{dial_options, eventually, start_server, test_registry, Operands, TIMEOUT};
use srpc::echo::{EchoRequest, EchoResponse};
use srpc::{Client, Coder, Error, Server, ServerOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn powered_server() -> Server {
    Server::new(test_registry()).with_options(ServerOptions {
        plaintext_method_powers: true,
        ..ServerOptions::default()
    })
}

#[tokio::test]
async fn test_request_reply_with_each_coder() {
    let server = start_server(powered_server()).await;
    for coder in [Coder::Binary, Coder::Json] {
        let client = Client::dial(&server.addr, &dial_options().with_coder(coder))
            .await
            .unwrap();
        assert_eq!(client.coder(), coder);
        assert!(!client.is_encrypted());
        assert!(!client.is_unix());

        let sum: i64 = client
            .request_reply("Math.Add", &Operands { a: 2, b: 3 })
            .await
            .unwrap();
        assert_eq!(sum, 5);

        let echoed: EchoResponse = client
            .request_reply(
                "Echo.Echo",
                &EchoRequest {
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(echoed.text, "hello");
        client.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_dial_prefers_binary() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();
    assert_eq!(client.coder(), Coder::Binary);
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_lookup_errors_keep_connection() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();

    let err = client.call("Nope.Method").await.unwrap_err();
    assert!(matches!(err, Error::UnknownService(ref s) if s == "Nope"), "{err}");

    let err = client.call("Math.Multiply").await.unwrap_err();
    assert!(
        matches!(err, Error::UnknownMethod { ref service, ref method }
            if service == "Math" && method == "Multiply"),
        "{err}"
    );

    let err = client.call("NoDot").await.unwrap_err();
    assert!(matches!(err, Error::MalformedServiceMethod(_)), "{err}");
    assert!(err.is_not_found());

    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_anonymous_caller_is_denied_private_methods() {
    let server = start_server(Server::new(test_registry())).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();

    let err = client
        .request_reply::<_, i64>("Math.Add", &Operands { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(err.is_access_denied(), "{err}");

    // Public methods are still callable after a denial.
    let version: String = client.request_reply("Math.Version", &()).await.unwrap();
    assert_eq!(version, "1.0");

    let metrics = server.server.registry().method_metrics("Math.Add").unwrap();
    assert_eq!(metrics.num_denied_calls, 1);
    assert_eq!(metrics.num_permitted_calls, 0);
    let metrics = server.server.registry().method_metrics("Math.Version").unwrap();
    assert_eq!(metrics.num_permitted_calls, 1);
}

#[tokio::test]
async fn test_client_can_waive_method_powers() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options().without_method_powers())
        .await
        .unwrap();
    let err = client
        .request_reply::<_, i64>("Math.Add", &Operands { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(err.is_access_denied(), "{err}");
}

#[tokio::test]
async fn test_application_error_is_returned_as_text() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();

    let err = client
        .request_reply::<_, i64>("Math.Divide", &Operands { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert!(err.is_remote(), "{err}");
    assert_eq!(err.to_string(), "division by zero");

    let quotient: i64 = client
        .request_reply("Math.Divide", &Operands { a: 9, b: 3 })
        .await
        .unwrap();
    assert_eq!(quotient, 3);

    let metrics = server.server.registry().method_metrics("Math.Divide").unwrap();
    assert_eq!(metrics.num_permitted_calls, 2);
    let failed = metrics.failed_request_reply_durations.unwrap();
    let succeeded = metrics.successful_request_reply_durations.unwrap();
    assert_eq!(failed.count, 1);
    assert_eq!(succeeded.count, 1);
}

#[tokio::test]
async fn test_handler_panic_closes_connection() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();
    let faults_before = srpc::metrics::num_handler_faults();

    let mut call = client.call("Math.Explode").await.unwrap();
    assert!(call.read_line().await.unwrap_or(None).is_none());
    drop(call);

    let err = client.ping().await.unwrap_err();
    assert!(err.is_transport(), "{err}");
    assert!(srpc::metrics::num_handler_faults() > faults_before);

    // The server keeps serving other connections.
    let other = Client::dial(&server.addr, &dial_options()).await.unwrap();
    other.ping().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let server = start_server(powered_server()).await;
    let client = Arc::new(Client::dial(&server.addr, &dial_options()).await.unwrap());
    let tasks: Vec<_> = (0..8i64)
        .map(|n| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let sum: i64 = client
                    .request_reply("Math.Add", &Operands { a: n, b: n })
                    .await
                    .unwrap();
                assert_eq!(sum, 2 * n);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_close_twice_is_fine() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();
    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(client.is_closed());
    assert!(
        eventually(|| server.server.metrics().num_open_connections() == 0).await,
        "server still counts the connection as open"
    );
}

#[tokio::test]
#[should_panic(expected = "use of closed SRPC client")]
async fn test_call_after_close_panics() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();
    client.close().await.unwrap();
    let _ = client.ping().await;
}

#[tokio::test]
async fn test_plaintext_refused_when_tls_required() {
    let server = start_server(Server::new(test_registry()).with_options(ServerOptions {
        tls_required: true,
        ..ServerOptions::default()
    }))
    .await;
    let err = Client::dial(&server.addr, &dial_options()).await.unwrap_err();
    assert!(matches!(err, Error::NoSrpcEndpoint(_)), "{err}");
    // One refusal per coder endpoint.
    assert_eq!(server.server.metrics().num_rejected_connections(), 2);
    assert_eq!(server.server.metrics().num_connections(), 2);
}

#[tokio::test]
async fn test_no_srpc_endpoint_at_plain_http_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    });
    let err = Client::dial(&addr, &dial_options()).await.unwrap_err();
    assert!(matches!(err, Error::NoSrpcEndpoint(_)), "{err}");
}

#[tokio::test]
async fn test_get_on_rpc_path_is_rejected() {
    let server = start_server(powered_server()).await;
    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    stream
        .write_all(b"GET /_SRPC_/unsecured/JSON HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let server = start_server(powered_server()).await;
    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    assert!(response.ends_with("404 page not found\n"), "{response}");
}

#[tokio::test]
async fn test_list_methods_and_hostname() {
    let server = start_server(powered_server()).await;

    let all = srpc::client::list_methods(&server.addr, false, TIMEOUT)
        .await
        .unwrap();
    assert!(all.contains(&"Math.Add".to_string()));
    assert!(all.contains(&"Echo.Ticker".to_string()));
    let mut sorted = all.clone();
    sorted.sort();
    assert_eq!(all, sorted);

    let public = srpc::client::list_methods(&server.addr, true, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(public, vec!["Echo.Echo".to_string(), "Math.Version".to_string()]);

    let hostname = srpc::client::get_hostname(&server.addr, TIMEOUT)
        .await
        .unwrap();
    assert!(!hostname.is_empty());
}

#[tokio::test]
async fn test_serve_stream_in_process() {
    let server = powered_server();
    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        serving
            .serve_stream(Box::new(server_side), Coder::Json)
            .await
    });

    let client = Client::from_stream(Box::new(client_side), Coder::Json);
    let echoed: EchoResponse = client
        .request_reply("Echo.Echo", &EchoRequest { text: "pipe".into() })
        .await
        .unwrap();
    assert_eq!(echoed.text, "pipe");

    // Plaintext powers apply to in-process callers too.
    let sum: i64 = client
        .request_reply("Math.Add", &Operands { a: 20, b: 22 })
        .await
        .unwrap();
    assert_eq!(sum, 42);

    client.close().await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(server.metrics().num_open_connections(), 0);
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_into_next_call() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        client.request_reply::<_, String>("Math.Sleep", &300u64),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(client.is_broken());

    // The late "slept" reply must never be taken as this call's answer.
    let err = client
        .request_reply::<_, String>("Math.Version", &())
        .await
        .unwrap_err();
    assert!(err.is_transport(), "{err}");
    assert!(client.ping().await.unwrap_err().is_transport());

    let fresh = Client::dial(&server.addr, &dial_options()).await.unwrap();
    let version: String = fresh.request_reply("Math.Version", &()).await.unwrap();
    assert_eq!(version, "1.0");
}

#[tokio::test]
async fn test_completed_calls_leave_client_usable() {
    let server = start_server(powered_server()).await;
    let client = Client::dial(&server.addr, &dial_options()).await.unwrap();
    let slept: String = client.request_reply("Math.Sleep", &1u64).await.unwrap();
    assert_eq!(slept, "slept 1ms");
    let err = client
        .request_reply::<_, i64>("Math.Divide", &Operands { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert!(err.is_remote(), "{err}");
    assert!(!client.is_broken());
    client.ping().await.unwrap();
}
