#![allow(dead_code)]

use futures::FutureExt;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use srpc::auth::cert::{encode_string_list, GROUP_LIST_OID_ARCS, PERMITTED_METHODS_OID_ARCS};
use srpc::{echo, DialOptions, Error, Registry, Result, Server, Service};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Operands {
    pub a: i64,
    pub b: i64,
}

/// `Math.Add`, `Math.Divide` and `Math.Sleep` need method powers,
/// `Math.Version` is public and `Math.Explode` panics.
pub fn math_service() -> Service {
    Service::new("Math")
        .request_reply("Add", |_conn, op: Operands| {
            async move { Ok(op.a + op.b) }.boxed()
        })
        .request_reply("Divide", |_conn, op: Operands| {
            async move {
                if op.b == 0 {
                    return Err(Error::Remote("division by zero".into()));
                }
                Ok(op.a / op.b)
            }
            .boxed()
        })
        .request_reply("Sleep", |_conn, millis: u64| {
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(format!("slept {millis}ms"))
            }
            .boxed()
        })
        .request_reply("Version", |_conn, _: ()| {
            async move { Ok("1.0".to_string()) }.boxed()
        })
        .raw("Explode", |_conn| async move { explode() }.boxed())
        .public(["Version"])
}

fn explode() -> Result<()> {
    panic!("handler exploded")
}

/// Registry with the echo and math services and no Unix socket upgrade.
pub fn test_registry() -> Arc<Registry> {
    let registry = Registry::with_local_upgrader(None);
    registry.register(echo::service()).unwrap();
    registry.register(math_service()).unwrap();
    Arc::new(registry)
}

pub fn dial_options() -> DialOptions {
    DialOptions::default()
        .without_local_upgrade()
        .with_timeout(TIMEOUT)
}

pub struct TestServer {
    pub addr: String,
    pub server: Server,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_server(server: Server) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    TestServer {
        addr,
        server,
        handle,
    }
}

/// Poll `check` until it holds or a couple of seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A minimal HTTP server standing in for the metadata service. Paths not in
/// `files` get a 404.
pub async fn start_metadata_server(files: Vec<(&'static str, String)>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let files = Arc::new(files);
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let files = Arc::clone(&files);
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                let mut request = String::new();
                stream.read_line(&mut request).await.unwrap();
                loop {
                    let mut header = String::new();
                    if stream.read_line(&mut header).await.unwrap() == 0 || header == "\r\n" {
                        break;
                    }
                }
                let path = request.split_whitespace().nth(1).unwrap_or("");
                let response = match files.iter().find(|(p, _)| *p == path) {
                    Some((_, body)) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    ),
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = stream.get_mut().write_all(response.as_bytes()).await;
                let _ = stream.get_mut().shutdown().await;
            });
        }
    });
    (url, handle)
}

/// A throwaway CA that issues server and client certificates.
pub struct TestCa {
    pub cert: rcgen::Certificate,
    key: KeyPair,
}

pub struct Issued {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a certificate for `username` carrying permitted-method and
    /// group extensions when given.
    pub fn issue(&self, username: &str, methods: &[&str], groups: &[&str]) -> Issued {
        let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        self.sign(params, username, methods, groups)
    }

    /// Issue a certificate that expired long ago.
    pub fn issue_expired(&self, username: &str) -> Issued {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        self.sign(params, username, &[], &[])
    }

    fn sign(
        &self,
        mut params: CertificateParams,
        username: &str,
        methods: &[&str],
        groups: &[&str],
    ) -> Issued {
        let key = KeyPair::generate().unwrap();
        params.distinguished_name.push(DnType::CommonName, username);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        if !methods.is_empty() {
            params.custom_extensions.push(CustomExtension::from_oid_content(
                &PERMITTED_METHODS_OID_ARCS,
                encode_string_list(methods).unwrap(),
            ));
        }
        if !groups.is_empty() {
            params.custom_extensions.push(CustomExtension::from_oid_content(
                &GROUP_LIST_OID_ARCS,
                encode_string_list(groups).unwrap(),
            ));
        }
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Issued {
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}
