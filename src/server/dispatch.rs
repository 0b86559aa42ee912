//! Per-connection call loop.

use crate::auth::OwnerAllowlist;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::{MethodDescriptor, Registry};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Serve calls on `conn` until the peer goes away, a handler asks to close,
/// or a handler fails in a way that leaves the stream unusable.
pub(crate) async fn serve_calls(
    registry: &Registry,
    owners: Option<&OwnerAllowlist>,
    conn: &mut Conn,
) -> Result<()> {
    let result = call_loop(registry, owners, conn).await;
    conn.call_release();
    if result.is_ok() {
        let _ = conn.flush().await;
    }
    result
}

async fn call_loop(
    registry: &Registry,
    owners: Option<&OwnerAllowlist>,
    conn: &mut Conn,
) -> Result<()> {
    loop {
        conn.call_release();
        conn.flush().await?;
        let line = match conn.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) if e.is_transport() => {
                debug!(remote = ?conn.remote_addr(), "error reading call: {}", e);
                return Ok(());
            }
            Err(e) => {
                conn.write_error(&e).await?;
                continue;
            }
        };
        let service_method = line.trim();
        if service_method.is_empty() {
            // Ping.
            conn.write_line("").await?;
            continue;
        }
        let method = match authorize(registry, owners, conn, service_method) {
            Ok(method) => method,
            Err(e) => {
                trace!(method = %service_method, "call refused: {}", e);
                conn.write_error(&e).await?;
                continue;
            }
        };
        conn.write_line("").await?;
        conn.flush().await?;
        match AssertUnwindSafe(method.invoke(conn)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(Error::CloseClient)) => {
                debug!(method = %service_method, "handler closed connection");
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(method = %service_method, "handler terminated connection: {}", e);
                return Err(e);
            }
            Err(panic) => {
                metrics::record_handler_fault();
                let message = panic_message(panic.as_ref());
                error!(
                    method = %service_method,
                    username = %conn.username(),
                    "handler panicked: {}",
                    message
                );
                return Err(Error::HandlerFault(message));
            }
        }
    }
}

/// Resolve a call and decide whether the caller may make it.
///
/// Certificate method powers and owner membership are checked first, then
/// the service's grant hook. Public methods run even when both say no, with
/// `have_method_access` left false so the handler can tell.
fn authorize(
    registry: &Registry,
    owners: Option<&OwnerAllowlist>,
    conn: &mut Conn,
    service_method: &str,
) -> Result<Arc<MethodDescriptor>> {
    let (service, method) = registry.lookup(service_method)?;
    let auth = conn.auth_information();
    let built_in = conn.permitted_methods().allows(service_method)
        || (!auth.is_anonymous() && owners.is_some_and(|owners| owners.admits(auth)));
    let granted = built_in || service.access().grant_method(service_method, auth);
    conn.set_have_method_access(granted);
    if !granted && !method.is_public() {
        method.metrics().record_denied();
        return Err(Error::AccessDenied);
    }
    let release = service
        .access()
        .block_method(method.name(), conn.auth_information())?;
    conn.set_release(release);
    Ok(method)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthInformation, OwnerSet, PermittedMethods};
    use crate::coder::Coder;
    use crate::registry::{AccessControl, Service};
    use std::collections::BTreeSet;
    use tokio::io::duplex;

    struct GrantEcho;

    impl AccessControl for GrantEcho {
        fn grant_method(&self, service_method: &str, _auth: &AuthInformation) -> bool {
            service_method == "Guarded.Granted"
        }

        fn block_method(
            &self,
            method: &str,
            _auth: &AuthInformation,
        ) -> Result<Option<crate::conn::ReleaseFn>> {
            if method == "Blocked" {
                return Err(Error::Remote("busy\ntry later".into()));
            }
            Ok(None)
        }
    }

    fn registry() -> Registry {
        let registry = Registry::with_local_upgrader(None);
        registry
            .register(
                Service::new("Guarded")
                    .request_reply("Granted", |_conn, n: u32| async move { Ok(n) }.boxed())
                    .request_reply("Private", |_conn, n: u32| async move { Ok(n) }.boxed())
                    .request_reply("Blocked", |_conn, n: u32| async move { Ok(n) }.boxed())
                    .request_reply("Public", |conn, _n: u32| {
                        async move { Ok(conn.auth_information().have_method_access) }.boxed()
                    })
                    .public(["Public", "Blocked"])
                    .access_control(GrantEcho),
            )
            .unwrap();
        registry
    }

    fn conn(permitted: PermittedMethods, username: &str) -> Conn {
        let (a, _b) = duplex(64);
        let auth = AuthInformation {
            username: username.to_string(),
            group_list: BTreeSet::from(["ops".to_string()]),
            have_method_access: false,
        };
        Conn::new(Box::new(a), Coder::Json).with_identity(auth, permitted)
    }

    #[test]
    fn test_authorize_order() {
        let registry = registry();

        let mut anonymous = conn(PermittedMethods::none(), "");
        assert!(matches!(
            authorize(&registry, None, &mut anonymous, "Guarded.Private"),
            Err(Error::AccessDenied)
        ));
        assert!(authorize(&registry, None, &mut anonymous, "Guarded.Granted").is_ok());
        assert!(anonymous.auth_information().have_method_access);
        assert!(authorize(&registry, None, &mut anonymous, "Guarded.Public").is_ok());
        assert!(!anonymous.auth_information().have_method_access);

        let mut powered = conn(PermittedMethods::from_patterns(["Guarded.*"]), "alice");
        assert!(authorize(&registry, None, &mut powered, "Guarded.Private").is_ok());
        assert!(powered.auth_information().have_method_access);

        let (_, private) = registry.lookup("Guarded.Private").unwrap();
        assert_eq!(private.metrics().num_denied_calls(), 1);
    }

    #[test]
    fn test_owners_grant_named_callers_only() {
        let registry = registry();
        let owners = OwnerAllowlist::new();
        owners.set(Some(OwnerSet {
            users: BTreeSet::new(),
            groups: BTreeSet::from(["ops".to_string()]),
        }));

        let mut member = conn(PermittedMethods::none(), "bob");
        assert!(authorize(&registry, Some(&owners), &mut member, "Guarded.Private").is_ok());

        let mut anonymous = conn(PermittedMethods::none(), "");
        assert!(authorize(&registry, Some(&owners), &mut anonymous, "Guarded.Private").is_err());
    }

    #[test]
    fn test_block_hook_error_is_returned() {
        let registry = registry();
        let mut caller = conn(PermittedMethods::Unrestricted, "alice");
        let err = authorize(&registry, None, &mut caller, "Guarded.Blocked").unwrap_err();
        assert_eq!(err.to_string(), "busy\ntry later");
    }

    #[tokio::test]
    async fn test_bad_lines_get_one_reply_each() {
        let registry = Arc::new(registry());
        let (server, client) = duplex(1 << 20);
        let mut server = Conn::new(Box::new(server), Coder::Json)
            .with_identity(AuthInformation::anonymous(), PermittedMethods::Unrestricted);
        let serving = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { serve_calls(&registry, None, &mut server).await })
        };

        let mut client = Conn::new(Box::new(client), Coder::Json);
        client.write_line(&"Guarded.".repeat(20_000)).await.unwrap();
        client.write_line("Guarded.Blocked").await.unwrap();
        client.write_line("").await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(
            client.read_line().await.unwrap().as_deref(),
            Some("decode error: line too long")
        );
        assert_eq!(
            client.read_line().await.unwrap().as_deref(),
            Some("busy try later")
        );
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some(""));
        drop(client);
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
