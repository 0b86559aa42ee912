//! Service registration and method lookup.
//!
//! A service is a named set of methods, each registered explicitly as one of
//! three call kinds:
//!
//! - **raw**: the handler gets the connection and owns the wire format
//!   after the acknowledgement (streaming methods)
//! - **coder**: like raw, but the bound [`Coder`] is handed over explicitly
//! - **request/reply**: the framework decodes one request, runs the handler
//!   and encodes the reply
//!
//! # Example
//!
//! ```ignore
//! let registry = Registry::new();
//! registry.register(
//!     Service::new("Echo")
//!         .request_reply("Echo", |_conn, req: EchoRequest| {
//!             async move { Ok(EchoResponse { text: req.text }) }.boxed()
//!         })
//!         .public(["Echo"]),
//! )?;
//! ```

use crate::auth::AuthInformation;
use crate::coder::Coder;
use crate::conn::{Conn, ReleaseFn};
use crate::error::{Error, Result};
use crate::local::{self, LocalUpgrader};
use crate::metrics::{MethodMetrics, MethodMetricsSnapshot};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Handler for a raw method.
pub type RawHandler =
    Arc<dyn for<'a> Fn(&'a mut Conn) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Handler for a coder method.
pub type CoderHandler =
    Arc<dyn for<'a> Fn(&'a mut Conn, Coder) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Call convention of a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    Raw,
    Coder,
    RequestReply,
}

/// Service-supplied authorization hooks.
pub trait AccessControl: Send + Sync {
    /// Decide a call the built-in checks did not already permit.
    /// `service_method` is the full `Service.Method` name.
    fn grant_method(&self, _service_method: &str, _auth: &AuthInformation) -> bool {
        false
    }

    /// Runs after authorization and before the handler. An error aborts the
    /// call; a returned release function runs once the call completes.
    fn block_method(&self, _method: &str, _auth: &AuthInformation) -> Result<Option<ReleaseFn>> {
        Ok(None)
    }
}

/// Grants nothing beyond the built-in checks and public methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAccess;

impl AccessControl for DefaultAccess {}

/// Grants every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn grant_method(&self, _service_method: &str, _auth: &AuthInformation) -> bool {
        true
    }
}

trait RequestReplyHandler: Send + Sync {
    fn call<'a>(&'a self, conn: &'a mut Conn, metrics: &'a MethodMetrics)
        -> BoxFuture<'a, Result<()>>;
}

struct TypedRequestReply<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> RequestReplyHandler for TypedRequestReply<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: for<'a> Fn(&'a mut Conn, Req) -> BoxFuture<'a, Result<Resp>> + Send + Sync,
{
    fn call<'a>(
        &'a self,
        conn: &'a mut Conn,
        metrics: &'a MethodMetrics,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request: Req = match conn.decode().await {
                Ok(request) => request,
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => return conn.write_error(&err).await,
            };
            let start = Instant::now();
            let outcome = (self.handler)(&mut *conn, request).await;
            metrics.record_handler(start.elapsed(), outcome.is_ok());
            let frame = outcome.and_then(|response| conn.coder().to_frame(&response));
            match frame {
                Ok(frame) => {
                    conn.write_line("").await?;
                    conn.write_frame(&frame).await
                }
                Err(err) => conn.write_error(&err).await,
            }
        })
    }
}

enum Handler {
    Raw(RawHandler),
    Coder(CoderHandler),
    RequestReply(Box<dyn RequestReplyHandler>),
}

/// One registered method.
pub struct MethodDescriptor {
    name: String,
    kind: MethodKind,
    public: bool,
    request_type: Option<&'static str>,
    response_type: Option<&'static str>,
    handler: Handler,
    metrics: MethodMetrics,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    /// Request and response type names for request/reply methods.
    pub fn types(&self) -> Option<(&'static str, &'static str)> {
        self.request_type.zip(self.response_type)
    }

    pub fn metrics(&self) -> &MethodMetrics {
        &self.metrics
    }

    /// Run the handler, recording the call's duration.
    pub(crate) async fn invoke(&self, conn: &mut Conn) -> Result<()> {
        self.metrics.record_permitted();
        let start = Instant::now();
        let result = match &self.handler {
            Handler::Raw(handler) => handler(conn).await,
            Handler::Coder(handler) => {
                let coder = conn.coder();
                handler(conn, coder).await
            }
            Handler::RequestReply(handler) => handler.call(conn, &self.metrics).await,
        };
        self.metrics.record_call(start.elapsed(), result.is_ok());
        result
    }
}

/// Builder for a service prior to registration.
pub struct Service {
    name: String,
    methods: Vec<MethodDescriptor>,
    public: BTreeSet<String>,
    access: Arc<dyn AccessControl>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            public: BTreeSet::new(),
            access: Arc::new(DefaultAccess),
        }
    }

    fn push(mut self, name: &str, kind: MethodKind, handler: Handler) -> Self {
        self.push_typed(name, kind, handler, None);
        self
    }

    fn push_typed(
        &mut self,
        name: &str,
        kind: MethodKind,
        handler: Handler,
        types: Option<(&'static str, &'static str)>,
    ) {
        self.methods.retain(|m| m.name != name);
        self.methods.push(MethodDescriptor {
            name: name.to_string(),
            kind,
            public: false,
            request_type: types.map(|t| t.0),
            response_type: types.map(|t| t.1),
            handler,
            metrics: MethodMetrics::new(kind == MethodKind::RequestReply),
        });
    }

    /// Add a raw method.
    pub fn raw<F>(self, name: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Conn) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.push(name, MethodKind::Raw, Handler::Raw(Arc::new(handler)))
    }

    /// Add a coder method.
    pub fn coder<F>(self, name: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Conn, Coder) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.push(name, MethodKind::Coder, Handler::Coder(Arc::new(handler)))
    }

    /// Add a request/reply method.
    pub fn request_reply<Req, Resp, F>(mut self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: for<'a> Fn(&'a mut Conn, Req) -> BoxFuture<'a, Result<Resp>> + Send + Sync + 'static,
    {
        let erased = TypedRequestReply {
            handler,
            _types: PhantomData::<fn(Req) -> Resp>,
        };
        self.push_typed(
            name,
            MethodKind::RequestReply,
            Handler::RequestReply(Box::new(erased)),
            Some((std::any::type_name::<Req>(), std::any::type_name::<Resp>())),
        );
        self
    }

    /// Mark methods callable by anyone. Names without a method are ignored.
    pub fn public<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public.extend(names.into_iter().map(Into::into));
        self
    }

    /// Install grant and block hooks.
    pub fn access_control<A: AccessControl + 'static>(mut self, access: A) -> Self {
        self.access = Arc::new(access);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A registered service.
pub struct ServiceEntry {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
    access: Arc<dyn AccessControl>,
}

impl ServiceEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> &dyn AccessControl {
        self.access.as_ref()
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }
}

/// Table of services served by one server.
pub struct Registry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    upgrader: Option<Arc<LocalUpgrader>>,
}

impl Registry {
    /// Create a registry whose built-in service offers the Unix socket
    /// upgrade at the path configured in the environment.
    pub fn new() -> Self {
        Self::with_local_upgrader(LocalUpgrader::from_env().map(Arc::new))
    }

    /// Create a registry with an explicit upgrader, or none to refuse every
    /// upgrade request.
    pub fn with_local_upgrader(upgrader: Option<Arc<LocalUpgrader>>) -> Self {
        let registry = Self {
            services: RwLock::new(HashMap::new()),
            upgrader: upgrader.clone(),
        };
        let builtin = local::builtin_service(upgrader);
        registry.services.write().insert(
            builtin.name.clone(),
            Arc::new(Self::into_entry(builtin)),
        );
        registry
    }

    pub fn local_upgrader(&self) -> Option<&Arc<LocalUpgrader>> {
        self.upgrader.as_ref()
    }

    fn into_entry(service: Service) -> ServiceEntry {
        let Service {
            name,
            methods,
            public,
            access,
        } = service;
        let methods = methods
            .into_iter()
            .map(|mut method| {
                method.public = public.contains(&method.name);
                (method.name.clone(), Arc::new(method))
            })
            .collect();
        ServiceEntry {
            name,
            methods,
            access,
        }
    }

    /// Register a service. Fails if the name is taken.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write();
        if services.contains_key(&service.name) {
            return Err(Error::AlreadyRegistered(service.name));
        }
        debug!(
            service = %service.name,
            methods = service.methods.len(),
            "registered service"
        );
        let entry = Self::into_entry(service);
        services.insert(entry.name.clone(), Arc::new(entry));
        Ok(())
    }

    /// Resolve `Service.Method`.
    pub fn lookup(
        &self,
        service_method: &str,
    ) -> Result<(Arc<ServiceEntry>, Arc<MethodDescriptor>)> {
        let mut parts = service_method.split('.');
        let (Some(service_name), Some(method_name), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedServiceMethod(service_method.to_string()));
        };
        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::UnknownService(service_name.to_string()))?;
        let method = service
            .methods
            .get(method_name)
            .cloned()
            .ok_or_else(|| Error::UnknownMethod {
                service: service_name.to_string(),
                method: method_name.to_string(),
            })?;
        Ok((service, method))
    }

    /// Sorted `Service.Method` names, optionally only public ones.
    pub fn list_methods(&self, public_only: bool) -> Vec<String> {
        let services = self.services.read();
        let mut names: Vec<String> = services
            .values()
            .flat_map(|service| {
                service
                    .methods
                    .values()
                    .filter(move |m| !public_only || m.public)
                    .map(move |m| format!("{}.{}", service.name, m.name))
            })
            .collect();
        names.sort();
        names
    }

    pub fn method_metrics(&self, service_method: &str) -> Option<MethodMetricsSnapshot> {
        self.lookup(service_method)
            .ok()
            .map(|(_, method)| method.metrics.snapshot())
    }

    /// Metrics for every method, keyed by `Service.Method`.
    pub fn metrics_snapshot(&self) -> BTreeMap<String, MethodMetricsSnapshot> {
        let services = self.services.read();
        services
            .values()
            .flat_map(|service| {
                service.methods.values().map(move |m| {
                    (format!("{}.{}", service.name, m.name), m.metrics.snapshot())
                })
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn echo_service() -> Service {
        Service::new("Echo")
            .request_reply("Echo", |_conn, req: String| async move { Ok(req) }.boxed())
            .raw("Stream", |_conn| async { Ok(()) }.boxed())
            .coder("Coded", |_conn, _coder| async { Ok(()) }.boxed())
            .public(["Echo", "Missing"])
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = Registry::with_local_upgrader(None);
        registry.register(echo_service()).unwrap();
        let err = registry.register(echo_service()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(ref name) if name == "Echo"));
    }

    #[test]
    fn test_lookup_errors() {
        let registry = Registry::with_local_upgrader(None);
        registry.register(echo_service()).unwrap();
        assert!(matches!(
            registry.lookup("Echo"),
            Err(Error::MalformedServiceMethod(_))
        ));
        assert!(matches!(
            registry.lookup("Echo.Echo.Echo"),
            Err(Error::MalformedServiceMethod(_))
        ));
        assert!(matches!(registry.lookup("Nope.Echo"), Err(Error::UnknownService(_))));
        let err = registry.lookup("Echo.Nope").err().unwrap();
        assert_eq!(err.to_string(), "Echo: unknown method: Nope");
    }

    #[test]
    fn test_kinds_and_public_flags() {
        let registry = Registry::with_local_upgrader(None);
        registry.register(echo_service()).unwrap();
        let (_, echo) = registry.lookup("Echo.Echo").unwrap();
        assert_eq!(echo.kind(), MethodKind::RequestReply);
        assert!(echo.is_public());
        assert_eq!(
            echo.types(),
            Some((std::any::type_name::<String>(), std::any::type_name::<String>()))
        );
        let (_, stream) = registry.lookup("Echo.Stream").unwrap();
        assert_eq!(stream.kind(), MethodKind::Raw);
        assert!(!stream.is_public());
        assert!(stream.types().is_none());
        let (_, coded) = registry.lookup("Echo.Coded").unwrap();
        assert_eq!(coded.kind(), MethodKind::Coder);
    }

    #[test]
    fn test_list_methods_sorted() {
        let registry = Registry::with_local_upgrader(None);
        registry.register(echo_service()).unwrap();
        assert_eq!(
            registry.list_methods(false),
            vec![
                ".LocalUpgradeToUnix".to_string(),
                "Echo.Coded".to_string(),
                "Echo.Echo".to_string(),
                "Echo.Stream".to_string(),
            ]
        );
        assert_eq!(registry.list_methods(true), vec!["Echo.Echo".to_string()]);
    }

    #[test]
    fn test_descriptor_debug_names_method() {
        let registry = Registry::with_local_upgrader(None);
        registry.register(echo_service()).unwrap();
        let (_, method) = registry.lookup("Echo.Stream").unwrap();
        let text = format!("{method:?}");
        assert!(text.contains("\"Stream\""), "{text}");
        assert!(text.contains("Raw"), "{text}");
    }

    #[tokio::test]
    async fn test_multiline_handler_error_is_one_status_line() {
        let registry = Registry::with_local_upgrader(None);
        registry
            .register(Service::new("Fail").request_reply("Now", |_conn, _: u8| {
                async move { Err::<u8, _>(Error::Remote("first\nsecond".into())) }.boxed()
            }))
            .unwrap();
        let (_, method) = registry.lookup("Fail.Now").unwrap();

        let (server, client) = tokio::io::duplex(1024);
        let mut server = Conn::new(Box::new(server), Coder::Json);
        let mut client = Conn::new(Box::new(client), Coder::Json);
        client.encode(&1u8).await.unwrap();
        client.flush().await.unwrap();
        method.invoke(&mut server).await.unwrap();
        server.write_line("").await.unwrap();
        server.flush().await.unwrap();

        assert_eq!(
            client.read_line().await.unwrap().as_deref(),
            Some("first second")
        );
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_unsync_response_is_served() {
        let registry = Registry::with_local_upgrader(None);
        registry
            .register(Service::new("Cell").request_reply("Get", |_conn, n: u32| {
                async move { Ok(std::cell::Cell::new(n * 2)) }.boxed()
            }))
            .unwrap();
        let (_, method) = registry.lookup("Cell.Get").unwrap();

        let (server, client) = tokio::io::duplex(1024);
        let mut server = Conn::new(Box::new(server), Coder::Binary);
        let mut client = Conn::new(Box::new(client), Coder::Binary);
        client.encode(&21u32).await.unwrap();
        client.flush().await.unwrap();
        method.invoke(&mut server).await.unwrap();
        server.flush().await.unwrap();

        assert_eq!(client.read_line().await.unwrap().as_deref(), Some(""));
        let doubled: u32 = client.decode().await.unwrap();
        assert_eq!(doubled, 42);
    }

    #[test]
    fn test_builtin_service_grants_everything() {
        let registry = Registry::with_local_upgrader(None);
        let (service, method) = registry.lookup(".LocalUpgradeToUnix").unwrap();
        assert!(service
            .access()
            .grant_method(".LocalUpgradeToUnix", &AuthInformation::anonymous()));
        assert_eq!(method.kind(), MethodKind::Raw);
    }
}
