// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service registry and method dispatcher.
//!
//! Services are plain structs. Their methods are declared on a [`Service`]
//! builder, each tagged with a calling convention:
//!
//! - **positional**: `(service, arg) -> Result<reply, err>`. The argument is
//!   decoded from the payload with the registry's [`Codec`] and the reply is
//!   encoded the same way. Used by unary calls and inter-node stream calls.
//! - **session-aware**: `(service, session, payload) -> payload`. Bytes pass
//!   through untouched. Used for calls made on behalf of an end user.
//!
//! ```ignore
//! struct Echo;
//!
//! let registry = Registry::new(Codec::MsgPack);
//! registry.register(
//!     Service::new(Echo)
//!         .method("Say", |_svc: Arc<Echo>, msg: String| async move { Ok::<_, String>(msg) }),
//! )?;
//!
//! let reply = registry.dispatch_unary("Echo.Say", payload).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use futures::FutureExt;
use gamenet_protocol::envelope::split_service_method;
use gamenet_protocol::{Codec, Session};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};

/// Boxed future returned by an erased method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;

type PositionalFn = Arc<dyn Fn(Codec, Vec<u8>) -> HandlerFuture + Send + Sync>;
type SessionFn = Arc<dyn Fn(Session, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// How a method expects to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    Positional,
    Session,
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Positional => f.write_str("positional"),
            CallingConvention::Session => f.write_str("session"),
        }
    }
}

#[derive(Clone)]
enum MethodHandler {
    Positional(PositionalFn),
    Session(SessionFn),
}

/// One registered method with its type tags.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub convention: CallingConvention,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    handler: MethodHandler,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("convention", &self.convention)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

/// A registered service: its derived name and method table.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: HashMap<String, MethodDescriptor>,
}

/// Serializable summary of a method, used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub convention: CallingConvention,
    pub arg_type: String,
    pub reply_type: String,
}

/// Serializable summary of a service, used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

impl ServiceDescriptor {
    fn info(&self) -> ServiceInfo {
        let mut methods: Vec<MethodInfo> = self
            .methods
            .values()
            .map(|m| MethodInfo {
                name: m.name.clone(),
                convention: m.convention,
                arg_type: m.arg_type.to_string(),
                reply_type: m.reply_type.to_string(),
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        ServiceInfo {
            name: self.name.clone(),
            methods,
        }
    }
}

/// Method names must look like exported identifiers: an ASCII uppercase
/// letter followed by alphanumerics or `_`.
pub fn is_exported_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Derive a service name from a type name: the last path segment with
/// generic arguments stripped. References name their referent, so `&Echo`
/// and `&mut Echo` derive `Echo`. Returns `None` for closures, tuples,
/// arrays and anything else that is not a plain identifier.
pub fn derive_service_name(type_name: &str) -> Option<&str> {
    let mut type_name = type_name;
    while let Some(rest) = type_name.strip_prefix('&') {
        type_name = rest.strip_prefix("mut ").unwrap_or(rest);
    }
    let base = match type_name.find('<') {
        Some(idx) => &type_name[..idx],
        None => type_name,
    };
    let last = base.rsplit("::").next()?;
    let mut chars = last.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    valid.then_some(last)
}

/// Builder collecting the methods of one service instance.
pub struct Service<S> {
    inner: Arc<S>,
    methods: HashMap<String, MethodDescriptor>,
}

impl<S: Send + Sync + 'static> Service<S> {
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    /// Wrap a service instance that is shared with other parts of the node.
    pub fn from_arc(service: Arc<S>) -> Self {
        Self {
            inner: service,
            methods: HashMap::new(),
        }
    }

    /// Declare a positional method.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let svc = self.inner.clone();
        let handler = Arc::new(handler);
        let erased: PositionalFn = Arc::new(move |codec: Codec, payload: Vec<u8>| {
            let svc = svc.clone();
            let handler = handler.clone();
            Box::pin(call_positional(codec, svc, handler, payload)) as HandlerFuture
        });

        self.insert(MethodDescriptor {
            name: name.to_string(),
            convention: CallingConvention::Positional,
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            handler: MethodHandler::Positional(erased),
        });
        self
    }

    /// Declare a session-aware method.
    pub fn session_method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<S>, Session, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<u8>> + Send + 'static,
    {
        let svc = self.inner.clone();
        let handler = Arc::new(handler);
        let erased: SessionFn = Arc::new(move |session: Session, payload: Vec<u8>| {
            let svc = svc.clone();
            let handler = handler.clone();
            Box::pin(async move {
                Ok::<_, RpcError>(handler(svc, session, payload).await)
            }) as HandlerFuture
        });

        self.insert(MethodDescriptor {
            name: name.to_string(),
            convention: CallingConvention::Session,
            arg_type: std::any::type_name::<Vec<u8>>(),
            reply_type: std::any::type_name::<Vec<u8>>(),
            handler: MethodHandler::Session(erased),
        });
        self
    }

    fn insert(&mut self, method: MethodDescriptor) {
        let service = std::any::type_name::<S>();
        if !is_exported_name(&method.name) {
            warn!(service, method = %method.name, "method name is not exported, skipping");
            return;
        }
        if self.methods.contains_key(&method.name) {
            // First declaration wins; a second one under the same name is
            // an overload the wire format cannot tell apart.
            warn!(service, method = %method.name, "duplicate method name, skipping");
            return;
        }
        self.methods.insert(method.name.clone(), method);
    }
}

async fn call_positional<S, A, R, E, F, Fut>(
    codec: Codec,
    svc: Arc<S>,
    handler: Arc<F>,
    payload: Vec<u8>,
) -> Result<Vec<u8>>
where
    A: DeserializeOwned,
    R: Serialize,
    E: fmt::Display,
    F: Fn(Arc<S>, A) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    let arg: A = codec.decode(&payload)?;
    match handler(svc, arg).await {
        Ok(reply) => Ok(codec.encode(&reply)?),
        Err(e) => Err(RpcError::HandlerError(e.to_string())),
    }
}

/// Table of registered services.
///
/// Reads are lock-free snapshots; registrations copy the table under a lock
/// and swap it in.
pub struct Registry {
    services: ArcSwap<HashMap<String, Arc<ServiceDescriptor>>>,
    write_lock: Mutex<()>,
    codec: Codec,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.services.load().len())
            .field("codec", &self.codec)
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Codec::default())
    }
}

impl Registry {
    pub fn new(codec: Codec) -> Self {
        Self {
            services: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            codec,
        }
    }

    /// Payload codec used for positional methods.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Register a service under the name derived from its type.
    pub fn register<S: Send + Sync + 'static>(&self, service: Service<S>) -> Result<String> {
        let type_name = std::any::type_name::<S>();
        let name = derive_service_name(type_name)
            .ok_or_else(|| RpcError::AnonymousType(type_name.to_string()))?
            .to_string();

        if service.methods.is_empty() {
            warn!(service = %name, "service has no exported methods");
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RpcError::Config("registry lock poisoned".to_string()))?;

        let current = self.services.load_full();
        if current.contains_key(&name) {
            return Err(RpcError::AlreadyRegistered(name));
        }

        let mut next = HashMap::clone(&current);
        let methods = service.methods.len();
        next.insert(
            name.clone(),
            Arc::new(ServiceDescriptor {
                name: name.clone(),
                methods: service.methods,
            }),
        );
        self.services.store(Arc::new(next));

        info!(service = %name, methods, "service registered");
        Ok(name)
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.load().get(name).cloned()
    }

    /// List every registered service, sorted by name.
    pub fn services(&self) -> Vec<ServiceInfo> {
        let mut list: Vec<ServiceInfo> = self.services.load().values().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    fn lookup(&self, service_method: &str) -> Result<MethodDescriptor> {
        let (service, method) = split_service_method(service_method)
            .ok_or_else(|| RpcError::NotFound(format!("malformed method '{service_method}'")))?;
        let services = self.services.load();
        let svc = services
            .get(service)
            .ok_or_else(|| RpcError::NotFound(format!("service '{service}'")))?;
        svc.methods
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("method '{service_method}'")))
    }

    /// Invoke a positional method.
    pub async fn dispatch_unary(&self, service_method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let method = self.lookup(service_method)?;
        let MethodHandler::Positional(handler) = method.handler else {
            return Err(RpcError::NotFound(format!(
                "method '{service_method}' is session-aware"
            )));
        };
        debug!(method = service_method, "dispatching positional call");
        guard_panics(service_method, handler(self.codec, payload)).await
    }

    /// Invoke a session-aware method on behalf of `session`.
    pub async fn dispatch_stream(
        &self,
        service_method: &str,
        payload: Vec<u8>,
        session: Session,
    ) -> Result<Vec<u8>> {
        let method = self.lookup(service_method)?;
        let MethodHandler::Session(handler) = method.handler else {
            return Err(RpcError::NotFound(format!(
                "method '{service_method}' is positional"
            )));
        };
        debug!(
            method = service_method,
            user_id = session.user_id,
            "dispatching session call"
        );
        guard_panics(service_method, handler(session, payload)).await
    }
}

async fn guard_panics(service_method: &str, fut: HandlerFuture) -> Result<Vec<u8>> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("handler panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("handler panicked: {s}")
            } else {
                "handler panicked".to_string()
            };
            warn!(method = service_method, "{}", message);
            Err(RpcError::HandlerError(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Echo;

    struct Lobby {
        capacity: u32,
    }

    struct Wrapper<T>(#[allow(dead_code)] T);

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct JoinReq {
        room: String,
        players: u32,
    }

    fn echo_service() -> Service<Echo> {
        Service::new(Echo)
            .method("Say", |_svc: Arc<Echo>, msg: String| async move {
                Ok::<_, String>(msg)
            })
            .method("Fail", |_svc: Arc<Echo>, _msg: String| async move {
                Err::<String, _>("nope")
            })
            .method("Panic", |_svc: Arc<Echo>, _msg: String| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<String, String>(String::new())
            })
            .session_method("Whoami", |_svc: Arc<Echo>, session: Session, _p: Vec<u8>| async move {
                session.user_id.to_string().into_bytes()
            })
    }

    #[test]
    fn test_derive_service_name() {
        assert_eq!(derive_service_name("my_game::services::Echo"), Some("Echo"));
        assert_eq!(derive_service_name("Echo"), Some("Echo"));
        assert_eq!(
            derive_service_name("my_game::Wrapper<alloc::string::String>"),
            Some("Wrapper")
        );
        assert_eq!(derive_service_name("()"), None);
        assert_eq!(derive_service_name("(u32, u8)"), None);
        assert_eq!(derive_service_name("my_game::main::{{closure}}"), None);
        assert_eq!(derive_service_name("&my_game::Echo"), Some("Echo"));
        assert_eq!(derive_service_name("&mut my_game::Echo"), Some("Echo"));
        assert_eq!(derive_service_name("&[u8]"), None);
    }

    #[test]
    fn test_exported_names() {
        assert!(is_exported_name("Say"));
        assert!(is_exported_name("Get_2"));
        assert!(!is_exported_name("say"));
        assert!(!is_exported_name("_Say"));
        assert!(!is_exported_name(""));
        assert!(!is_exported_name("Sa-y"));
    }

    #[tokio::test]
    async fn test_positional_dispatch() {
        let registry = Registry::new(Codec::MsgPack);
        registry.register(echo_service()).unwrap();

        let payload = Codec::MsgPack.encode("hello").unwrap();
        let reply = registry.dispatch_unary("Echo.Say", payload).await.unwrap();
        let reply: String = Codec::MsgPack.decode(&reply).unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn test_positional_dispatch_with_state_and_struct_arg() {
        let registry = Registry::new(Codec::Json);
        registry
            .register(Service::new(Lobby { capacity: 4 }).method(
                "Join",
                |svc: Arc<Lobby>, req: JoinReq| async move {
                    if req.players > svc.capacity {
                        Err(format!("room {} is full", req.room))
                    } else {
                        Ok(svc.capacity - req.players)
                    }
                },
            ))
            .unwrap();

        let ok = Codec::Json
            .encode(&JoinReq {
                room: "r1".into(),
                players: 3,
            })
            .unwrap();
        let left = registry.dispatch_unary("Lobby.Join", ok).await.unwrap();
        assert_eq!(left, b"1");

        let full = Codec::Json
            .encode(&JoinReq {
                room: "r2".into(),
                players: 9,
            })
            .unwrap();
        let err = registry.dispatch_unary("Lobby.Join", full).await.unwrap_err();
        assert_eq!(err, RpcError::HandlerError("room r2 is full".into()));
    }

    #[tokio::test]
    async fn test_unknown_targets_are_not_found() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();

        for target in ["Echo.Unknown", "Nope.Say", "EchoSay", ".Say"] {
            let err = registry.dispatch_unary(target, vec![]).await.unwrap_err();
            assert!(matches!(err, RpcError::NotFound(_)), "{target}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_handler_error_and_decode_failure() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();

        let payload = Codec::MsgPack.encode("x").unwrap();
        let err = registry.dispatch_unary("Echo.Fail", payload).await.unwrap_err();
        assert_eq!(err, RpcError::HandlerError("nope".into()));

        let err = registry
            .dispatch_unary("Echo.Say", vec![0xc1])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DecodeFailure(_)));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_handler_error() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();

        let payload = Codec::MsgPack.encode("x").unwrap();
        let err = registry.dispatch_unary("Echo.Panic", payload).await.unwrap_err();
        match err {
            RpcError::HandlerError(msg) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected: {other:?}"),
        }

        // The registry still works afterwards
        let payload = Codec::MsgPack.encode("again").unwrap();
        assert!(registry.dispatch_unary("Echo.Say", payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_dispatch_passes_bytes_through() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();

        let reply = registry
            .dispatch_stream("Echo.Whoami", b"ignored".to_vec(), Session::new(123321))
            .await
            .unwrap();
        assert_eq!(reply, b"123321");
    }

    #[tokio::test]
    async fn test_convention_mismatch_is_not_found() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();

        let err = registry
            .dispatch_stream("Echo.Say", vec![], Session::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));

        let err = registry.dispatch_unary("Echo.Whoami", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_registration_leaves_table_unchanged() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();
        let before = registry.services();

        let err = registry
            .register(Service::new(Echo).method("Other", |_s: Arc<Echo>, x: u32| async move {
                Ok::<_, String>(x)
            }))
            .unwrap_err();
        assert_eq!(err, RpcError::AlreadyRegistered("Echo".into()));
        assert_eq!(registry.services(), before);
    }

    #[test]
    fn test_anonymous_types_rejected() {
        let registry = Registry::default();
        let err = registry.register(Service::new(())).unwrap_err();
        assert!(matches!(err, RpcError::AnonymousType(_)));

        let err = registry.register(Service::new((1u8, 2u8))).unwrap_err();
        assert!(matches!(err, RpcError::AnonymousType(_)));
        assert!(registry.services().is_empty());
    }

    #[test]
    fn test_generic_service_name_is_stripped() {
        let registry = Registry::default();
        let name = registry
            .register(Service::new(Wrapper(5u8)).method(
                "Get",
                |_s: Arc<Wrapper<u8>>, _x: ()| async move { Ok::<_, String>(1u8) },
            ))
            .unwrap();
        assert_eq!(name, "Wrapper");
    }

    #[test]
    fn test_unexported_and_duplicate_methods_skipped() {
        let service = Service::new(Echo)
            .method("say", |_s: Arc<Echo>, x: u32| async move { Ok::<_, String>(x) })
            .method("Say", |_s: Arc<Echo>, x: u32| async move { Ok::<_, String>(x) })
            .method("Say", |_s: Arc<Echo>, x: String| async move { Ok::<_, String>(x) });

        let registry = Registry::default();
        registry.register(service).unwrap();
        let listed = registry.services();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].methods.len(), 1);
        assert_eq!(listed[0].methods[0].name, "Say");
        assert_eq!(listed[0].methods[0].arg_type, "u32");
    }

    #[test]
    fn test_services_listing_serializes() {
        let registry = Registry::default();
        registry.register(echo_service()).unwrap();

        let json = serde_json::to_value(registry.services()).unwrap();
        assert_eq!(json[0]["name"], "Echo");
        let names: Vec<&str> = json[0]["methods"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Fail", "Panic", "Say", "Whoami"]);
        assert_eq!(json[0]["methods"][3]["convention"], "session");
    }
}
