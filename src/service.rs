//! Services and the method tables behind them.
//!
//! A receiver declares its callable methods into a [MethodTable]; for every
//! method the table captures a pair of closures — decode-the-argument and
//! invoke-then-encode-the-reply — so dispatch needs no type information at
//! runtime. The [ServiceBuilder] turns one receiver into one [Service] per
//! method, with the path composed from lowercased name segments.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use courier_rpc_core::error::{ErrorKind, RpcError};
use courier_rpc_core::uri::{UriFormat, UrlFormat};
use courier_rpc_core::Codec;

use crate::plugin::ServerPluginContainer;

/// Future of one service-method invocation, resolving to the encoded reply
/// body or the error to put on the response header.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send>>;

type DecodeArgFn<C> = Box<dyn Fn(&C, &[u8]) -> Result<Box<dyn Any + Send>, ()> + Send + Sync>;
type InvokeFn<C> = Box<dyn Fn(Box<dyn Any + Send>, Arc<C>) -> MethodFuture + Send + Sync>;

/// A receiver that can be registered with the server.
///
/// `methods` is called once per registration to declare the callable
/// methods; a receiver declaring none is rejected by the builder.
pub trait RpcService<C: Codec>: Send + Sync + Sized + 'static {
    /// Default registration name, lowercased into the path.
    fn service_name(&self) -> &'static str;

    fn methods(table: &mut MethodTable<Self, C>);
}

/// Per-registration collection of method handlers for one receiver.
pub struct MethodTable<S, C: Codec> {
    receiver: Arc<S>,
    entries: Vec<MethodEntry<C>>,
}

struct MethodEntry<C: Codec> {
    name: String,
    decode_arg: DecodeArgFn<C>,
    invoke: InvokeFn<C>,
}

impl<S: Send + Sync + 'static, C: Codec> MethodTable<S, C> {
    fn new(receiver: Arc<S>) -> Self {
        Self { receiver, entries: Vec::new() }
    }

    /// Declare one method. The handler gets the receiver and the decoded
    /// argument, and returns the reply or a displayable error. Panics
    /// inside the handler are caught and converted into error responses.
    pub fn method<A, R, E, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let decode_arg: DecodeArgFn<C> = Box::new(|codec: &C, buf: &[u8]| {
            let args: A = codec.decode(buf)?;
            Ok(Box::new(args) as Box<dyn Any + Send>)
        });
        let receiver = self.receiver.clone();
        let invoke: InvokeFn<C> = Box::new(move |argv: Box<dyn Any + Send>, codec: Arc<C>| {
            // pairs with the decoder above, the downcast cannot fail
            let args = *argv.downcast::<A>().expect("argument type");
            let receiver = receiver.clone();
            let f = f.clone();
            Box::pin(async move {
                let call = AssertUnwindSafe(async move { f(receiver, args).await }).catch_unwind();
                match call.await {
                    Ok(Ok(reply)) => match codec.encode(&reply) {
                        Ok(body) => Ok(body),
                        Err(()) => {
                            Err(RpcError::new(ErrorKind::Application, "reply encode error"))
                        }
                    },
                    Ok(Err(e)) => Err(RpcError::new(ErrorKind::Application, e.to_string())),
                    Err(p) => Err(RpcError::new(
                        ErrorKind::Application,
                        format!("service method panic: {}", panic_message(p)),
                    )),
                }
            })
        });
        self.entries.push(MethodEntry { name: name.to_string(), decode_arg, invoke });
        self
    }
}

fn panic_message(p: Box<dyn Any + Send>) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = p.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

/// One routable method: its path, its scoped plugins, and the dispatch
/// closures captured at registration.
pub struct Service<C: Codec> {
    path: String,
    plugins: ServerPluginContainer,
    decode_arg: DecodeArgFn<C>,
    invoke: InvokeFn<C>,
}

impl<C: Codec> Service<C> {
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub(crate) fn plugins(&self) -> &ServerPluginContainer {
        &self.plugins
    }

    pub(crate) fn set_plugins(&mut self, plugins: ServerPluginContainer) {
        self.plugins = plugins;
    }

    /// Decode the request body into this method's argument type.
    pub(crate) fn decode_arg(&self, codec: &C, body: &[u8]) -> Result<Box<dyn Any + Send>, ()> {
        (self.decode_arg)(codec, body)
    }

    /// Run the method. The returned future never panics outward; handler
    /// failures of any shape come back as the error of the future.
    pub(crate) fn invoke(&self, argv: Box<dyn Any + Send>, codec: Arc<C>) -> MethodFuture {
        (self.invoke)(argv, codec)
    }
}

impl<C: Codec> fmt::Debug for Service<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "service {}", self.path)
    }
}

/// Builds [Service] values from a receiver and owns the URI format used for
/// path composition and request parsing.
pub struct ServiceBuilder {
    format: Arc<dyn UriFormat>,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self { format: Arc::new(UrlFormat) }
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: Arc<dyn UriFormat>) -> Self {
        Self { format }
    }

    #[inline]
    pub fn format(&self) -> &Arc<dyn UriFormat> {
        &self.format
    }

    /// One service per declared method, at
    /// `/<prefix..>/<name>/<method>`, all segments lowercased.
    pub fn build<C, S>(
        &self, name: &str, receiver: Arc<S>, prefixes: &[&str],
    ) -> Result<Vec<Service<C>>, RpcError>
    where
        C: Codec,
        S: RpcService<C>,
    {
        let mut table = MethodTable::new(receiver);
        S::methods(&mut table);
        if table.entries.is_empty() {
            return Err(RpcError::new(
                ErrorKind::Application,
                format!("can not register invalid service '{}': no methods declared", name),
            ));
        }
        let mut services = Vec::with_capacity(table.entries.len());
        for entry in table.entries {
            let mut segments: Vec<&str> = prefixes.to_vec();
            segments.push(name);
            segments.push(&entry.name);
            let path = self.format.join(&segments)?;
            trace!("built service {}", path);
            services.push(Service {
                path,
                plugins: ServerPluginContainer::new(),
                decode_arg: entry.decode_arg,
                invoke: entry.invoke,
            });
        }
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_rpc_codec::MsgpCodec;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, Copy)]
    pub struct Args {
        pub a: i32,
        pub b: i32,
    }

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
    pub struct Reply {
        pub c: i32,
    }

    struct Arith;

    impl RpcService<MsgpCodec> for Arith {
        fn service_name(&self) -> &'static str {
            "Arith"
        }

        fn methods(table: &mut MethodTable<Self, MsgpCodec>) {
            table
                .method("Mul", |_s, args: Args| async move {
                    Ok::<_, String>(Reply { c: args.a * args.b })
                })
                .method("Div", |_s, args: Args| async move {
                    if args.b == 0 {
                        return Err("divide by zero".to_string());
                    }
                    Ok(Reply { c: args.a / args.b })
                })
                .method("Error", |_s, args: Args| async move {
                    if args.a > i32::MIN {
                        panic!("ERROR");
                    }
                    Ok::<Reply, String>(Reply::default())
                });
        }
    }

    fn build_arith() -> Vec<Service<MsgpCodec>> {
        ServiceBuilder::new().build("Arith", Arc::new(Arith), &[]).expect("build")
    }

    async fn run(
        svc: &Service<MsgpCodec>, codec: &Arc<MsgpCodec>, args: Args,
    ) -> Result<Reply, RpcError> {
        let body = codec.encode(&args).expect("encode");
        let argv = svc.decode_arg(codec, &body).expect("decode");
        let reply = svc.invoke(argv, codec.clone()).await?;
        Ok(codec.decode(&reply).expect("decode reply"))
    }

    #[test]
    fn test_paths_lowercased() {
        let services = build_arith();
        let paths: Vec<&str> = services.iter().map(|s| s.path()).collect();
        assert_eq!(paths, vec!["/arith/mul", "/arith/div", "/arith/error"]);

        let grouped: Vec<Service<MsgpCodec>> =
            ServiceBuilder::new().build("Arith", Arc::new(Arith), &["Calc", "V1"]).expect("build");
        assert_eq!(grouped[0].path(), "/calc/v1/arith/mul");
    }

    #[tokio::test]
    async fn test_invoke_happy_path() {
        let services = build_arith();
        let codec = Arc::new(MsgpCodec::default());
        let reply = run(&services[0], &codec, Args { a: 7, b: 8 }).await.expect("mul");
        assert_eq!(reply, Reply { c: 56 });
    }

    #[tokio::test]
    async fn test_invoke_handler_error() {
        let services = build_arith();
        let codec = Arc::new(MsgpCodec::default());
        let err = run(&services[1], &codec, Args { a: 1, b: 0 }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Application);
        assert_eq!(err.message(), "divide by zero");
    }

    #[tokio::test]
    async fn test_invoke_catches_panic() {
        let services = build_arith();
        let codec = Arc::new(MsgpCodec::default());
        let err = run(&services[2], &codec, Args { a: 1, b: 1 }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Application);
        assert!(err.message().contains("ERROR"), "got: {}", err.message());
    }

    #[test]
    fn test_zero_methods_rejected() {
        struct Empty;
        impl RpcService<MsgpCodec> for Empty {
            fn service_name(&self) -> &'static str {
                "Empty"
            }
            fn methods(_table: &mut MethodTable<Self, MsgpCodec>) {}
        }
        let r: Result<Vec<Service<MsgpCodec>>, _> =
            ServiceBuilder::new().build("Empty", Arc::new(Empty), &[]);
        assert!(r.is_err());
    }

    #[test]
    fn test_bad_arg_bytes_rejected() {
        let services = build_arith();
        let codec = MsgpCodec::default();
        assert!(services[0].decode_arg(&codec, &[0xc1]).is_err());
    }
}
