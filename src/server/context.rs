//! Per-request server-side state, recycled through a pool.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use courier_rpc_core::uri::Query;

/// State bundle of one in-flight request: identity of the request, the
/// parsed service-method, and a typed scratch map plugins can use to pass
/// data between hook points. Never shared across requests.
#[derive(Default)]
pub struct RequestContext {
    pub(crate) seq: u64,
    pub(crate) service_method: String,
    pub(crate) path: String,
    pub(crate) query: Query,
    pub(crate) remote: String,
    data: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    /// Sequence number chosen by the client.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The raw service-method string of the request.
    #[inline]
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn query(&self) -> &Query {
        &self.query
    }

    #[inline]
    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    /// Request identifier for log correlation. Only meaningful once the
    /// header has been read.
    pub fn id(&self) -> String {
        format!("{}-{}", self.remote, self.seq)
    }

    pub fn set_data<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.data.insert(key.to_string(), Box::new(value));
    }

    pub fn data<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    fn reset(&mut self, remote: &str) {
        self.seq = 0;
        self.service_method.clear();
        self.path.clear();
        self.query = Query::default();
        self.remote.clear();
        self.remote.push_str(remote);
        self.data.clear();
    }
}

const POOL_CAP: usize = 256;

/// Context recycler. All mutable fields are reset on check-out, so a
/// handler or plugin can never observe a previous request's state.
pub(crate) struct ContextPool {
    pool: Mutex<Vec<Box<RequestContext>>>,
}

impl ContextPool {
    pub(crate) fn new() -> Self {
        Self { pool: Mutex::new(Vec::new()) }
    }

    pub(crate) fn get(&self, remote: &str) -> Box<RequestContext> {
        let mut ctx = match self.pool.lock().unwrap().pop() {
            Some(ctx) => ctx,
            None => Box::new(RequestContext::default()),
        };
        ctx.reset(remote);
        ctx
    }

    pub(crate) fn put(&self, ctx: Box<RequestContext>) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < POOL_CAP {
            pool.push(ctx);
        }
    }
}
