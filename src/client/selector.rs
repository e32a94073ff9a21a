//! Endpoint choice and invoker lifecycle.
//!
//! The selectors here share one [EndpointSet] core: an atomically swappable
//! endpoint list, a lazy invoker cache, and per-endpoint failure counters
//! that walk the dial-timeout vector (saturating at its last entry, so the
//! vector doubles as a back-off schedule).

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use log::*;
use rand::Rng;

use courier_rpc_core::error::{ErrorKind, RpcError};
use courier_rpc_core::Codec;

use super::invoker::Invoker;

/// One backend address. `network` is "tcp", "unix" or "http"; for unix the
/// address is the socket path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub network: String,
    pub address: String,
}

impl Endpoint {
    pub fn new(network: &str, address: &str) -> Self {
        Self { network: network.to_string(), address: address.to_string() }
    }

    pub fn tcp(address: &str) -> Self {
        Self::new("tcp", address)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

/// Dials an endpoint with a deadline; installed once by the client.
pub type InvokerFactory<C> =
    Arc<dyn Fn(Endpoint, Duration) -> BoxFuture<'static, Result<Arc<Invoker<C>>, RpcError>> + Send + Sync>;

/// Endpoint chooser and invoker lifecycle manager injected into the client.
pub trait Selector<C: Codec>: Send + Sync + 'static {
    /// Installed by the client at construction time.
    fn set_invoker_factory(&self, factory: InvokerFactory<C>);

    /// Pick one live invoker, building it if need be.
    fn select(
        &self, service_method: &str,
    ) -> impl Future<Output = Result<Arc<Invoker<C>>, RpcError>> + Send;

    /// Snapshot over every endpoint, used by broadcast and forking.
    /// Endpoints that cannot be dialed are skipped.
    fn list(&self) -> impl Future<Output = Vec<Arc<Invoker<C>>>> + Send;

    /// Mark an invoker bad: evict it, shut it down, advance the endpoint's
    /// dial-timeout cursor.
    fn handle_failed(&self, invoker: &Arc<Invoker<C>>);

    /// Swap the endpoint list. Live invokers of surviving endpoints are
    /// kept, the rest are shut down.
    fn update_endpoints(&self, endpoints: Vec<Endpoint>);
}

struct SetState<C: Codec> {
    live: HashMap<Endpoint, Arc<Invoker<C>>>,
    fails: HashMap<Endpoint, usize>,
}

/// Shared core of the reference selectors.
pub(crate) struct EndpointSet<C: Codec> {
    endpoints: ArcSwap<Vec<Endpoint>>,
    dial_timeouts: Vec<Duration>,
    factory: OnceLock<InvokerFactory<C>>,
    state: Mutex<SetState<C>>,
}

impl<C: Codec> EndpointSet<C> {
    fn new(endpoints: Vec<Endpoint>, dial_timeouts: Vec<Duration>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            dial_timeouts,
            factory: OnceLock::new(),
            state: Mutex::new(SetState { live: HashMap::new(), fails: HashMap::new() }),
        }
    }

    fn set_factory(&self, factory: InvokerFactory<C>) {
        if self.factory.set(factory).is_err() {
            warn!("invoker factory installed twice, keeping the first");
        }
    }

    #[inline]
    fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.endpoints.load_full()
    }

    /// Dial timeout for the endpoint's next attempt: the fail counter
    /// indexes the vector, saturating at the last entry.
    fn dial_timeout_for(&self, endpoint: &Endpoint) -> Duration {
        if self.dial_timeouts.is_empty() {
            return Duration::from_secs(0);
        }
        let fails = self.state.lock().unwrap().fails.get(endpoint).copied().unwrap_or(0);
        let idx = fails.min(self.dial_timeouts.len() - 1);
        self.dial_timeouts[idx]
    }

    /// Live invoker for the endpoint, built lazily through the factory.
    async fn invoker_for(&self, endpoint: &Endpoint) -> Result<Arc<Invoker<C>>, RpcError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(inv) = state.live.get(endpoint) {
                if !inv.is_closed() {
                    return Ok(inv.clone());
                }
                state.live.remove(endpoint);
            }
        }
        let factory = match self.factory.get() {
            Some(f) => f.clone(),
            None => {
                return Err(RpcError::new(ErrorKind::Dial, "no invoker factory installed"));
            }
        };
        let dial_timeout = self.dial_timeout_for(endpoint);
        match factory(endpoint.clone(), dial_timeout).await {
            Ok(built) => {
                let mut state = self.state.lock().unwrap();
                if let Some(existing) = state.live.get(endpoint) {
                    if !existing.is_closed() {
                        // lost the build race, keep the winner
                        let existing = existing.clone();
                        drop(state);
                        built.shutdown_now();
                        return Ok(existing);
                    }
                }
                state.live.insert(endpoint.clone(), built.clone());
                Ok(built)
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                *state.fails.entry(endpoint.clone()).or_insert(0) += 1;
                Err(e)
            }
        }
    }

    /// Scan circularly from `start` for the first endpoint that yields an
    /// invoker.
    async fn select_from(&self, start: usize) -> Result<Arc<Invoker<C>>, RpcError> {
        let endpoints = self.snapshot();
        let n = endpoints.len();
        if n == 0 {
            return Err(RpcError::new(ErrorKind::Dial, "no endpoints configured"));
        }
        let mut last_err = None;
        for i in 0..n {
            let endpoint = &endpoints[(start + i) % n];
            match self.invoker_for(endpoint).await {
                Ok(inv) => return Ok(inv),
                Err(e) => {
                    debug!("select {}: {}", endpoint, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("nonempty scan"))
    }

    async fn list_all(&self) -> Vec<Arc<Invoker<C>>> {
        let endpoints = self.snapshot();
        let mut invokers = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            match self.invoker_for(endpoint).await {
                Ok(inv) => invokers.push(inv),
                Err(e) => warn!("list {}: {}", endpoint, e),
            }
        }
        invokers
    }

    fn evict(&self, invoker: &Arc<Invoker<C>>) {
        let mut state = self.state.lock().unwrap();
        let key = state
            .live
            .iter()
            .find(|(_, v)| Arc::ptr_eq(v, invoker))
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            state.live.remove(&key);
            *state.fails.entry(key).or_insert(0) += 1;
        }
        drop(state);
        invoker.shutdown_now();
    }

    fn update(&self, endpoints: Vec<Endpoint>) {
        let keep: HashSet<&Endpoint> = endpoints.iter().collect();
        {
            let mut state = self.state.lock().unwrap();
            state.live.retain(|k, v| {
                if keep.contains(k) {
                    true
                } else {
                    v.shutdown_now();
                    false
                }
            });
            state.fails.retain(|k, _| keep.contains(k));
        }
        self.endpoints.store(Arc::new(endpoints));
    }

    /// Observable failure count of one endpoint.
    fn fail_count(&self, endpoint: &Endpoint) -> usize {
        self.state.lock().unwrap().fails.get(endpoint).copied().unwrap_or(0)
    }
}

macro_rules! impl_selector_via_set {
    () => {
        fn set_invoker_factory(&self, factory: InvokerFactory<C>) {
            self.set.set_factory(factory);
        }

        fn list(&self) -> impl Future<Output = Vec<Arc<Invoker<C>>>> + Send {
            self.set.list_all()
        }

        fn handle_failed(&self, invoker: &Arc<Invoker<C>>) {
            self.set.evict(invoker);
        }

        fn update_endpoints(&self, endpoints: Vec<Endpoint>) {
            self.set.update(endpoints);
        }
    };
}

/// Walks the endpoint list in order, one step per selection.
pub struct RoundRobinSelector<C: Codec> {
    set: EndpointSet<C>,
    counter: AtomicUsize,
}

impl<C: Codec> RoundRobinSelector<C> {
    pub fn new(endpoints: Vec<Endpoint>, dial_timeouts: Vec<Duration>) -> Self {
        Self { set: EndpointSet::new(endpoints, dial_timeouts), counter: AtomicUsize::new(0) }
    }

    pub fn fail_count(&self, endpoint: &Endpoint) -> usize {
        self.set.fail_count(endpoint)
    }
}

impl<C: Codec> Selector<C> for RoundRobinSelector<C> {
    impl_selector_via_set!();

    fn select(
        &self, _service_method: &str,
    ) -> impl Future<Output = Result<Arc<Invoker<C>>, RpcError>> + Send {
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        self.set.select_from(start)
    }
}

/// Uniformly random endpoint per selection.
pub struct RandomSelector<C: Codec> {
    set: EndpointSet<C>,
}

impl<C: Codec> RandomSelector<C> {
    pub fn new(endpoints: Vec<Endpoint>, dial_timeouts: Vec<Duration>) -> Self {
        Self { set: EndpointSet::new(endpoints, dial_timeouts) }
    }
}

impl<C: Codec> Selector<C> for RandomSelector<C> {
    impl_selector_via_set!();

    fn select(
        &self, _service_method: &str,
    ) -> impl Future<Output = Result<Arc<Invoker<C>>, RpcError>> + Send {
        let start = rand::rng().random::<u64>() as usize;
        self.set.select_from(start)
    }
}

/// Pins each service-method to an endpoint by hash, so repeated calls for
/// the same method land on the same backend while it stays healthy.
pub struct ConsistentHashSelector<C: Codec> {
    set: EndpointSet<C>,
}

impl<C: Codec> ConsistentHashSelector<C> {
    pub fn new(endpoints: Vec<Endpoint>, dial_timeouts: Vec<Duration>) -> Self {
        Self { set: EndpointSet::new(endpoints, dial_timeouts) }
    }
}

impl<C: Codec> Selector<C> for ConsistentHashSelector<C> {
    impl_selector_via_set!();

    fn select(
        &self, service_method: &str,
    ) -> impl Future<Output = Result<Arc<Invoker<C>>, RpcError>> + Send {
        let mut hasher = DefaultHasher::new();
        service_method.hash(&mut hasher);
        let start = hasher.finish() as usize;
        self.set.select_from(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetStream;
    use crate::plugin::ClientPluginContainer;
    use courier_rpc_codec::MsgpCodec;
    use courier_rpc_core::TimeoutSetting;
    use std::sync::Mutex as StdMutex;

    /// Factory over in-memory duplex pipes; keeps the server halves alive
    /// and records every dial.
    struct StubDialer {
        dials: StdMutex<Vec<(Endpoint, Duration)>>,
        peers: StdMutex<Vec<tokio::io::DuplexStream>>,
        refuse: Option<Endpoint>,
    }

    impl StubDialer {
        fn factory(self: Arc<Self>) -> InvokerFactory<MsgpCodec> {
            let dialer = self;
            Arc::new(move |endpoint, dial_timeout| {
                let dialer = dialer.clone();
                Box::pin(async move {
                    dialer.dials.lock().unwrap().push((endpoint.clone(), dial_timeout));
                    if dialer.refuse.as_ref() == Some(&endpoint) {
                        return Err(RpcError::new(ErrorKind::Dial, "dial error: refused"));
                    }
                    let (local, peer) = tokio::io::duplex(4096);
                    dialer.peers.lock().unwrap().push(peer);
                    Ok(Invoker::start(
                        NetStream::wrap(Box::new(local)),
                        endpoint,
                        Arc::new(ClientPluginContainer::new()),
                        TimeoutSetting::client_default(),
                    ))
                })
            })
        }

        fn new(refuse: Option<Endpoint>) -> Arc<Self> {
            Arc::new(Self {
                dials: StdMutex::new(Vec::new()),
                peers: StdMutex::new(Vec::new()),
                refuse,
            })
        }
    }

    fn two_endpoints() -> Vec<Endpoint> {
        vec![Endpoint::tcp("127.0.0.1:1"), Endpoint::tcp("127.0.0.1:2")]
    }

    #[tokio::test]
    async fn test_round_robin_alternates_and_caches() {
        let dialer = StubDialer::new(None);
        let sel: RoundRobinSelector<MsgpCodec> = RoundRobinSelector::new(two_endpoints(), vec![]);
        sel.set_invoker_factory(dialer.clone().factory());

        let a = sel.select("/x/y").await.expect("select");
        let b = sel.select("/x/y").await.expect("select");
        let c = sel.select("/x/y").await.expect("select");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c), "invokers are cached per endpoint");
        // two endpoints dialed once each
        assert_eq!(dialer.dials.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_select_skips_refused_endpoint() {
        let eps = two_endpoints();
        let dialer = StubDialer::new(Some(eps[0].clone()));
        let sel: RoundRobinSelector<MsgpCodec> = RoundRobinSelector::new(eps.clone(), vec![]);
        sel.set_invoker_factory(dialer.clone().factory());

        let inv = sel.select("/x/y").await.expect("select falls through");
        assert_eq!(inv.endpoint(), &eps[1]);
        assert_eq!(sel.fail_count(&eps[0]), 1);
        assert_eq!(sel.fail_count(&eps[1]), 0);
    }

    #[tokio::test]
    async fn test_handle_failed_advances_dial_timeouts() {
        let eps = vec![Endpoint::tcp("127.0.0.1:1")];
        let timeouts =
            vec![Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(30)];
        let dialer = StubDialer::new(None);
        let sel: RoundRobinSelector<MsgpCodec> = RoundRobinSelector::new(eps.clone(), timeouts);
        sel.set_invoker_factory(dialer.clone().factory());

        for _ in 0..4 {
            let inv = sel.select("/x/y").await.expect("select");
            sel.handle_failed(&inv);
        }
        let dials = dialer.dials.lock().unwrap();
        let seen: Vec<u64> = dials.iter().map(|(_, d)| d.as_millis() as u64).collect();
        // consumed in order, saturating at the last entry
        assert_eq!(seen, vec![10, 20, 30, 30]);
    }

    #[tokio::test]
    async fn test_update_endpoints_drops_removed() {
        let eps = two_endpoints();
        let dialer = StubDialer::new(None);
        let sel: RoundRobinSelector<MsgpCodec> = RoundRobinSelector::new(eps.clone(), vec![]);
        sel.set_invoker_factory(dialer.clone().factory());

        let all = sel.list().await;
        assert_eq!(all.len(), 2);
        sel.update_endpoints(vec![eps[0].clone()]);
        let all = sel.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].endpoint(), &eps[0]);
    }

    #[tokio::test]
    async fn test_consistent_hash_is_sticky() {
        let dialer = StubDialer::new(None);
        let sel: ConsistentHashSelector<MsgpCodec> =
            ConsistentHashSelector::new(two_endpoints(), vec![]);
        sel.set_invoker_factory(dialer.clone().factory());

        let first = sel.select("/arith/mul").await.expect("select");
        for _ in 0..5 {
            let again = sel.select("/arith/mul").await.expect("select");
            assert!(Arc::ptr_eq(&first, &again));
        }
    }
}
