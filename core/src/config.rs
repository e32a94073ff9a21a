use std::time::Duration;

/// Path of the HTTP CONNECT upgrade endpoint when none is configured.
/// The value is kept for wire compatibility with the established upgrade
/// convention of this protocol family.
pub const DEFAULT_RPC_PATH: &str = "/_goRPC_";

const ZERO: Duration = Duration::from_secs(0);

/// Socket deadlines. A zero duration means unlimited.
#[derive(Clone, Copy)]
pub struct TimeoutSetting {
    /// Overall cap applied to every single read and write.
    pub timeout: Duration,
    /// Socket read timeout for request/response payloads.
    pub read_timeout: Duration,
    /// Socket write timeout.
    pub write_timeout: Duration,
    /// How long a server connection may sit between requests.
    pub idle_timeout: Duration,
    /// Connect timeout used when an endpoint has no dial-timeout vector.
    pub connect_timeout: Duration,
}

impl TimeoutSetting {
    /// Server profile: bounded payload IO, generous idle window.
    pub fn server_default() -> Self {
        Self {
            timeout: ZERO,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Client profile: reads unlimited so slow service methods don't kill
    /// the connection, writes bounded.
    pub fn client_default() -> Self {
        Self {
            timeout: ZERO,
            read_timeout: ZERO,
            write_timeout: Duration::from_secs(5),
            idle_timeout: ZERO,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Effective bound for one read: smallest nonzero of the overall and
    /// read-specific timeouts.
    #[inline]
    pub fn effective_read(&self) -> Duration {
        min_nonzero(self.timeout, self.read_timeout)
    }

    #[inline]
    pub fn effective_write(&self) -> Duration {
        min_nonzero(self.timeout, self.write_timeout)
    }

    /// Bound while waiting for the next request on a server connection.
    #[inline]
    pub fn effective_idle(&self) -> Duration {
        min_nonzero(self.timeout, self.idle_timeout)
    }
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self::server_default()
    }
}

#[inline]
fn min_nonzero(a: Duration, b: Duration) -> Duration {
    if a == ZERO {
        return b;
    }
    if b == ZERO {
        return a;
    }
    a.min(b)
}

#[derive(Clone)]
pub struct ServerConfig {
    pub timeouts: TimeoutSetting,
    /// Log every registered route and the serving address.
    pub router_printable: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { timeouts: TimeoutSetting::server_default(), router_printable: false }
    }
}

/// Client strategy for a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Retry on another invoker, up to `max_try` attempts in total.
    #[default]
    Failover,
    /// Single attempt, the error is returned as-is.
    Failfast,
    /// Retry on the same invoker, up to `max_try` attempts.
    Failtry,
    /// Send to every invoker; succeed only if all of them succeed.
    Broadcast,
    /// Send to every invoker; succeed as soon as one of them succeeds.
    Forking,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub timeouts: TimeoutSetting,
    pub fail_mode: FailMode,
    /// Maximum call attempts for Failover/Failtry. Values below 1 fall back
    /// to the default of 3.
    pub max_try: usize,
    /// CONNECT path used when dialing "http" endpoints.
    pub http_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutSetting::client_default(),
            fail_mode: FailMode::default(),
            max_try: 3,
            http_path: DEFAULT_RPC_PATH.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeouts() {
        let mut t = TimeoutSetting::server_default();
        assert_eq!(t.effective_read(), Duration::from_secs(5));
        t.timeout = Duration::from_secs(2);
        assert_eq!(t.effective_read(), Duration::from_secs(2));
        assert_eq!(t.effective_idle(), Duration::from_secs(2));
        t.read_timeout = ZERO;
        assert_eq!(t.effective_read(), Duration::from_secs(2));
        t.timeout = ZERO;
        assert_eq!(t.effective_read(), ZERO);
    }

    #[test]
    fn test_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.fail_mode, FailMode::Failover);
        assert_eq!(c.max_try, 3);
        assert_eq!(c.http_path, DEFAULT_RPC_PATH);
        let s = ServerConfig::default();
        assert!(!s.router_printable);
    }
}
