/// Teardown error message, assigned to every call that was still pending
/// when its connection went away.
pub const ERR_SHUTDOWN_MSG: &str = "connection is shut down";

/// Numeric error classes shared by both sides of a connection.
///
/// The discriminant is the wire code: an error string sent from server to
/// client is prefixed with the decimal code, immediately followed by the
/// human-readable message (no separator).
///
/// Codes 1..=10 are produced by the server pipeline, codes from
/// [ErrorKind::Dial] up are client-local and never appear on the wire.
/// [ErrorKind::Application] covers errors returned (or panics raised) by
/// service methods themselves.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    strum::Display,
    strum::FromRepr,
    strum::AsRefStr,
)]
#[repr(u8)]
pub enum ErrorKind {
    /// A service method returned an error or panicked.
    Application = 0,
    PreReadRequestHeader = 1,
    ReadRequestHeader = 2,
    InvalidServiceMethod = 3,
    PostReadRequestHeader = 4,
    /// No service is registered under the requested path.
    NotFoundService = 5,
    PreReadRequestBody = 6,
    ReadRequestBody = 7,
    PostReadRequestBody = 8,
    PreWriteResponse = 9,
    /// Post-write hook failures are logged on the server, never sent.
    PostWriteResponse = 10,
    Dial = 11,
    WriteRequest = 12,
    ReadResponseHeader = 13,
    ReadResponseBody = 14,
    /// The invoker's connection was torn down with the call still pending.
    ConnectionShutdown = 15,
    InvalidDoneChannel = 16,
}

impl ErrorKind {
    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// The error type surfaced by every fallible operation of the framework.
///
/// Carries an [ErrorKind] for classification plus a plain message. The
/// Display form is the message alone; the kind only shows up in the wire
/// encoding ([RpcError::to_wire]).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
}

impl RpcError {
    #[inline]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self { kind, message: message.into() }
    }

    /// The well-known teardown error of a closed invoker.
    #[inline]
    pub fn shutdown() -> Self {
        Self::new(ErrorKind::ConnectionShutdown, ERR_SHUTDOWN_MSG)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Encode for the response header: decimal kind code concatenated with
    /// the message, no separator.
    pub fn to_wire(&self) -> String {
        format!("{}{}", self.kind.code(), self.message)
    }

    /// Classify a wire error string by its numeric prefix.
    ///
    /// The prefix is concatenated without a separator, so a message starting
    /// with digits is ambiguous; we take the longest leading run (two digits,
    /// then one) that names a known kind. A string without a recognizable
    /// prefix becomes an [ErrorKind::Application] error carrying the whole
    /// string as its message.
    pub fn from_wire(s: &str) -> Self {
        let digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
        for take in [2usize, 1] {
            if digits >= take {
                if let Ok(code) = s[..take].parse::<u8>() {
                    if let Some(kind) = ErrorKind::from_repr(code) {
                        return Self::new(kind, &s[take..]);
                    }
                }
            }
        }
        Self::new(ErrorKind::Application, s)
    }
}

impl From<std::io::Error> for RpcError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Application, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        assert_eq!(ErrorKind::Application.code(), 0);
        assert_eq!(ErrorKind::NotFoundService.code(), 5);
        assert_eq!(ErrorKind::PostWriteResponse.code(), 10);
        assert_eq!(ErrorKind::ConnectionShutdown.code(), 15);
        assert_eq!(ErrorKind::from_repr(5), Some(ErrorKind::NotFoundService));
        assert_eq!(ErrorKind::from_repr(42), None);
    }

    #[test]
    fn test_wire_round_trip() {
        let e = RpcError::new(ErrorKind::NotFoundService, "can't find service '/no/such'");
        let wire = e.to_wire();
        assert_eq!(wire, "5can't find service '/no/such'");
        let back = RpcError::from_wire(&wire);
        assert_eq!(back.kind(), ErrorKind::NotFoundService);
        assert_eq!(back.message(), "can't find service '/no/such'");
    }

    #[test]
    fn test_wire_two_digit_prefix() {
        let e = RpcError::new(ErrorKind::PostWriteResponse, "hook failed");
        let back = RpcError::from_wire(&e.to_wire());
        assert_eq!(back.kind(), ErrorKind::PostWriteResponse);
        assert_eq!(back.message(), "hook failed");
    }

    #[test]
    fn test_wire_digit_leading_message_collides() {
        // The prefix has no separator, so a message starting with digits can
        // shift the classification. "0" + "42nd try failed" parses as code
        // 04. Documented behavior, kept wire-compatible.
        let e = RpcError::new(ErrorKind::Application, "42nd try failed");
        let back = RpcError::from_wire(&e.to_wire());
        assert_eq!(back.kind(), ErrorKind::PostReadRequestHeader);
        assert_eq!(back.message(), "2nd try failed");
    }

    #[test]
    fn test_wire_unprefixed() {
        let back = RpcError::from_wire("some invokers return Error");
        assert_eq!(back.kind(), ErrorKind::Application);
        assert_eq!(back.message(), "some invokers return Error");
    }

    #[test]
    fn test_shutdown_error() {
        let e = RpcError::shutdown();
        assert_eq!(e.kind(), ErrorKind::ConnectionShutdown);
        assert_eq!(format!("{}", e), ERR_SHUTDOWN_MSG);
    }
}
