//! Crate-wide error type.
//!
//! Mirrors the teacher's house style: a boxed `Inner` holding a `Kind` plus an optional source,
//! manual `Display`/`Debug`, and `is_*()` predicate methods rather than a `thiserror` derive.

use std::{error::Error as StdError, fmt};

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors that can occur while checking out, using, or releasing a pooled connection.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Admission semaphore wait exceeded `timeout.pool`.
    PoolTimeout,
    /// The proxy's CONNECT response was not 2xx.
    Proxy { status: u16, reason: String },
    /// Transport establishment (DNS, TCP, TLS, handshake) failed.
    Connect,
    /// Sending the request or reading the response failed.
    Request,
    /// A single socket read exceeded `timeout.read`.
    ReadTimeout,
    /// The pool has been closed.
    Closed,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
            }),
        }
    }

    pub(crate) fn pool_timeout() -> Error {
        Error::new(Kind::PoolTimeout, None::<BoxError>)
    }

    pub(crate) fn proxy(status: http::StatusCode, reason: &str) -> Error {
        Error::new(
            Kind::Proxy {
                status: status.as_u16(),
                reason: reason.to_owned(),
            },
            None::<BoxError>,
        )
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn read_timeout() -> Error {
        Error::new(Kind::ReadTimeout, None::<BoxError>)
    }

    pub(crate) fn closed() -> Error {
        Error::new(Kind::Closed, None::<BoxError>)
    }

    /// Returns true if this error is a pool admission timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolTimeout)
    }

    /// Returns true if this error came from a failed CONNECT through a proxy.
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy { .. })
    }

    /// Returns true if this error is related to establishing a transport connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error is related to sending the request or reading the response.
    pub fn is_request(&self) -> bool {
        matches!(self.inner.kind, Kind::Request)
    }

    /// Returns true if a single read exceeded the configured read timeout.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ReadTimeout)
    }

    /// Returns true if the pool had already been closed when this call was made.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("pond::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.kind {
            Kind::PoolTimeout => f.write_str("timed out waiting for a pool connection")?,
            Kind::Proxy { status, reason } => {
                write!(f, "proxy CONNECT failed: {status} {reason}")?
            }
            Kind::Connect => f.write_str("error establishing connection")?,
            Kind::Request => f.write_str("error sending request or reading response")?,
            Kind::ReadTimeout => f.write_str("timed out reading from the connection")?,
            Kind::Closed => f.write_str("pool is closed")?,
        };
        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn error_is_send_and_sync() {
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn proxy_error_mentions_status_and_reason() {
        let err = Error::proxy(
            http::StatusCode::from_u16(407).unwrap(),
            "Proxy Authentication Required",
        );
        assert!(err.is_proxy());
        let msg = err.to_string();
        assert!(msg.contains("407"));
        assert!(msg.contains("Proxy Authentication Required"));
    }

    #[test]
    fn pool_timeout_predicate() {
        let err = Error::pool_timeout();
        assert!(err.is_pool_timeout());
        assert!(!err.is_connect());
    }
}
