//! `pgdrift` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error};

use crate::{
    common::unit_error,
    connection::ParseError,
    fetch::EmptyQueryError,
    phase::UnsupportedAuth,
    postgres::{ErrorResponse, ProtocolError, scram::ScramError},
    row::{DecodeError, RowNotFound},
};

unit_error! {
    /// More than 32767 bind parameters in a single query.
    pub struct TooManyParameters("too many bind parameters, postgres allows at most 32767");
}

unit_error! {
    /// A connection was requested from a pool that has begun graceful shutdown.
    pub struct PoolShutdown("pool is shutting down, no new connections are leased");
}

/// `LISTEN`/`UNLISTEN` failed.
pub struct ListenError {
    pub(crate) unlisten: bool,
    pub(crate) source: ErrorResponse,
}

impl std::error::Error for ListenError { }

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.unlisten { "UNLISTEN" } else { "LISTEN" };
        write!(f, "{verb} failed: {}", self.source)
    }
}

impl fmt::Debug for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A specialized [`Result`] type for `pgdrift` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgdrift` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// All possible error kind from `pgdrift` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    Database(ErrorResponse),
    Utf8(std::str::Utf8Error),
    RowNotFound(RowNotFound),
    EmptyQuery(EmptyQueryError),
    UnsupportedAuth(UnsupportedAuth),
    Scram(ScramError),
    Decode(DecodeError),
    TooManyParameters(TooManyParameters),
    PoolShutdown(PoolShutdown),
    Listen(ListenError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));
from!(<EmptyQueryError>e => ErrorKind::EmptyQuery(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<ScramError>e => ErrorKind::Scram(e));

from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<TooManyParameters>e => ErrorKind::TooManyParameters(e));
from!(<PoolShutdown>e => ErrorKind::PoolShutdown(e));
from!(<ListenError>e => ErrorKind::Listen(e));

/// Whether a given error kind, observed while a task was in flight, should
/// tear down the whole connection rather than just fail that task.
///
/// Mirrors the classification a connection's `poll_recv` dispatch loop acts
/// on: a database error only closes the connection when its `SQLSTATE`
/// is class `28` (invalid authorization); every other kind here either
/// always closes (protocol/auth/io failures) or never does (value decode,
/// row-not-found, empty query).
pub(crate) fn should_close_connection(kind: &ErrorKind) -> bool {
    match kind {
        ErrorKind::Database(e) => e.is_authorization_failure(),
        ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::UnsupportedAuth(_) | ErrorKind::Scram(_) => true,
        ErrorKind::Config(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::RowNotFound(_)
        | ErrorKind::EmptyQuery(_)
        | ErrorKind::Decode(_)
        | ErrorKind::TooManyParameters(_)
        | ErrorKind::PoolShutdown(_)
        | ErrorKind::Listen(_) => false,
    }
}

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Scram(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
            Self::EmptyQuery(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::TooManyParameters(e) => e.fmt(f),
            Self::PoolShutdown(e) => e.fmt(f),
            Self::Listen(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_error(sqlstate: &str) -> ErrorKind {
        ErrorKind::Database(ErrorResponse { fields: vec![(b'C', sqlstate.to_string())] })
    }

    #[test]
    fn authorization_class_closes_the_connection() {
        assert!(should_close_connection(&db_error("28000")));
        assert!(should_close_connection(&db_error("28P01")));
    }

    #[test]
    fn other_server_errors_do_not_close_the_connection() {
        assert!(!should_close_connection(&db_error("22P02")));
        assert!(!should_close_connection(&db_error("23505")));
    }

    #[test]
    fn protocol_and_io_failures_always_close() {
        assert!(should_close_connection(&ErrorKind::Protocol(ProtocolError::new("bad frame"))));
        assert!(should_close_connection(&ErrorKind::Io(io::Error::other("reset"))));
    }

    #[test]
    fn value_level_failures_never_close() {
        assert!(!should_close_connection(&ErrorKind::Decode(DecodeError::OidMissmatch)));
        assert!(!should_close_connection(&ErrorKind::RowNotFound(RowNotFound)));
    }
}
