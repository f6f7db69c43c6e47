//! The [`Connection`] type: a single postgres wire connection.
use std::{
    collections::HashMap,
    fmt, io,
    num::NonZeroUsize,
    task::{Context, Poll, ready},
};

use lru::LruCache;

mod config;

pub use config::{Config, ParseError};

use crate::{
    Result,
    common::span,
    error::{ErrorKind, should_close_connection},
    io::PgStream,
    net::Socket,
    phase,
    postgres::{BackendProtocol, FrontendProtocol, backend, frontend},
    statement::StatementName,
    transport::PgTransport,
};

#[cfg(feature = "tls")]
use crate::net::tls::{self, TlsConfig, TlsMode};

const STMT_CACHE_CAP: usize = 128;

/// A single connection to a postgres server, speaking the wire protocol
/// directly over a [`PgStream`].
///
/// Holds a small cache of prepared statement names keyed by a hash of their
/// SQL, and tracks the last known transaction status reported by the
/// backend.
pub struct Connection {
    io: PgStream,
    stmts: LruCache<u64, StatementName>,
    parameters: HashMap<String, String>,
    backend_key_data: backend::BackendKeyData,
    tx_status: u8,
    /// Set by [`PgTransport::ready_request`]; cleared once a `ReadyForQuery`
    /// is observed. While set, every message read off the wire is discarded.
    draining: bool,
    /// Set once an error observed in `poll_recv` is classified by
    /// [`should_close_connection`] as connection-fatal. A poisoned
    /// connection fails its next [`poll_ready`][Self::poll_ready] instead of
    /// draining, so the pool closes it rather than handing it out again.
    poisoned: bool,
}

impl Connection {
    /// Connect using a postgres url, see [`Config::parse`].
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect using configuration read from the environment, see [`Config::from_env`].
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect using an already built [`Config`].
    pub async fn connect_with(config: Config) -> Result<Self> {
        let timeout = config.connect_timeout;
        let connect = Self::handshake(config);

        #[cfg(feature = "tokio")]
        if let Some(timeout) = timeout {
            return match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out").into()),
            };
        }

        connect.await
    }

    async fn handshake(config: Config) -> Result<Self> {
        span!("connect");

        let socket = match &config.socket {
            Some(path) => Socket::connect_unix(path.as_str()).await?,
            None => Socket::connect_tcp(config.host.as_str(), config.port).await?,
        };

        let io = PgStream::new(socket);

        #[cfg(feature = "tls")]
        let io = negotiate_tls(io, &config).await?;

        let mut conn = Self {
            io,
            stmts: LruCache::new(NonZeroUsize::new(STMT_CACHE_CAP).unwrap()),
            parameters: HashMap::new(),
            backend_key_data: backend::BackendKeyData { process_id: 0, secret_key: 0 },
            tx_status: b'I',
            draining: false,
            poisoned: false,
        };

        let startup = phase::startup(&config, &mut conn).await?;
        conn.backend_key_data = startup.backend_key_data;

        Ok(conn)
    }

    /// This connection's reported parameter status, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(<_>::as_ref)
    }

    /// The secret data sent by the backend during startup, used to issue `CancelRequest`.
    pub fn backend_key_data(&self) -> backend::BackendKeyData {
        self.backend_key_data
    }

    /// `'I'` idle, `'T'` in transaction, `'E'` in a failed transaction block.
    pub fn tx_status(&self) -> u8 {
        self.tx_status
    }

    /// Poll for readiness: flush any buffered write, and wait out a pending
    /// drain left over from a dropped [`Transaction`][crate::transaction::Transaction].
    ///
    /// Fails immediately if this connection was [poisoned][Self] by a
    /// connection-fatal error, so the pool's healthcheck evicts it instead
    /// of handing it back out.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if self.poisoned {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "connection closed after a connection-fatal error",
            ).into()));
        }
        ready!(self.poll_flush(cx))?;
        ready!(self.poll_drain(cx))?;
        Poll::Ready(Ok(()))
    }

    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.send(frontend::Terminate);
        self.io.poll_flush(cx)
    }

    /// Drive the drain-until-`ReadyForQuery` loop requested through
    /// [`PgTransport::ready_request`]. A no-op if nothing is draining.
    fn poll_drain(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        while self.draining {
            let (msgtype, body) = ready!(self.io.poll_recv_raw(cx))?;
            if msgtype == backend::ReadyForQuery::MSGTYPE {
                if let Ok(r) = backend::ReadyForQuery::decode(msgtype, body) {
                    self.tx_status = r.tx_status;
                }
                self.draining = false;
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(feature = "tls")]
async fn negotiate_tls(mut io: PgStream, config: &Config) -> Result<PgStream> {
    if let TlsMode::Disable = config.tls {
        return Ok(io);
    }

    io.send_ssl_request();
    std::future::poll_fn(|cx| io.poll_flush(cx)).await?;

    let reply = std::future::poll_fn(|cx| io.poll_recv_ssl_reply(cx)).await?;

    match reply {
        b'S' => {
            let (socket, read_buf, write_buf) = io.into_parts();
            if !read_buf.is_empty() {
                return Err(crate::postgres::ProtocolError::new(
                    "received unencrypted data after SSLRequest, possible MITM",
                ).into());
            }
            let tls_config = TlsConfig { mode: config.tls.clone(), root_cert: None };
            let socket = tls::handshake(socket, &config.host, &tls_config).await?;
            Ok(PgStream::from_parts(socket, read_buf, write_buf))
        }
        b'N' if matches!(config.tls, TlsMode::Require) => {
            Err(io::Error::new(io::ErrorKind::Other, "server does not support TLS").into())
        }
        b'N' => Ok(io),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected SSL negotiation reply {:?}", other as char),
        ).into()),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("backend_key_data", &self.backend_key_data)
            .field("tx_status", &(self.tx_status as char))
            .field("draining", &self.draining)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.io.poll_flush(cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        loop {
            ready!(self.io.poll_flush(cx))?;
            ready!(self.poll_drain(cx))?;

            let (msgtype, body) = ready!(self.io.poll_recv_raw(cx))?;

            if msgtype == backend::ReadyForQuery::MSGTYPE {
                if let Ok(r) = backend::ReadyForQuery::decode(msgtype, body.clone()) {
                    self.tx_status = r.tx_status;
                }
                return Poll::Ready(B::decode(msgtype, body).map_err(Into::into));
            }

            if msgtype == backend::NoticeResponse::MSGTYPE {
                #[cfg(feature = "log")]
                if let Ok(notice) = backend::NoticeResponse::decode(msgtype, body) {
                    log::warn!("{:?}", notice.fields);
                }
                continue;
            }

            if msgtype == backend::ParameterStatus::MSGTYPE {
                let status = backend::ParameterStatus::decode(msgtype, body)?;
                self.parameters.insert(status.name, status.value);
                continue;
            }

            if msgtype == backend::ErrorResponse::MSGTYPE {
                let err = backend::ErrorResponse::decode(msgtype, body)?;
                self.draining = true;
                self.poisoned = should_close_connection(&ErrorKind::Database(err.clone()));
                return Poll::Ready(Err(err.into()));
            }

            return Poll::Ready(B::decode(msgtype, body).map_err(Into::into));
        }
    }

    fn ready_request(&mut self) {
        self.draining = true;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        self.io.send(message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        self.io.send_startup(startup);
    }

    fn get_stmt(&mut self, sql: u64) -> Option<StatementName> {
        self.stmts.get(&sql).cloned()
    }

    fn add_stmt(&mut self, sql: u64, id: StatementName) {
        self.stmts.put(sql, id);
    }
}
