//! Row streaming and the adaptive look-ahead buffer.
use std::{
    collections::VecDeque,
    hash::{DefaultHasher, Hash, Hasher},
    marker::PhantomData,
    mem,
    pin::Pin,
    task::{
        Context,
        Poll::{self, *},
        ready,
    },
};

use futures_core::Stream;

use crate::{
    Error, Result, Row,
    common::unit_error,
    encode::Encoded,
    postgres::{
        PgFormat,
        backend::{self, BackendMessage, CommandComplete},
        frontend,
    },
    sql::Sql,
    statement::{PortalName, StatementName},
    transport::PgTransport,
};

unit_error! {
    /// Returned when executing an empty query string.
    pub struct EmptyQueryError("empty query");
}

impl Error {
    pub(crate) fn empty_query() -> Self {
        EmptyQueryError.into()
    }

    pub(crate) fn row_not_found() -> Self {
        crate::row::RowNotFound.into()
    }
}

/// Lower bound of the adaptive look-ahead buffer.
const BUFFER_MIN: usize = 1;
/// Upper bound of the adaptive look-ahead buffer.
const BUFFER_MAX: usize = 16_384;
/// Starting size of the adaptive look-ahead buffer.
const BUFFER_START: usize = 64;

#[derive(Debug)]
pub struct PrepareData {
    pub sqlid: u64,
    pub stmt: StatementName,
    pub cache_hit: bool,
    /// this field intended to be edited by called for `portal` params.
    pub max_row: u32,
}

/// Write Prepare statement to `io`.
///
/// If cache hit, no further action is required.
///
/// If cache miss, flushing is required, with responses possible:
/// - `ParseComplete` from `Parse`
///
/// Also caller might want to cache the returned statement.
fn prepare(
    sql: &impl Sql,
    params: &[Encoded],
    mut io: impl PgTransport,
) -> PrepareData {
    let persist = sql.persistent();
    let sql = sql.sql().trim();

    let sqlid = {
        let mut buf = DefaultHasher::new();
        sql.hash(&mut buf);
        buf.finish()
    };

    if persist {
        if let Some(stmt) = io.get_stmt(sqlid) {
            return PrepareData { sqlid, stmt, cache_hit: true, max_row: 0 };
        }
    }

    let stmt = match persist {
        true => StatementName::next(),
        false => StatementName::unnamed(),
    };

    let oids: Vec<_> = params.iter().map(Encoded::oid).collect();
    io.send(frontend::Parse {
        prepare_name: stmt.as_str(),
        sql,
        param_oids: &oids,
    });
    io.send(frontend::Flush);

    PrepareData { sqlid, stmt, cache_hit: false, max_row: 0 }
}

/// Write Bind, Describe, Execute and Sync to `io`.
///
/// Flushing is required after call.
///
/// Responses possible:
/// - `BindComplete` from `Bind`
/// - `RowDescription` or `NoData` from `Describe`
/// - `DataRow` from `Execute`
/// - `Execute` phase is always terminated by the appearance of exactly one of these messages:
///   - `CommandComplete`
///   - `EmptyQueryResponse`
///   - `ErrorResponse`
/// - `ReadyForQuery` from `Sync`
///
/// `max_row` is always `0`: `PortalSuspended` is never handled, so the portal
/// always runs to completion in one `Execute`.
fn portal(data: &PrepareData, params: &mut Vec<Encoded>, mut io: impl PgTransport) {
    let portal = PortalName::unnamed();
    let params = mem::take(params);

    io.send(frontend::Bind {
        portal_name: portal.as_str(),
        prepare_name: data.stmt.as_str(),
        params: &params,
        result_format: PgFormat::Binary,
    });
    io.send(frontend::Describe {
        target: frontend::Target::Portal,
        name: portal.as_str(),
    });
    io.send(frontend::Execute { portal_name: portal.as_str() });
    io.send(frontend::Sync);
}

/// Decode information from [`CommandComplete`][1] message.
///
/// [1]: backend::CommandComplete
pub(crate) fn command_complete(cmd: backend::CommandComplete) -> u64 {
    let mut whs = cmd.tag.split_whitespace();
    let Some(tag) = whs.next() else {
        return 0;
    };
    let Some(rows) = whs.next() else {
        return 0;
    };
    match tag {
        "INSERT" => whs.next().unwrap_or_default(),
        "SELECT" => rows,
        "UPDATE" => rows,
        "DELETE" => rows,
        "MERGE" => rows,
        "FETCH" => rows,
        "MOVE" => rows,
        "COPY" => rows,
        _ => return 0,
    }
    .parse()
    .unwrap_or_default()
}

/// Maps a raw [`Row`] into the type the caller asked for.
///
/// Implemented by `query::StreamRow<R>` and `query::StreamScalar<D>`.
pub trait StreamMap {
    type Output;

    fn map(row: Row) -> Result<Self::Output>;
}

/// Accumulates [`StreamMap::Output`] values into whatever shape the query
/// method (`fetch_all`, `fetch_one`, ...) promises.
pub trait FetchCollect<R> {
    type Output;

    fn value(&mut self, input: R);

    fn finish(&mut self, cmd: Option<CommandComplete>) -> Result<Self::Output>;
}

#[derive(Debug)]
enum Phase<ExeFut> {
    Connect { f: ExeFut },
    Prepare,
    PrepareComplete,
    Portal,
    BindComplete,
    RowDescription,
    DataRow(Row),
    ReadyForQuery,
    Complete,
}

/// An adaptive, client-side look-ahead buffer over already-arrived `DataRow`
/// messages.
///
/// This never affects the wire protocol: `Execute` always asks for
/// unbounded rows (`max_row == 0`), so `PortalSuspended` never occurs. The
/// buffer only changes how eagerly this stream drains already-buffered
/// socket bytes before handing a row back to the caller, growing when the
/// network keeps up and shrinking when the caller is the bottleneck.
struct RowBuffer {
    queue: VecDeque<Result<Row>>,
    target: usize,
}

impl RowBuffer {
    fn new() -> Self {
        Self { queue: VecDeque::new(), target: BUFFER_START }
    }

    fn grow(&mut self) {
        self.target = (self.target * 2).min(BUFFER_MAX);
    }

    fn shrink(&mut self) {
        self.target = (self.target / 2).max(BUFFER_MIN);
    }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FetchStream<'val, SQL, ExeFut, IO, M> {
    sql: SQL,
    io: Option<IO>,
    data: Option<PrepareData>,
    phase: Phase<ExeFut>,
    params: Vec<Encoded<'val>>,
    max_row: u32,
    pub(crate) cmd: Option<CommandComplete>,
    buffer: RowBuffer,
    _p: PhantomData<M>,
}

impl<'val, SQL, ExeFut, IO, M> FetchStream<'val, SQL, ExeFut, IO, M> {
    pub fn new(
        sql: SQL,
        exe: ExeFut,
        params: Vec<Encoded<'val>>,
        max_row: u32,
    ) -> Self {
        Self {
            sql,
            io: None,
            data: None,
            phase: Phase::Connect { f: exe },
            params,
            max_row,
            cmd: None,
            buffer: RowBuffer::new(),
            _p: PhantomData,
        }
    }

    /// Poll the underlying protocol machine until it either produces a row,
    /// the stream is exhausted, or it would block (`None` + `Ready` means
    /// "no row available but not done yet, try again after re-polling").
    fn poll_protocol(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>>> {
        loop {
            match &mut self.phase {
                Phase::Connect { f } => {
                    let io = ready!(Pin::new(f).poll(cx)?);
                    self.io = Some(io);
                    self.phase = Phase::Prepare;
                }
                Phase::Prepare => {
                    self.data = Some(prepare(&self.sql, &self.params, self.io.as_mut().unwrap()));
                    self.phase = match self.data.as_ref().unwrap().cache_hit {
                        true => Phase::Portal,
                        false => Phase::PrepareComplete,
                    };
                }
                Phase::PrepareComplete => {
                    let io = self.io.as_mut().unwrap();
                    let data = self.data.as_ref().unwrap();
                    ready!(io.poll_recv::<backend::ParseComplete>(cx)?);
                    io.add_stmt(data.sqlid, data.stmt.clone());
                    self.phase = Phase::Portal;
                }
                Phase::Portal => {
                    let data = self.data.as_mut().unwrap();
                    data.max_row = self.max_row;
                    portal(data, &mut self.params, self.io.as_mut().unwrap());
                    self.phase = Phase::BindComplete;
                }
                Phase::BindComplete => {
                    ready!(self.io.as_mut().unwrap().poll_recv::<backend::BindComplete>(cx)?);
                    self.phase = Phase::RowDescription;
                }
                Phase::RowDescription => {
                    use BackendMessage::*;
                    match ready!(self.io.as_mut().unwrap().poll_recv(cx)?) {
                        NoData(_) => {}
                        CommandComplete(cmd) => {
                            self.cmd = Some(cmd);
                            self.phase = Phase::ReadyForQuery;
                        }
                        RowDescription(rd) => {
                            self.phase = Phase::DataRow(Row::new(rd.0));
                        }
                        f => {
                            self.phase = Phase::Complete;
                            return Ready(Err(f.unexpected("description recv").into()));
                        }
                    }
                }
                Phase::DataRow(row) => {
                    use BackendMessage::*;
                    match ready!(self.io.as_mut().unwrap().poll_recv(cx)?) {
                        DataRow(dr) => {
                            return Ready(Ok(Some(row.inner_clone(dr.0))));
                        }
                        CommandComplete(cmd) => {
                            self.cmd = Some(cmd);
                            self.phase = Phase::ReadyForQuery;
                        }
                        f @ PortalSuspended(_) => {
                            self.phase = Phase::Complete;
                            return Ready(Err(f.unexpected("fetching data rows").into()));
                        }
                        EmptyQueryResponse(_) => {
                            self.phase = Phase::Complete;
                            return Ready(Err(Error::empty_query()));
                        }
                        f => {
                            self.phase = Phase::Complete;
                            return Ready(Err(f.unexpected("fetching data rows").into()));
                        }
                    }
                }
                Phase::ReadyForQuery => {
                    ready!(self.io.as_mut().unwrap().poll_recv::<backend::ReadyForQuery>(cx)?);
                    self.phase = Phase::Complete;
                }
                Phase::Complete => return Ready(Ok(None)),
            }
        }
    }
}

impl<SQL, ExeFut, IO, M> Stream for FetchStream<'_, SQL, ExeFut, IO, M>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport + Unpin,
    M: StreamMap + Unpin,
{
    type Item = Result<M::Output>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        if let Some(row) = me.buffer.queue.pop_front() {
            return Ready(Some(row.and_then(M::map)));
        }

        let mut filled_any = false;
        let mut hit_target = false;

        loop {
            if me.buffer.queue.len() >= me.buffer.target {
                hit_target = true;
                break;
            }

            match me.poll_protocol(cx) {
                Ready(Ok(Some(row))) => {
                    me.buffer.queue.push_back(Ok(row));
                    filled_any = true;
                }
                Ready(Ok(None)) => break,
                Ready(Err(err)) => {
                    me.buffer.queue.push_back(Err(err));
                    filled_any = true;
                    break;
                }
                Pending => break,
            }
        }

        if hit_target {
            me.buffer.grow();
        } else if !filled_any && me.buffer.queue.is_empty() {
            me.buffer.shrink();
        }

        match me.buffer.queue.pop_front() {
            Some(row) => Ready(Some(row.and_then(M::map))),
            None if matches!(me.phase, Phase::Complete) => Ready(None),
            None => Pending,
        }
    }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Fetch<'val, SQL, ExeFut, IO, M, C> {
    fetch: FetchStream<'val, SQL, ExeFut, IO, M>,
    collect: C,
}

impl<'val, SQL, ExeFut, IO, M, C> Fetch<'val, SQL, ExeFut, IO, M, C> {
    pub fn new(
        sql: SQL,
        exe: ExeFut,
        params: Vec<Encoded<'val>>,
        collect: C,
        max_row: u32,
    ) -> Self {
        Self {
            fetch: FetchStream::new(sql, exe, params, max_row),
            collect,
        }
    }
}

impl<SQL, ExeFut, IO, M, C> Future for Fetch<'_, SQL, ExeFut, IO, M, C>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport + Unpin,
    M: StreamMap + Unpin,
    C: FetchCollect<M::Output> + Unpin,
{
    type Output = Result<C::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(r) = ready!(Pin::new(&mut me.fetch).poll_next(cx)) {
            me.collect.value(r?);
        }

        Ready(me.collect.finish(me.fetch.cmd.take()))
    }
}
