use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{Instant, Sleep, sleep},
};

use super::{PoolConfig, config::BackoffConfig};
use crate::{Connection, Result, common::verbose as trace, error::PoolShutdown};

/// Cadence of the maintenance cycle (idle eviction + keepalive) when the pool
/// has no [`KeepaliveConfig`][super::KeepaliveConfig] configured.
const DEFAULT_CYCLE: Duration = Duration::from_secs(3);

pub struct WorkerHandle {
    send: UnboundedSender<WorkerMessage>,
    state: State,
}

enum State {
    Idle,
    Recv(AcquireRecv),
}

impl WorkerHandle {
    pub fn new(config: PoolConfig) -> (Self, WorkerFuture) {
        let (send, recv) = mpsc::unbounded_channel();
        (
            Self { send, state: State::Idle },
            WorkerFuture {
                started: Instant::now(),
                config,
                actives: 0,
                connect_attempts: 0,
                conns: VecDeque::new(),
                sleep: Box::pin(sleep(DEFAULT_CYCLE)),
                backoff_sleep: None,
                recv,
                queue: VecDeque::with_capacity(1),
                connecting: None,
                healthcheck: None,
                closing: None,
                draining: None,
            },
        )
    }

    pub fn poll_acquire(&mut self, cx: &mut Context) -> Poll<Result<Connection>> {
        loop {
            match &mut self.state {
                State::Idle => {
                    let (tx,rx) = oneshot::channel();
                    if self.send.send(WorkerMessage::Acquire(tx)).is_err() {
                        return Poll::Ready(Err(PoolShutdown.into()));
                    }
                    self.state = State::Recv(rx);
                }
                State::Recv(recv) => {
                    let pin = Pin::new(recv);
                    let result = match ready!(oneshot::Receiver::poll(pin, cx)) {
                        Ok(result) => result,
                        Err(_) => Err(PoolShutdown.into()),
                    };
                    self.state = State::Idle;
                    return Poll::Ready(result);
                }
            }
        }
    }

    pub fn release(&self, conn: Connection) {
        // Worker task closed (pool shutdown): drop releases the connection,
        // which is the best we can do without a running event loop to hand it to.
        let _ = self.send.send(WorkerMessage::Release(conn));
    }
}

impl Clone for WorkerHandle {
    fn clone(&self) -> Self {
        Self {
            send: self.send.clone(),
            state: State::Idle,
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerHandle")
    }
}

struct PoolConnection {
    /// Instant this connection became idle; used for both keepalive cadence
    /// and idle-eviction-timeout comparisons.
    since: Instant,
    conn: Connection,
}

impl PoolConnection {
    fn new(conn: Connection, instant: Instant) -> Self {
        Self { since: instant, conn }
    }

    fn should_healthcheck(&self, frequency: Duration) -> bool {
        self.since.elapsed() > frequency
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.since.elapsed() > timeout
    }

    fn poll_healthcheck(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        self.conn.poll_ready(cx)
    }

    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.conn.poll_shutdown(cx)
    }
}

type AcquireSend = oneshot::Sender<Result<Connection>>;
type AcquireRecv = oneshot::Receiver<Result<Connection>>;

enum WorkerMessage {
    Acquire(AcquireSend),
    Release(Connection),
}

pub struct WorkerFuture {
    config: PoolConfig,
    started: Instant,

    actives: usize,
    connect_attempts: u32,

    /// - new conn is pushed back
    /// - acquire conn is poped front
    /// - released conn is pushed back
    /// - healthcheck is swap taken out from the front with the back
    /// - healthcheck ok is pushed front
    ///
    /// front queue is the most fresh connection
    conns: VecDeque<PoolConnection>,
    queue: VecDeque<AcquireSend>,

    sleep: Pin<Box<Sleep>>,
    backoff_sleep: Option<Pin<Box<Sleep>>>,
    recv: UnboundedReceiver<WorkerMessage>,

    connecting: Option<ConnectFuture>,
    healthcheck: Option<PoolConnection>,
    closing: Option<PoolConnection>,

    /// Connections being drained (gracefully closed) during shutdown, once
    /// every [`WorkerHandle`] has been dropped.
    draining: Option<VecDeque<PoolConnection>>,
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send + Sync + 'static>>;

/// Duration until the next maintenance cycle: the least time to the next
/// keepalive or idle-eviction deadline among current idle connections.
fn reset_sleep_time(conns: &VecDeque<PoolConnection>, config: &PoolConfig, sleep: Pin<&mut Sleep>) {
    let cadence = config.keepalive.as_ref().map(|k| k.frequency).unwrap_or(DEFAULT_CYCLE);
    let horizon = config.idle_timeout.unwrap_or(cadence).min(cadence);

    let least_time = conns.iter().fold(horizon, |acc, n| {
        (horizon.saturating_sub(n.since.elapsed())).min(acc)
    });

    trace!("Cycle reset to: {least_time:?}");

    sleep.reset(Instant::now() + least_time);
}

/// Jittered exponential backoff: `min(cap, base * 2^attempts) + jitter(0..base)`.
fn backoff_duration(backoff: BackoffConfig, attempts: u32) -> Duration {
    let exp = backoff.base.saturating_mul(1u32.checked_shl(attempts).unwrap_or(u32::MAX));
    let capped = exp.min(backoff.cap);
    let jitter = Duration::from_secs_f64(backoff.base.as_secs_f64() * rand::random::<f64>());
    capped + jitter
}

/// Handle connection that is not yet in idle queue.
fn new_connection(
    mut conn: Connection,
    queue: &mut VecDeque<AcquireSend>,
    conns: &mut VecDeque<PoolConnection>,
    instant: Instant,
    is_fresh: bool,
) {
    while let Some(send) = queue.pop_front() {
        if let Err(Ok(_conn)) = send.send(Ok(conn)) {
            conn = _conn;
            continue;
        }

        return;
    }

    if is_fresh {
        conns.push_front(PoolConnection::new(conn, instant));
    } else {
        conns.push_back(PoolConnection::new(conn, instant));
    }
}

/// Admission per §4.5: idle hand-off, soft-limit spawn, or burst up to the
/// hard limit when a waiter is already pending.
fn maybe_spawn_connection(
    config: &PoolConfig,
    actives: usize,
    queue_has_waiter: bool,
    connecting: &mut Option<ConnectFuture>,
    backoff_sleep: &Option<Pin<Box<Sleep>>>,
) {
    if connecting.is_some() || backoff_sleep.is_some() {
        return;
    }

    let admits = actives < config.max_conn || (queue_has_waiter && actives < config.max_conn_hard);
    if admits {
        *connecting = Some(Box::pin(Connection::connect_with(config.conn.clone())));
    }
}

impl Future for WorkerFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let WorkerFuture {
            started, config, actives, connect_attempts, sleep, backoff_sleep, conns,
            recv, queue,
            connecting, healthcheck, closing, draining,
        } = self.as_mut().get_mut();

        macro_rules! tracew {
            ($prefix:literal) => {
                trace!(
                    "{:11}: Active={actives}, Idle={}, Connecting={}, Healthcheck={}, Closing={}",
                    $prefix,
                    conns.len(),
                    connecting.is_some() as u8,
                    healthcheck.is_some() as u8,
                    closing.is_some() as u8,
                );
            };
        }

        if let Some(draining) = draining {
            while let Some(mut conn) = draining.pop_front() {
                match conn.poll_shutdown(cx) {
                    Poll::Ready(result) => {
                        if let Err(_err) = result {
                            #[cfg(feature = "log")]
                            log::error!("close error during shutdown: {_err}");
                        }
                    }
                    Poll::Pending => {
                        draining.push_front(conn);
                        return Poll::Pending;
                    }
                }
            }
            return Poll::Ready(());
        }

        // PERF: maybe we can have multiple slot for connecting futures ?

        // NOTE:
        // 1. Collect all request upfront
        // 2. Poll any connection futures
        // With the highest chance of connection available:
        // 3. Try to fulfill Queues

        while let Poll::Ready(msg) = recv.poll_recv(cx) {
            let Some(msg) = msg else {
                // all Pools handle are dropped: drain everything gracefully
                // before declaring the worker done.
                let mut pending = VecDeque::new();
                pending.extend(conns.drain(..));
                pending.extend(healthcheck.take());
                pending.extend(closing.take());
                connecting.take();
                *draining = Some(pending);

                let pending = draining.as_mut().unwrap();
                while let Some(mut conn) = pending.pop_front() {
                    match conn.poll_shutdown(cx) {
                        Poll::Ready(result) => {
                            if let Err(_err) = result {
                                #[cfg(feature = "log")]
                                log::error!("close error during shutdown: {_err}");
                            }
                        }
                        Poll::Pending => {
                            pending.push_front(conn);
                            return Poll::Pending;
                        }
                    }
                }
                return Poll::Ready(());
            };

            use WorkerMessage::*;
            match msg {
                Acquire(send) => {
                    match conns.pop_front() {
                        Some(conn) => {
                            let since = conn.since;
                            if let Err(Ok(conn)) = send.send(Ok(conn.conn)) {
                                conns.push_front(PoolConnection::new(conn, since));
                            }
                        },
                        None => {
                            queue.push_back(send);
                            maybe_spawn_connection(config, *actives, true, connecting, backoff_sleep);
                        },
                    }

                    tracew!("Acquired");
                },
                Release(mut conn) => {
                    if healthcheck.is_none() {
                        // `poll_ready` is most likely to resolved in one poll
                        match conn.poll_ready(cx) {
                            Poll::Ready(Ok(_)) => {
                                new_connection(conn, queue, conns, Instant::now(), true);
                            },
                            Poll::Ready(Err(_err)) => {
                                #[cfg(feature = "log")]
                                log::error!("healthcheck error: {_err}");

                                *actives = actives.saturating_sub(1);
                                if closing.is_some() {
                                    drop(conn);
                                } else {
                                    *closing = Some(PoolConnection::new(conn, *started));
                                }
                            },
                            Poll::Pending => {
                                *healthcheck = Some(PoolConnection::new(conn, *started));
                            },
                        }
                    } else {
                        new_connection(conn, queue, conns, *started, false);
                    }

                    tracew!("Released");
                }
            }
        }

        if let Some(Poll::Ready(result)) = connecting.as_mut().map(|e|e.as_mut().poll(cx)) {
            connecting.take();
            match result {
                Ok(conn) => {
                    *actives += 1;
                    *connect_attempts = 0;
                    new_connection(conn, queue, conns, Instant::now(), true);

                    tracew!("New");
                },
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!("failed to connect: {err}");

                    if let Some(send) = queue.pop_front() {
                        let _ = send.send(Err(err));
                    }

                    let wait = backoff_duration(config.backoff, *connect_attempts);
                    *connect_attempts = connect_attempts.saturating_add(1);
                    *backoff_sleep = Some(Box::pin(sleep(wait)));

                    trace!("connect backoff: {wait:?} (attempt {connect_attempts})");
                },
            }
        }

        if let Some(Poll::Ready(())) = backoff_sleep.as_mut().map(|s| s.as_mut().poll(cx)) {
            backoff_sleep.take();
            if !queue.is_empty() {
                maybe_spawn_connection(config, *actives, true, connecting, backoff_sleep);
            }
        }

        if let Some(Poll::Ready(result)) = healthcheck.as_mut().map(|e|e.poll_healthcheck(cx)) {
            let conn = healthcheck.take().unwrap();
            match result {
                Ok(()) => {
                    new_connection(conn.conn, queue, conns, Instant::now(), true);
                },
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::error!("healthcheck error: {_err}");

                    *actives = actives.saturating_sub(1);
                    if closing.is_some() {
                        drop(conn);
                    } else {
                        *closing = Some(conn);
                    }
                },
            }

            // there maybe canceled healthcheck on connection release or healthcheck interval
            reset_sleep_time(conns, config, sleep.as_mut());

            tracew!("Healthchecked");
        }

        if let Some(Poll::Ready(result)) = closing.as_mut().map(|e|e.poll_shutdown(cx)) {
            let _conn = closing.take().unwrap();

            if let Err(_err) = result {
                #[cfg(feature = "log")]
                log::error!("close error: {_err}");
            }

            tracew!("Closed");
        }

        if let Poll::Ready(()) = sleep.as_mut().poll(cx) {
            // healthcheck success will call this back
            if healthcheck.is_none() {
                let idle_timeout = config.idle_timeout;
                let keepalive = config.keepalive.as_ref();

                let evictable = idle_timeout
                    .filter(|_| conns.len() > config.min_conn)
                    .and_then(|timeout| conns.iter().rev().position(|e| e.is_expired(timeout)))
                    .map(|i| conns.len() - 1 - i);

                if let Some(i) = evictable {
                    let conn = conns.swap_remove_back(i).unwrap();
                    reset_sleep_time(conns, config, sleep.as_mut());
                    *actives = actives.saturating_sub(1);
                    if closing.is_none() {
                        *closing = Some(conn);
                    }
                } else if let Some(keepalive) = keepalive {
                    let idx = conns.iter().rev().position(|e| e.should_healthcheck(keepalive.frequency))
                        .map(|i| conns.len() - 1 - i);
                    if let Some(i) = idx {
                        let mut conn = conns.swap_remove_back(i).unwrap();

                        reset_sleep_time(conns, config, sleep.as_mut());

                        // Healthcheck can possibly `Ready` in one poll
                        match conn.poll_healthcheck(cx) {
                            Poll::Ready(Ok(_)) => {
                                new_connection(conn.conn, queue, conns, Instant::now(), true);
                            },
                            Poll::Ready(Err(_err)) => {
                                #[cfg(feature = "log")]
                                log::error!("healthcheck error: {_err}");

                                *actives = actives.saturating_sub(1);
                                if closing.is_some() {
                                    drop(conn);
                                } else {
                                    *closing = Some(conn);
                                }
                            },
                            Poll::Pending => {
                                *healthcheck = Some(conn);
                            },
                        }

                    } else {
                        reset_sleep_time(conns, config, sleep.as_mut());
                    }
                } else {
                    reset_sleep_time(conns, config, sleep.as_mut());
                }
            }

            tracew!("Cycled");
        }

        // ensure we have at least `min_conn` connections alive
        while *actives < config.min_conn && connecting.is_none() && backoff_sleep.is_none() {
            *connecting = Some(Box::pin(Connection::connect_with(config.conn.clone())));
            break;
        }

        while let Some(send) = queue.pop_front() {
            match conns.pop_front() {
                Some(conn) => {
                    let since = conn.since;
                    if let Err(Ok(conn)) = send.send(Ok(conn.conn)) {
                        conns.push_front(PoolConnection::new(conn, since));
                    }
                },
                None => {
                    queue.push_front(send);
                    maybe_spawn_connection(config, *actives, true, connecting, backoff_sleep);
                    break;
                },
            }
        }

        trace!("{:-<11}: Backpressured: {}", "", queue.len());

        Poll::Pending
    }
}
