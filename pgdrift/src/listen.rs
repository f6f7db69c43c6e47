//! `LISTEN`/`NOTIFY` support.
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_core::Stream;

use crate::{
    Result,
    error::{ErrorKind, ListenError},
    executor::Executor,
    postgres::{
        backend::{self, BackendMessage},
        frontend,
    },
    transport::{PgTransport, PgTransportExt},
};

/// A `NOTIFY` payload delivered on a channel subscribed via [`listen`].
#[derive(Debug, Clone)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

impl From<backend::NotificationResponse> for Notification {
    fn from(n: backend::NotificationResponse) -> Self {
        Self { process_id: n.process_id, channel: n.channel, payload: n.payload }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

async fn send_listen<IO: PgTransport>(io: &mut IO, channel: &str, unlisten: bool) -> Result<()> {
    let sql = if unlisten {
        format!("UNLISTEN {}", quote_ident(channel))
    } else {
        format!("LISTEN {}", quote_ident(channel))
    };

    io.send(frontend::Query { sql: &sql });
    io.flush().await?;

    loop {
        match io.recv::<BackendMessage>().await {
            Ok(BackendMessage::CommandComplete(_)) => continue,
            Ok(BackendMessage::ReadyForQuery(_)) => return Ok(()),
            Ok(other) => return Err(other.unexpected(if unlisten { "UNLISTEN" } else { "LISTEN" }).into()),
            Err(err) => {
                return Err(match err.kind() {
                    ErrorKind::Database(e) => ListenError { unlisten, source: e.clone() }.into(),
                    _ => err,
                });
            }
        }
    }
}

/// Begin listening on `channel`.
///
/// Issues `LISTEN` and, once the server has acknowledged it, returns a
/// [`Notifications`] stream yielding every `NOTIFY` delivered on that
/// channel for as long as the underlying connection is held.
pub async fn listen<Exe: Executor>(channel: impl Into<String>, exe: Exe) -> Result<Notifications<Exe::Transport>> {
    let channel = channel.into();
    let mut io = exe.connection().await?;

    send_listen(&mut io, &channel, false).await?;

    Ok(Notifications { io, channel })
}

/// Stream of [`Notification`]s for a channel subscribed via [`listen`].
///
/// Sends `UNLISTEN` best-effort when dropped, same as [`Transaction`][crate::transaction::Transaction]
/// rolls back on drop: fire the message and let the next use of the
/// connection drain the response.
#[must_use = "streams do nothing unless polled"]
pub struct Notifications<IO: PgTransport> {
    io: IO,
    channel: String,
}

impl<IO: PgTransport> Notifications<IO> {
    /// The channel this stream is listening on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl<IO: PgTransport> Stream for Notifications<IO> {
    type Item = Result<Notification>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            return match ready!(this.io.poll_recv::<BackendMessage>(cx)) {
                Ok(BackendMessage::NotificationResponse(n)) => Poll::Ready(Some(Ok(n.into()))),
                Ok(_other) => continue,
                Err(err) => Poll::Ready(Some(Err(err))),
            };
        }
    }
}

impl<IO: PgTransport> Drop for Notifications<IO> {
    fn drop(&mut self) {
        self.io.send(frontend::Query { sql: &format!("UNLISTEN {}", quote_ident(&self.channel)) });
        self.io.ready_request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_and_escapes_channel_identifiers() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }
}
