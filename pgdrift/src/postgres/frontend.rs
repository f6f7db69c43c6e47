//! Postgres frontend (client to server) messages.
use bytes::{BufMut, BytesMut};

use crate::encode::Encoded;
use crate::ext::{BufMutExt, StrExt, UsizeExt};

use super::PgFormat;

/// Write a frontend message to `buf`, framed with its 1-byte tag and 4-byte length.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::FORMAT);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    debug_assert_eq!(
        buf[offset..].len(),
        PREFIX + size as usize,
        "frontend message body did not match its size hint"
    );
}

/// A type that can be encoded into a postgres frontend message.
pub trait FrontendProtocol {
    /// Message tag byte.
    const FORMAT: u8;

    /// Size of the main body, not counting the tag byte and length prefix.
    fn size_hint(&self) -> i32;

    /// Write the main body of the message; `buf` is pre-sized to `size_hint()`.
    fn encode(self, buf: impl BufMut);
}

/// The first message sent by the client, before authentication.
///
/// Has no type byte, so it does not implement [`FrontendProtocol`].
#[derive(Debug)]
pub struct Startup<'a> {
    pub user: &'a str,
    pub database: Option<&'a str>,
    pub replication: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        buf.put_u32(0);
        buf.put_i32(196_608);

        buf.put_slice(b"user\0");
        buf.put_slice(self.user.as_bytes());
        buf.put_u8(0);

        if let Some(db) = self.database {
            buf.put_slice(b"database\0");
            buf.put_slice(db.as_bytes());
            buf.put_u8(0);
        }

        if let Some(repl) = self.replication {
            buf.put_slice(b"replication\0");
            buf.put_slice(repl.as_bytes());
            buf.put_u8(0);
        }

        buf.put_u8(0);

        let len = (buf.len() - offset).to_u32();
        (&mut buf[offset..]).put_u32(len);
    }
}

/// Requests the server negotiate SSL/TLS before the startup message.
///
/// Also has no type byte; the reply is a single byte, `'S'` or `'N'`.
#[derive(Debug)]
pub struct SSLRequest;

impl SSLRequest {
    pub const CODE: i32 = 80_877_103;

    pub fn write(buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(Self::CODE);
    }
}

#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const FORMAT: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len() as i32
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// `SASLInitialResponse`, the first message of a SASL authentication exchange.
#[derive(Debug)]
pub struct SASLInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendProtocol for SASLInitialResponse<'_> {
    const FORMAT: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.mechanism.nul_string_len() as i32 + 4 + self.data.len().to_u32() as i32
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.mechanism);
        buf.put_i32(self.data.len().to_u32() as i32);
        buf.put_slice(self.data);
    }
}

/// A later message in the SASL exchange, carrying client response data only.
#[derive(Debug)]
pub struct SASLResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for SASLResponse<'_> {
    const FORMAT: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_u32() as i32
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a simple query.
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const FORMAT: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_string_len() as i32
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command.
pub struct Parse<'a> {
    pub prepare_name: &'a str,
    pub sql: &'a str,
    pub param_oids: &'a [super::Oid],
}

impl FrontendProtocol for Parse<'_> {
    const FORMAT: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.prepare_name.nul_string_len() as i32
            + self.sql.nul_string_len() as i32
            + 2
            + self.param_oids.len().to_u32() as i32 * 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_i16(self.param_oids.len().to_u16() as i16);
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Bind command.
pub struct Bind<'a> {
    pub portal_name: &'a str,
    pub prepare_name: &'a str,
    pub params: &'a [Encoded<'a>],
    pub result_format: PgFormat,
}

impl FrontendProtocol for Bind<'_> {
    const FORMAT: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() as i32
            + self.prepare_name.nul_string_len() as i32
            + 2 + (self.params.len().to_u32() as i32 * 2) // param format codes, all binary
            + 2 // param count
            + self.params.iter().fold(0i32, |acc, p| {
                acc + 4 + p.value().map_or(0, |v| v.len().to_u32() as i32)
            })
            + 2 // result format count
            + 2 // single result format code
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.prepare_name);

        // all parameters use binary format
        buf.put_i16(1);
        buf.put_i16(PgFormat::Binary as i16);

        buf.put_i16(self.params.len().to_u16() as i16);
        for param in self.params {
            match param.value() {
                Some(bytes) => {
                    buf.put_i32(bytes.len().to_u32() as i32);
                    buf.put_slice(bytes);
                }
                None => buf.put_i32(-1),
            }
        }

        buf.put_i16(1);
        buf.put_i16(self.result_format as i16);
    }
}

/// What a [`Close`] or [`Describe`] command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn byte(self) -> u8 {
        match self {
            Self::Statement => b'S',
            Self::Portal => b'P',
        }
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const FORMAT: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len() as i32
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.target.byte());
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Close command.
pub struct Close<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const FORMAT: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len() as i32
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.target.byte());
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as an Execute command.
///
/// `max_row` is always sent as `0` (no limit); a nonzero value would make the
/// server reply with `PortalSuspended`, which this driver never handles.
pub struct Execute<'a> {
    pub portal_name: &'a str,
}

impl FrontendProtocol for Execute<'_> {
    const FORMAT: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() as i32 + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_i32(0);
    }
}

/// Identifies the message as a Sync command.
pub struct Sync;

impl FrontendProtocol for Sync {
    const FORMAT: u8 = b'S';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}

/// Identifies the message as a Flush command.
pub struct Flush;

impl FrontendProtocol for Flush {
    const FORMAT: u8 = b'H';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}

/// Identifies the message as a termination.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const FORMAT: u8 = b'X';

    fn size_hint(&self) -> i32 {
        0
    }

    fn encode(self, _: impl BufMut) {}
}
