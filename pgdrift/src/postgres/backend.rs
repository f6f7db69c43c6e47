//! Postgres backend (server to client) messages.
use bytes::{Buf, Bytes};

use super::ProtocolError;
use crate::common::ByteStr;

/// A type that can be decoded from a backend message body.
///
/// `msgtype` is the single byte message tag read off the wire; `body` is the
/// message content with the 4-byte length prefix already stripped.
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

macro_rules! assert_msgtype {
    ($ty:ty, $msgtype:ident) => {
        if $msgtype != <$ty>::MSGTYPE {
            return Err(ProtocolError::unexpected($msgtype, stringify!($ty)));
        }
    };
}

fn nul_bytestr(body: &mut Bytes) -> Result<ByteStr, ProtocolError> {
    let end = body
        .iter()
        .position(|b| *b == b'\0')
        .ok_or_else(|| ProtocolError::new("message string is not nul terminated"))?;
    let s = body.split_to(end);
    body.advance(1);
    ByteStr::from_utf8(s).map_err(|e| ProtocolError::new(format!("non UTF-8 string: {e}")))
}

/// Any backend message.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    ParameterStatus(ParameterStatus),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CommandComplete(CommandComplete),
    EmptyQueryResponse(EmptyQueryResponse),
    ParseComplete(ParseComplete),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    NoData(NoData),
    PortalSuspended(PortalSuspended),
    ParameterDescription(ParameterDescription),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ErrorResponse(ErrorResponse),
}

impl BackendMessage {
    /// Build a [`ProtocolError`] describing this message as unexpected in `context`.
    pub fn unexpected(&self, context: &str) -> ProtocolError {
        ProtocolError::new(format!("unexpected {self:?} during {context}"))
    }

    pub fn msgtype(&self) -> u8 {
        match self {
            Self::Authentication(_) => Authentication::MSGTYPE,
            Self::BackendKeyData(_) => BackendKeyData::MSGTYPE,
            Self::ParameterStatus(_) => ParameterStatus::MSGTYPE,
            Self::ReadyForQuery(_) => ReadyForQuery::MSGTYPE,
            Self::RowDescription(_) => RowDescription::MSGTYPE,
            Self::DataRow(_) => DataRow::MSGTYPE,
            Self::CommandComplete(_) => CommandComplete::MSGTYPE,
            Self::EmptyQueryResponse(_) => EmptyQueryResponse::MSGTYPE,
            Self::ParseComplete(_) => ParseComplete::MSGTYPE,
            Self::BindComplete(_) => BindComplete::MSGTYPE,
            Self::CloseComplete(_) => CloseComplete::MSGTYPE,
            Self::NoData(_) => NoData::MSGTYPE,
            Self::PortalSuspended(_) => PortalSuspended::MSGTYPE,
            Self::ParameterDescription(_) => ParameterDescription::MSGTYPE,
            Self::NoticeResponse(_) => NoticeResponse::MSGTYPE,
            Self::NotificationResponse(_) => NotificationResponse::MSGTYPE,
            Self::ErrorResponse(_) => ErrorResponse::MSGTYPE,
        }
    }
}

impl BackendProtocol for BackendMessage {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        Ok(match msgtype {
            Authentication::MSGTYPE => Self::Authentication(Authentication::decode(msgtype, body)?),
            BackendKeyData::MSGTYPE => Self::BackendKeyData(BackendKeyData::decode(msgtype, body)?),
            ParameterStatus::MSGTYPE => Self::ParameterStatus(ParameterStatus::decode(msgtype, body)?),
            ReadyForQuery::MSGTYPE => Self::ReadyForQuery(ReadyForQuery::decode(msgtype, body)?),
            RowDescription::MSGTYPE => Self::RowDescription(RowDescription::decode(msgtype, body)?),
            DataRow::MSGTYPE => Self::DataRow(DataRow::decode(msgtype, body)?),
            CommandComplete::MSGTYPE => Self::CommandComplete(CommandComplete::decode(msgtype, body)?),
            EmptyQueryResponse::MSGTYPE => Self::EmptyQueryResponse(EmptyQueryResponse::decode(msgtype, body)?),
            ParseComplete::MSGTYPE => Self::ParseComplete(ParseComplete::decode(msgtype, body)?),
            BindComplete::MSGTYPE => Self::BindComplete(BindComplete::decode(msgtype, body)?),
            CloseComplete::MSGTYPE => Self::CloseComplete(CloseComplete::decode(msgtype, body)?),
            NoData::MSGTYPE => Self::NoData(NoData::decode(msgtype, body)?),
            PortalSuspended::MSGTYPE => Self::PortalSuspended(PortalSuspended::decode(msgtype, body)?),
            ParameterDescription::MSGTYPE => Self::ParameterDescription(ParameterDescription::decode(msgtype, body)?),
            NoticeResponse::MSGTYPE => Self::NoticeResponse(NoticeResponse::decode(msgtype, body)?),
            NotificationResponse::MSGTYPE => Self::NotificationResponse(NotificationResponse::decode(msgtype, body)?),
            ErrorResponse::MSGTYPE => Self::ErrorResponse(ErrorResponse::decode(msgtype, body)?),
            f => return Err(ProtocolError::new(format!("unsupported backend message {:?}", f as char))),
        })
    }
}

/// Identifies the message as an authentication request.
#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    KerberosV5,
    CleartextPassword,
    MD5Password { salt: [u8; 4] },
    SCMCredential,
    GSS,
    SSPI,
    SASL { mechanisms: Vec<String> },
    SASLContinue(Bytes),
    SASLFinal(Bytes),
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(match body.get_i32() {
            0 => Self::Ok,
            2 => Self::KerberosV5,
            3 => Self::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Self::MD5Password { salt }
            }
            6 => Self::SCMCredential,
            7 => Self::GSS,
            9 => Self::SSPI,
            10 => {
                let mut mechanisms = vec![];
                while body.first().is_some_and(|b| *b != b'\0') {
                    mechanisms.push(nul_bytestr(&mut body)?.to_string());
                }
                Self::SASL { mechanisms }
            }
            11 => Self::SASLContinue(body),
            12 => Self::SASLFinal(body),
            n => return Err(ProtocolError::new(format!("unknown authentication method {n}"))),
        })
    }
}

/// Identifies the message as cancellation key data.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self { process_id: body.get_i32(), secret_key: body.get_i32() })
    }
}

/// A run-time parameter status report.
#[derive(Debug, Clone)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self {
            name: nul_bytestr(&mut body)?.to_string(),
            value: nul_bytestr(&mut body)?.to_string(),
        })
    }
}

/// Identifies the message as the start of a backend-ready-for-query state.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// `'I'` if idle, `'T'` if in a transaction block, `'E'` if in a failed transaction block.
    pub tx_status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self { tx_status: body.get_u8() })
    }
}

/// Identifies the message as a row description.
///
/// The field descriptions are left undecoded; [`crate::row::Row`] walks this
/// body lazily instead of materializing a `Vec` up front.
#[derive(Debug, Clone)]
pub struct RowDescription(pub Bytes);

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self(body))
    }
}

/// Identifies the message as a data row, left undecoded for lazy access.
#[derive(Debug, Clone)]
pub struct DataRow(pub Bytes);

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self(body))
    }
}

macro_rules! marker_message {
    ($(#[$meta:meta])* $name:ident = $msgtype:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $msgtype;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(Self, msgtype);
                Ok(Self)
            }
        }
    };
}

marker_message!(
    /// Identifies the message as a Parse-complete indicator.
    ParseComplete = b'1'
);
marker_message!(
    /// Identifies the message as a Bind-complete indicator.
    BindComplete = b'2'
);
marker_message!(
    /// Identifies the message as a Close-complete indicator.
    CloseComplete = b'3'
);
marker_message!(
    /// Identifies the message as a no-data indicator, sent instead of `RowDescription`.
    NoData = b'n'
);
/// Identifies the message as a portal-suspended indicator.
///
/// This driver always sends `Execute` with `max_row` zero, so this is never
/// expected to arrive in practice.
marker_message!(PortalSuspended = b's');
marker_message!(
    /// Identifies the message as an empty-query response, sent for an empty query string.
    EmptyQueryResponse = b'I'
);

/// Identifies the message as a command-completed response.
#[derive(Debug, Clone)]
pub struct CommandComplete {
    pub tag: String,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        let tag = String::from_utf8(body.into())
            .map_err(|e| ProtocolError::new(format!("non UTF-8 command tag: {e}")))?;
        Ok(Self { tag })
    }
}

/// Identifies the message as a parameter description, one OID per bind parameter.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    pub oids: Vec<super::Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        let n = body.get_i16();
        let mut oids = Vec::with_capacity(n.max(0) as usize);
        for _ in 0..n {
            oids.push(body.get_u32());
        }
        Ok(Self { oids })
    }
}

/// A non-fatal message the server chose to send out of band, e.g. a WARNING.
#[derive(Debug, Clone)]
pub struct NoticeResponse {
    pub fields: Vec<(u8, String)>,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self { fields: decode_fields(body)? })
    }
}

/// Identifies the message as a LISTEN/NOTIFY payload.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            channel: nul_bytestr(&mut body)?.to_string(),
            payload: nul_bytestr(&mut body)?.to_string(),
        })
    }
}

/// Identifies the message as an error, per the SQLSTATE field taxonomy.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub fields: Vec<(u8, String)>,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    fn field(&self, code: u8) -> Option<&str> {
        self.fields.iter().find(|(c, _)| *c == code).map(|(_, v)| v.as_str())
    }

    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, or LOG.
    pub fn severity(&self) -> Option<&str> {
        self.field(b'S')
    }

    /// The SQLSTATE code for the error.
    ///
    /// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn code(&self) -> Option<&str> {
        self.field(b'C')
    }

    /// A human readable error message.
    pub fn message(&self) -> Option<&str> {
        self.field(b'M')
    }

    /// `true` if this error's class is `28` (invalid authorization specification),
    /// which per protocol always terminates the connection.
    pub fn is_authorization_failure(&self) -> bool {
        self.code().is_some_and(|c| c.starts_with("28"))
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Self, msgtype);
        Ok(Self { fields: decode_fields(body)? })
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message().unwrap_or("unknown database error"))?;
        if let Some(code) = self.code() {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorResponse {}

fn decode_fields(mut body: Bytes) -> Result<Vec<(u8, String)>, ProtocolError> {
    let mut fields = vec![];
    loop {
        let code = body.get_u8();
        if code == b'\0' {
            break;
        }
        fields.push((code, nul_bytestr(&mut body)?.to_string()));
    }
    Ok(fields)
}
