//! Bind-parameter encoding.
//!
//! Mirrors [`crate::row::Decode`] on the way out: a value that knows its own
//! wire OID and how to turn itself into a parameter's binary representation.

use crate::postgres::pg_type::{Oid, PgType};

/// A value ready to be sent as a bind parameter.
///
/// `None` encodes as a SQL NULL (zero-length, parameter format code
/// untouched).
pub struct Encoded<'val> {
    oid: Oid,
    value: Option<EncodedValue<'val>>,
}

enum EncodedValue<'val> {
    Owned(Vec<u8>),
    Borrowed(&'val [u8]),
}

impl<'val> Encoded<'val> {
    pub fn null(oid: Oid) -> Self {
        Self { oid, value: None }
    }

    pub fn owned(value: impl Into<Vec<u8>>, oid: Oid) -> Self {
        Self { oid, value: Some(EncodedValue::Owned(value.into())) }
    }

    pub fn borrowed(oid: Oid, bytes: &'val [u8]) -> Self {
        Self { oid, value: Some(EncodedValue::Borrowed(bytes)) }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn value(&self) -> Option<&[u8]> {
        match &self.value {
            Some(EncodedValue::Owned(b)) => Some(b),
            Some(EncodedValue::Borrowed(b)) => Some(b),
            None => None,
        }
    }
}

/// Encode a Rust value into its Postgres binary wire representation.
pub trait Encode<'val> {
    /// The wire OID this value will be sent as.
    const OID: Oid;

    /// Consume self into its wire representation.
    fn encode(self) -> Encoded<'val>;
}

impl<'val, T> Encode<'val> for Option<T>
where
    T: Encode<'val>,
{
    const OID: Oid = T::OID;

    fn encode(self) -> Encoded<'val> {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(Self::OID),
        }
    }
}

impl Encode<'static> for bool {
    const OID: Oid = <bool as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(vec![self as u8], Self::OID)
    }
}

impl Encode<'static> for i16 {
    const OID: Oid = <i16 as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self.to_be_bytes().to_vec(), Self::OID)
    }
}

impl Encode<'static> for i32 {
    const OID: Oid = <i32 as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self.to_be_bytes().to_vec(), Self::OID)
    }
}

impl Encode<'static> for i64 {
    const OID: Oid = <i64 as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self.to_be_bytes().to_vec(), Self::OID)
    }
}

impl Encode<'static> for f32 {
    const OID: Oid = <f32 as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self.to_be_bytes().to_vec(), Self::OID)
    }
}

impl Encode<'static> for f64 {
    const OID: Oid = <f64 as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self.to_be_bytes().to_vec(), Self::OID)
    }
}

impl<'val> Encode<'val> for &'val str {
    const OID: Oid = <str as PgType>::OID;

    fn encode(self) -> Encoded<'val> {
        Encoded::borrowed(Self::OID, self.as_bytes())
    }
}

impl Encode<'static> for String {
    const OID: Oid = <str as PgType>::OID;

    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self, Self::OID)
    }
}

impl<'val> Encode<'val> for &'val [u8] {
    const OID: Oid = crate::postgres::pg_type::BYTEA;

    fn encode(self) -> Encoded<'val> {
        Encoded::borrowed(Self::OID, self)
    }
}
