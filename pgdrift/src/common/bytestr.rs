use bytes::Bytes;
use std::{fmt, ops::Deref, str::Utf8Error};

/// A cheaply cloneable, guaranteed UTF-8 byte string.
///
/// Wraps [`Bytes`] the same way [`String`] wraps [`Vec<u8>`], avoiding a copy
/// when the bytes are already known to be valid UTF-8 (e.g. sliced out of a
/// decoded protocol message).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ByteStr(Bytes);

impl ByteStr {
    /// Construct from already UTF-8 validated bytes.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }

    /// Construct from a `&'static str` without copying.
    pub fn from_static(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }

    /// Construct by copying from a borrowed `&str`.
    pub fn copy_from_str(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        // SAFETY: construction guarantees utf8.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    /// Obtain a [`ByteStr`] sharing this instance's underlying storage for
    /// a substring of it.
    ///
    /// `subset` must be a slice coming from [`ByteStr::as_str`] on `self`, see
    /// [`Bytes::slice_ref`].
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self(self.0.slice_ref(subset.as_bytes()))
    }
}

impl Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self(Bytes::from(value.into_bytes()))
    }
}

impl From<&str> for ByteStr {
    fn from(value: &str) -> Self {
        Self::copy_from_str(value)
    }
}

impl fmt::Display for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
