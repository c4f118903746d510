use bytes::Bytes;

/// A reply value surfaced by a backend.
///
/// The dispatcher is command-agnostic: whatever the backend answers is
/// passed through unchanged. Application-level errors (`-ERR ...`) arrive
/// as [`Reply::Error`] and are never treated as transport failures.
/// Refused, failed, and cancelled requests deliver [`Reply::Null`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Null,
    Integer(i64),
    Bulk(Bytes),
    Status(Bytes),
    Error(Bytes),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        Reply::Bulk(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn status<T: AsRef<[u8]>>(value: T) -> Self {
        Reply::Status(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        Reply::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Payload bytes of a bulk or status reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(data) | Reply::Status(data) => Some(data.as_ref()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }
}
