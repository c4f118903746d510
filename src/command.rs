use std::fmt;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::protocol::Reply;

/// A single command bound for a backend: verb, ordered arguments, and the
/// hash key that routes it.
///
/// The hash key is the first argument unless an explicit group was supplied
/// with [`Command::grouped`], in which case every command sharing that group
/// targets the same backend regardless of its own key.
#[derive(Debug, Clone)]
pub struct Command {
    verb: String,
    args: Vec<Bytes>,
    group: Option<Bytes>,
}

impl Command {
    pub fn new(verb: impl Into<String>, args: Vec<Bytes>) -> Result<Self> {
        let verb = verb.into();
        if verb.is_empty() {
            bail!("command verb must not be empty");
        }
        // MULTI and EXEC never carry arguments, whatever the caller passed.
        let args = if verb.eq_ignore_ascii_case("multi") || verb.eq_ignore_ascii_case("exec") {
            Vec::new()
        } else {
            args
        };
        Ok(Self {
            verb,
            args,
            group: None,
        })
    }

    /// Build a command whose hash key is an explicit group rather than its
    /// first argument, so related keys co-locate on one backend.
    pub fn grouped(
        verb: impl Into<String>,
        group: impl AsRef<[u8]>,
        args: Vec<Bytes>,
    ) -> Result<Self> {
        let mut command = Self::new(verb, args)?;
        command.group = Some(Bytes::copy_from_slice(group.as_ref()));
        Ok(command)
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The bytes the hash ring sees for this command.
    pub fn hash_key(&self) -> &[u8] {
        if let Some(group) = &self.group {
            return group.as_ref();
        }
        self.args.first().map(|arg| arg.as_ref()).unwrap_or(&[])
    }

    /// Wire representation: a RESP array of bulk strings.
    pub fn to_reply(&self) -> Reply {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(Reply::bulk(self.verb.as_bytes()));
        parts.extend(self.args.iter().cloned().map(Reply::Bulk));
        Reply::Array(parts)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// Shorthand for building argument vectors from anything byte-like.
pub fn arg(value: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(value.as_ref())
}
