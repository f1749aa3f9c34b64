//! # Command Arguments
//!
//! Purpose: Ordered argument list of one request. Keys, values, integers
//! and keywords are kept apart so the list can be rendered for logs and
//! inspected (e.g. "which keywords does this request carry?") without
//! re-parsing the encoded bytes.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::keyword::ProtocolKeyword;

/// Single argument of a request.
#[derive(Debug, Clone)]
pub enum CommandArg {
    Key(Vec<u8>),
    Value(Vec<u8>),
    Integer(i64),
    Keyword(Arc<dyn ProtocolKeyword>),
}

impl CommandArg {
    fn write_wire(&self, out: &mut BytesMut) {
        match self {
            CommandArg::Key(bytes) | CommandArg::Value(bytes) => write_bulk(out, bytes),
            CommandArg::Integer(value) => write_bulk(out, value.to_string().as_bytes()),
            CommandArg::Keyword(keyword) => write_bulk(out, keyword.as_bytes()),
        }
    }
}

impl fmt::Display for CommandArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandArg::Key(bytes) | CommandArg::Value(bytes) => {
                write!(f, "{}", String::from_utf8_lossy(bytes))
            }
            CommandArg::Integer(value) => write!(f, "{}", value),
            CommandArg::Keyword(keyword) => f.write_str(keyword.name()),
        }
    }
}

/// Builder-style argument accumulator.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    args: Vec<CommandArg>,
}

impl CommandArgs {
    pub fn new() -> Self {
        CommandArgs::default()
    }

    pub fn add_key(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.args.push(CommandArg::Key(key.into()));
        self
    }

    pub fn add_value(&mut self, value: impl Into<Vec<u8>>) -> &mut Self {
        self.args.push(CommandArg::Value(value.into()));
        self
    }

    pub fn add_integer(&mut self, value: i64) -> &mut Self {
        self.args.push(CommandArg::Integer(value));
        self
    }

    /// Appends a keyword (e.g. `AFTER`, `EX`, or a custom one).
    pub fn add_keyword<K>(&mut self, keyword: K) -> &mut Self
    where
        K: ProtocolKeyword + 'static,
    {
        self.args.push(CommandArg::Keyword(Arc::new(keyword)));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandArg> {
        self.args.iter()
    }

    /// Keywords in argument order.
    pub fn keywords(&self) -> impl Iterator<Item = &dyn ProtocolKeyword> {
        self.args.iter().filter_map(|arg| match arg {
            CommandArg::Keyword(keyword) => Some(keyword.as_ref()),
            _ => None,
        })
    }

    /// First key argument, if any.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.args.iter().find_map(|arg| match arg {
            CommandArg::Key(key) => Some(key.as_slice()),
            _ => None,
        })
    }

    /// Appends the RESP2 bulk encoding of every argument.
    pub fn encode(&self, out: &mut BytesMut) {
        for arg in &self.args {
            arg.write_wire(out);
        }
    }
}

impl fmt::Display for CommandArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}", arg)?;
            first = false;
        }
        Ok(())
    }
}

pub(crate) fn write_bulk(out: &mut BytesMut, data: &[u8]) {
    out.put_u8(b'$');
    crate::resp::push_usize(out, data.len());
    out.put_slice(b"\r\n");
    out.put_slice(data);
    out.put_slice(b"\r\n");
}
