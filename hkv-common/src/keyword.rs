//! # Protocol Keywords
//!
//! Purpose: Describe command verbs and inline keywords (`AFTER`, `EX`,
//! `GETNAME`, ...) through a small capability trait instead of one closed
//! enumeration, so deployments can plug in module commands without touching
//! this crate.
//!
//! ## Design Principles
//! 1. **Capability over Membership**: Anything with a name and a wire
//!    identity is a keyword.
//! 2. **Static Catalogs**: The built-in verbs and keywords are plain enums
//!    that implement the trait, keeping the common path allocation-free.
//! 3. **Case-Insensitive Lookup**: `FromStr` accepts any ASCII case.

use std::fmt;
use std::str::FromStr;

/// A command verb or keyword that can be written on the wire.
pub trait ProtocolKeyword: fmt::Debug + Send + Sync {
    /// Symbolic name, used for logging and rendering.
    fn name(&self) -> &str;

    /// Bytes written on the wire. Defaults to the name.
    fn as_bytes(&self) -> &[u8] {
        self.name().as_bytes()
    }
}

/// Returns true when both keywords have the same wire identity.
pub fn same_keyword(a: &dyn ProtocolKeyword, b: &dyn ProtocolKeyword) -> bool {
    a.as_bytes().eq_ignore_ascii_case(b.as_bytes())
}

/// Error returned when a name does not belong to a built-in catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown keyword: {0}")]
pub struct UnknownKeyword(pub String);

macro_rules! keyword_catalog {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every member of the catalog, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire name of the member.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl ProtocolKeyword for $name {
            fn name(&self) -> &str {
                self.as_str()
            }
        }

        impl FromStr for $name {
            type Err = UnknownKeyword;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|member| member.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| UnknownKeyword(s.to_string()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

keyword_catalog! {
    /// Built-in command verbs.
    CommandType {
        // connection
        AUTH => "AUTH",
        CLIENT => "CLIENT",
        ECHO => "ECHO",
        PING => "PING",
        QUIT => "QUIT",
        SELECT => "SELECT",
        // server
        DBSIZE => "DBSIZE",
        INFO => "INFO",
        ROLE => "ROLE",
        TIME => "TIME",
        // keys
        DEL => "DEL",
        EXISTS => "EXISTS",
        EXPIRE => "EXPIRE",
        KEYS => "KEYS",
        PTTL => "PTTL",
        RANDOMKEY => "RANDOMKEY",
        SCAN => "SCAN",
        TTL => "TTL",
        TYPE => "TYPE",
        // strings
        APPEND => "APPEND",
        DECR => "DECR",
        GET => "GET",
        GETRANGE => "GETRANGE",
        INCR => "INCR",
        MGET => "MGET",
        MSET => "MSET",
        SET => "SET",
        STRLEN => "STRLEN",
        // hashes
        HEXISTS => "HEXISTS",
        HGET => "HGET",
        HGETALL => "HGETALL",
        HKEYS => "HKEYS",
        HLEN => "HLEN",
        HMGET => "HMGET",
        HSET => "HSET",
        HVALS => "HVALS",
        // lists
        LINDEX => "LINDEX",
        LINSERT => "LINSERT",
        LLEN => "LLEN",
        LPUSH => "LPUSH",
        LRANGE => "LRANGE",
        RPUSH => "RPUSH",
        // sets
        SADD => "SADD",
        SCARD => "SCARD",
        SISMEMBER => "SISMEMBER",
        SMEMBERS => "SMEMBERS",
        // sorted sets
        ZADD => "ZADD",
        ZCARD => "ZCARD",
        ZRANGE => "ZRANGE",
        ZRANK => "ZRANK",
        ZSCORE => "ZSCORE",
        // pub/sub
        PSUBSCRIBE => "PSUBSCRIBE",
        PUBLISH => "PUBLISH",
        SUBSCRIBE => "SUBSCRIBE",
        UNSUBSCRIBE => "UNSUBSCRIBE",
        // monitoring
        SENTINEL => "SENTINEL",
    }
}

keyword_catalog! {
    /// Built-in keywords used inside argument lists.
    CommandKeyword {
        AFTER => "AFTER",
        BEFORE => "BEFORE",
        EX => "EX",
        GETNAME => "GETNAME",
        GET_MASTER_ADDR_BY_NAME => "GET-MASTER-ADDR-BY-NAME",
        MASTERS => "MASTERS",
        NX => "NX",
        PX => "PX",
        REPLICAS => "REPLICAS",
        SETNAME => "SETNAME",
        SLAVES => "SLAVES",
        WITHSCORES => "WITHSCORES",
        XX => "XX",
    }
}

/// Keyword defined at runtime, e.g. a module command such as `JSON.GET`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomKeyword {
    name: String,
}

impl CustomKeyword {
    pub fn new(name: impl Into<String>) -> Self {
        CustomKeyword { name: name.into() }
    }
}

impl ProtocolKeyword for CustomKeyword {
    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CustomKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_names() {
        assert_eq!("APPEND".parse::<CommandType>(), Ok(CommandType::APPEND));
        assert_eq!("after".parse::<CommandKeyword>(), Ok(CommandKeyword::AFTER));
        assert_eq!(
            "get-master-addr-by-name".parse::<CommandKeyword>(),
            Ok(CommandKeyword::GET_MASTER_ADDR_BY_NAME)
        );
        assert!("NOPE".parse::<CommandType>().is_err());
    }

    #[test]
    fn custom_keyword_matches_builtin_identity() {
        let custom = CustomKeyword::new("get");
        assert!(same_keyword(&custom, &CommandType::GET));
        assert!(!same_keyword(&custom, &CommandType::SET));
    }
}
