// hkv-common - Command model and reply decoding for HybridKV clients
//
// This crate defines what a request is, how replies are decoded into typed
// outputs, and the handle callers wait on.

pub mod args;
pub mod command;
pub mod error;
pub mod interrupt;
pub mod keyword;
pub mod output;
pub mod resp;

// Re-export for convenience
pub use args::{CommandArg, CommandArgs};
pub use command::{AsyncCommand, Command, CommandFuture, CommandState, QueuedCommand};
pub use error::{Cause, HkvError, HkvResult, ServerError};
pub use keyword::{same_keyword, CommandKeyword, CommandType, CustomKeyword, ProtocolKeyword, UnknownKeyword};
pub use output::{
    BooleanOutput, CommandOutput, IntegerOutput, MapListOutput, NestedMultiOutput, NestedValue, StatusOutput,
    TextOutput, ValueListOutput, ValueOutput,
};
pub use resp::{ProtocolError, RespDecoder, RespValue};
