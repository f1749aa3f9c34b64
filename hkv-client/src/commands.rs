//! Builders for the commands the client issues itself, plus the common
//! data verbs exposed as typed helpers.

use hkv_common::{
    Command, CommandArgs, CommandKeyword, CommandType, IntegerOutput, MapListOutput, NestedMultiOutput, StatusOutput,
    TextOutput, ValueListOutput, ValueOutput,
};

pub fn ping() -> Command<StatusOutput> {
    Command::new(CommandType::PING, StatusOutput::new())
}

pub fn get(key: impl Into<Vec<u8>>) -> Command<ValueOutput> {
    let mut args = CommandArgs::new();
    args.add_key(key);
    Command::with_args(CommandType::GET, ValueOutput::new(), args)
}

pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Command<StatusOutput> {
    let mut args = CommandArgs::new();
    args.add_key(key).add_value(value);
    Command::with_args(CommandType::SET, StatusOutput::new(), args)
}

/// `DEL key [key ...]`, returning the number of removed keys.
pub fn del<I, K>(keys: I) -> Command<IntegerOutput>
where
    I: IntoIterator<Item = K>,
    K: Into<Vec<u8>>,
{
    let mut args = CommandArgs::new();
    for key in keys {
        args.add_key(key);
    }
    Command::with_args(CommandType::DEL, IntegerOutput::new(), args)
}

/// `INFO [section]`.
pub fn info(section: Option<&str>) -> Command<TextOutput> {
    let mut args = CommandArgs::new();
    if let Some(section) = section {
        args.add_value(section);
    }
    Command::with_args(CommandType::INFO, TextOutput::new(), args)
}

pub fn client_setname(name: &str) -> Command<StatusOutput> {
    let mut args = CommandArgs::new();
    args.add_keyword(CommandKeyword::SETNAME).add_value(name);
    Command::with_args(CommandType::CLIENT, StatusOutput::new(), args)
}

pub fn client_getname() -> Command<TextOutput> {
    let mut args = CommandArgs::new();
    args.add_keyword(CommandKeyword::GETNAME);
    Command::with_args(CommandType::CLIENT, TextOutput::new(), args)
}

pub fn quit() -> Command<StatusOutput> {
    Command::new(CommandType::QUIT, StatusOutput::new())
}

/// `SENTINEL GET-MASTER-ADDR-BY-NAME name`: `[host, port]` or a null array.
pub fn sentinel_master_addr(master_name: &str) -> Command<ValueListOutput> {
    let mut args = CommandArgs::new();
    args.add_keyword(CommandKeyword::GET_MASTER_ADDR_BY_NAME).add_value(master_name);
    Command::with_args(CommandType::SENTINEL, ValueListOutput::new(), args)
}

/// `SENTINEL SLAVES name`: one field/value list per replica.
///
/// `SLAVES` is accepted by every sentinel version; `REPLICAS` only by 5.0+.
pub fn sentinel_replicas(master_name: &str) -> Command<MapListOutput> {
    let mut args = CommandArgs::new();
    args.add_keyword(CommandKeyword::SLAVES).add_value(master_name);
    Command::with_args(CommandType::SENTINEL, MapListOutput::new(), args)
}

pub fn subscribe(channel: &str) -> Command<NestedMultiOutput> {
    let mut args = CommandArgs::new();
    args.add_value(channel);
    Command::with_args(CommandType::SUBSCRIBE, NestedMultiOutput::new(), args)
}
