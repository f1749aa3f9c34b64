//! # Command Outputs
//!
//! Purpose: Typed result sinks fed by the decode path. Each output accepts
//! the fragment representations that make sense for it and rejects the rest
//! with `HkvError::LocalUsage`.
//!
//! ## Design Principles
//! 1. **Fixed Shape**: The output type is chosen when the request is built;
//!    the decoder never guesses.
//! 2. **Zero Before Set**: `get()` before any fragment returns the type's
//!    zero value (empty string, 0, `None`, empty list).
//! 3. **Localized Element Errors**: Aggregate outputs record an error reply
//!    for one element at that element's position and keep decoding.
//!
//! ## Feeding Order
//!
//! ```text
//! *2\r\n -ERR x\r\n :1\r\n
//!   multi(2) -> set_error("ERR x") -> complete(1) -> set_integer(1) -> complete(1) -> complete(0)
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::{HkvError, HkvResult, ServerError};
use crate::resp::RespValue;

/// Accumulator for one decoded reply.
///
/// Every setter has a default that rejects the representation; outputs
/// override only what they accept.
pub trait CommandOutput: Send + fmt::Debug {
    /// Value handed to the caller.
    type Output: Clone + Send;

    /// Accepts a status or bulk payload (`None` for a null bulk).
    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        let _ = bytes;
        Err(unsupported(self, "bytes"))
    }

    /// Accepts an integer reply.
    fn set_integer(&mut self, value: i64) -> HkvResult<()> {
        let _ = value;
        Err(unsupported(self, "integer"))
    }

    /// Records an error reply for the element being decoded.
    ///
    /// Returns false when the output does not keep per-element errors; the
    /// whole command then fails with the error.
    fn set_error(&mut self, message: &[u8]) -> bool {
        let _ = message;
        false
    }

    /// Announces an array of `count` elements (`None` for a null array).
    fn multi(&mut self, count: Option<usize>) {
        let _ = count;
    }

    /// Called after each element at `depth` has been fully decoded.
    fn complete(&mut self, depth: usize) {
        let _ = depth;
    }

    /// Returns the accumulated value.
    fn get(&self) -> Self::Output;
}

fn unsupported<O: fmt::Debug + ?Sized>(output: &O, repr: &str) -> HkvError {
    HkvError::LocalUsage(format!("{:?} does not accept {} values", output, repr))
}

/// Walks a decoded frame and feeds it into `output`.
///
/// Errors at depth 0 are returned as `HkvError::Server` for the envelope to
/// store; nested error replies go to `set_error` first.
pub fn feed<O>(output: &mut O, frame: &RespValue) -> HkvResult<()>
where
    O: CommandOutput + ?Sized,
{
    feed_at(output, frame, 0)
}

fn feed_at<O>(output: &mut O, frame: &RespValue, depth: usize) -> HkvResult<()>
where
    O: CommandOutput + ?Sized,
{
    let result = match frame {
        RespValue::Simple(data) => output.set_bytes(Some(data.as_slice())),
        RespValue::Bulk(data) => output.set_bytes(data.as_deref()),
        RespValue::Integer(value) => output.set_integer(*value),
        RespValue::Error(message) => {
            if depth > 0 && output.set_error(message) {
                Ok(())
            } else {
                Err(HkvError::Server(ServerError::new(message)))
            }
        }
        RespValue::Array(None) => {
            output.multi(None);
            Ok(())
        }
        RespValue::Array(Some(items)) => {
            output.multi(Some(items.len()));
            for item in items {
                feed_at(output, item, depth + 1)?;
                output.complete(depth + 1);
            }
            Ok(())
        }
    };
    if result.is_ok() && depth == 0 {
        output.complete(0);
    }
    result
}

/// Status reply such as `OK` or `PONG`.
#[derive(Debug, Default)]
pub struct StatusOutput {
    value: Option<String>,
}

impl StatusOutput {
    pub fn new() -> Self {
        StatusOutput::default()
    }
}

impl CommandOutput for StatusOutput {
    type Output = String;

    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        self.value = bytes.map(|data| String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn get(&self) -> String {
        self.value.clone().unwrap_or_default()
    }
}

/// Integer reply.
#[derive(Debug, Default)]
pub struct IntegerOutput {
    value: i64,
}

impl IntegerOutput {
    pub fn new() -> Self {
        IntegerOutput::default()
    }
}

impl CommandOutput for IntegerOutput {
    type Output = i64;

    fn set_integer(&mut self, value: i64) -> HkvResult<()> {
        self.value = value;
        Ok(())
    }

    fn get(&self) -> i64 {
        self.value
    }
}

/// Integer reply interpreted as a flag (`:1` is true).
#[derive(Debug, Default)]
pub struct BooleanOutput {
    value: bool,
}

impl BooleanOutput {
    pub fn new() -> Self {
        BooleanOutput::default()
    }
}

impl CommandOutput for BooleanOutput {
    type Output = bool;

    fn set_integer(&mut self, value: i64) -> HkvResult<()> {
        self.value = value == 1;
        Ok(())
    }

    fn get(&self) -> bool {
        self.value
    }
}

/// Bulk reply carrying a binary value; `None` for a missing key.
#[derive(Debug, Default)]
pub struct ValueOutput {
    value: Option<Vec<u8>>,
}

impl ValueOutput {
    pub fn new() -> Self {
        ValueOutput::default()
    }
}

impl CommandOutput for ValueOutput {
    type Output = Option<Vec<u8>>;

    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        self.value = bytes.map(<[u8]>::to_vec);
        Ok(())
    }

    fn get(&self) -> Option<Vec<u8>> {
        self.value.clone()
    }
}

/// Bulk or status reply decoded as UTF-8 text (INFO, CLIENT GETNAME).
#[derive(Debug, Default)]
pub struct TextOutput {
    value: Option<String>,
}

impl TextOutput {
    pub fn new() -> Self {
        TextOutput::default()
    }
}

impl CommandOutput for TextOutput {
    type Output = Option<String>;

    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        self.value = bytes.map(|data| String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn get(&self) -> Option<String> {
        self.value.clone()
    }
}

/// Flat array of bulk values (MGET, KEYS, master address lookups).
#[derive(Debug, Default)]
pub struct ValueListOutput {
    values: Vec<Option<Vec<u8>>>,
}

impl ValueListOutput {
    pub fn new() -> Self {
        ValueListOutput::default()
    }
}

impl CommandOutput for ValueListOutput {
    type Output = Vec<Option<Vec<u8>>>;

    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        self.values.push(bytes.map(<[u8]>::to_vec));
        Ok(())
    }

    fn multi(&mut self, count: Option<usize>) {
        if let Some(count) = count {
            self.values.reserve(count);
        }
    }

    fn get(&self) -> Vec<Option<Vec<u8>>> {
        self.values.clone()
    }
}

/// Array of flat field/value arrays, e.g. `SENTINEL REPLICAS`.
#[derive(Debug, Default)]
pub struct MapListOutput {
    maps: Vec<HashMap<String, String>>,
    pending_field: Option<String>,
    outer: bool,
}

impl MapListOutput {
    pub fn new() -> Self {
        MapListOutput::default()
    }
}

impl CommandOutput for MapListOutput {
    type Output = Vec<HashMap<String, String>>;

    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        let text = bytes
            .map(|data| String::from_utf8_lossy(data).into_owned())
            .unwrap_or_default();
        let current = self
            .maps
            .last_mut()
            .ok_or_else(|| HkvError::LocalUsage("map entry outside of an element".to_string()))?;
        match self.pending_field.take() {
            Some(field) => {
                current.insert(field, text);
            }
            None => self.pending_field = Some(text),
        }
        Ok(())
    }

    fn multi(&mut self, count: Option<usize>) {
        // The outer array announces the element count; each inner array
        // starts one map.
        if self.outer {
            self.maps.push(HashMap::with_capacity(count.unwrap_or(0) / 2));
            self.pending_field = None;
        } else {
            self.maps.reserve(count.unwrap_or(0));
            self.outer = true;
        }
    }

    fn get(&self) -> Vec<HashMap<String, String>> {
        self.maps.clone()
    }
}

/// Reply element of a nested aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NestedValue {
    Bytes(Option<Vec<u8>>),
    Integer(i64),
    Error(ServerError),
    Array(Vec<NestedValue>),
}

impl NestedValue {
    pub fn as_error(&self) -> Option<&ServerError> {
        match self {
            NestedValue::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// Arbitrarily nested array reply (EXEC, SLOWLOG, pub/sub frames).
///
/// Keeps a stack of partially built levels; the bottom level is the result.
#[derive(Debug)]
pub struct NestedMultiOutput {
    stack: Vec<Vec<NestedValue>>,
    announced: bool,
}

impl NestedMultiOutput {
    pub fn new() -> Self {
        NestedMultiOutput {
            stack: vec![Vec::new()],
            announced: false,
        }
    }

    fn push(&mut self, value: NestedValue) {
        if let Some(level) = self.stack.last_mut() {
            level.push(value);
        }
    }
}

impl Default for NestedMultiOutput {
    fn default() -> Self {
        NestedMultiOutput::new()
    }
}

impl CommandOutput for NestedMultiOutput {
    type Output = Vec<NestedValue>;

    fn set_bytes(&mut self, bytes: Option<&[u8]>) -> HkvResult<()> {
        self.push(NestedValue::Bytes(bytes.map(<[u8]>::to_vec)));
        Ok(())
    }

    fn set_integer(&mut self, value: i64) -> HkvResult<()> {
        self.push(NestedValue::Integer(value));
        Ok(())
    }

    fn set_error(&mut self, message: &[u8]) -> bool {
        self.push(NestedValue::Error(ServerError::new(message)));
        true
    }

    fn multi(&mut self, count: Option<usize>) {
        // The top-level array fills the bottom level directly.
        if !self.announced {
            self.announced = true;
            return;
        }
        self.stack.push(Vec::with_capacity(count.unwrap_or(0)));
    }

    fn complete(&mut self, depth: usize) {
        // An element at `depth` closes every level opened below it.
        while self.stack.len() > depth.max(1) {
            if let Some(level) = self.stack.pop() {
                self.push(NestedValue::Array(level));
            }
        }
    }

    fn get(&self) -> Vec<NestedValue> {
        self.stack.first().cloned().unwrap_or_default()
    }
}
