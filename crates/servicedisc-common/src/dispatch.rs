//! Interface dispatch contract
//!
//! Services are exposed through a hand-written dispatch table instead of
//! runtime proxies. Each service interface declares its methods as static
//! [`MethodSignature`]s and implements [`ServiceInterface::invoke`], which
//! decodes positional arguments from [`CallArgs`] and encodes the result into
//! a [`CallOutput`].
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use servicedisc_common::codec::ValueCodec;
//! use servicedisc_common::dispatch::*;
//! use servicedisc_common::{Result, ServiceDiscError};
//!
//! struct Adder;
//!
//! const ADD: MethodSignature = MethodSignature::new(
//!     "Add",
//!     &[ParamSpec::value("a"), ParamSpec::value("b")],
//!     ReturnKind::Value,
//! );
//!
//! #[async_trait]
//! impl ServiceInterface for Adder {
//!     const INTERFACE: &'static str = "demo.Adder";
//!     const METHODS: &'static [MethodSignature] = &[ADD];
//!
//!     async fn invoke(&self, method: &str, args: CallArgs, codec: &ValueCodec) -> Result<CallOutput> {
//!         match method {
//!             "Add" => {
//!                 let a: i32 = args.value(0, codec)?;
//!                 let b: i32 = args.value(1, codec)?;
//!                 CallOutput::encode(&(a + b), codec)
//!             }
//!             other => Err(ServiceDiscError::MethodNotFound(other.to_string())),
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;

use crate::codec::ValueCodec;
use crate::protocol::error::{Result, ServiceDiscError};
use crate::stream::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Encoded by the value codec
    Value,
    /// Raw bytes, carried as a request body
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub const fn value(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Value,
        }
    }

    pub const fn stream(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Value,
    Stream,
}

/// Static description of one interface method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: &'static str,
    pub params: &'static [ParamSpec],
    pub returns: ReturnKind,
}

impl MethodSignature {
    pub const fn new(name: &'static str, params: &'static [ParamSpec], returns: ReturnKind) -> Self {
        Self {
            name,
            params,
            returns,
        }
    }

    /// Position of the stream parameter, if the method has one.
    pub fn stream_param(&self) -> Option<usize> {
        self.params.iter().position(|p| p.kind == ParamKind::Stream)
    }

    /// Whether any parameter or the return value is a byte stream.
    pub fn uses_streams(&self) -> bool {
        self.returns == ReturnKind::Stream || self.stream_param().is_some()
    }

    /// Rejects signatures with more than one stream parameter.
    pub fn validate(&self) -> Result<()> {
        let streams = self
            .params
            .iter()
            .filter(|p| p.kind == ParamKind::Stream)
            .count();
        if streams > 1 {
            return Err(ServiceDiscError::UnsupportedSignature(format!(
                "{} declares {} stream parameters, at most one is allowed",
                self.name, streams
            )));
        }
        Ok(())
    }
}

/// Looks up a method by name in a dispatch table.
pub fn find_method(methods: &'static [MethodSignature], name: &str) -> Option<&'static MethodSignature> {
    methods.iter().find(|m| m.name == name)
}

/// One host-side argument after transport decoding.
#[derive(Debug)]
pub enum ArgValue {
    /// Codec-encoded text
    Encoded(String),
    /// Absent value, the caller passed null
    Missing,
    Stream(ByteStream),
}

/// Positional arguments handed to [`ServiceInterface::invoke`].
#[derive(Debug, Default)]
pub struct CallArgs {
    values: Vec<ArgValue>,
}

impl CallArgs {
    pub fn new(values: Vec<ArgValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decodes the required value at `index`.
    pub fn value<T: DeserializeOwned + Any>(&self, index: usize, codec: &ValueCodec) -> Result<T> {
        self.optional(index, codec)?.ok_or_else(|| {
            ServiceDiscError::Decode(format!("argument {} is missing", index))
        })
    }

    /// Decodes the value at `index`, `None` when the caller passed null.
    pub fn optional<T: DeserializeOwned + Any>(&self, index: usize, codec: &ValueCodec) -> Result<Option<T>> {
        match self.values.get(index) {
            Some(ArgValue::Encoded(text)) => codec.decode(text).map(Some),
            Some(ArgValue::Missing) | None => Ok(None),
            Some(ArgValue::Stream(_)) => Err(ServiceDiscError::Decode(format!(
                "argument {} is a stream",
                index
            ))),
        }
    }

    /// Takes the stream bound at `index`.
    pub fn take_stream(&mut self, index: usize) -> Result<ByteStream> {
        if let Some(slot) = self.values.get_mut(index) {
            if matches!(slot, ArgValue::Stream(_)) {
                if let ArgValue::Stream(stream) = std::mem::replace(slot, ArgValue::Missing) {
                    return Ok(stream);
                }
            }
        }
        Err(ServiceDiscError::Decode(format!(
            "argument {} is not a stream",
            index
        )))
    }
}

/// Result of a host-side invocation.
#[derive(Debug)]
pub enum CallOutput {
    /// Void method or null result
    None,
    Encoded(String),
    Stream(ByteStream),
}

impl CallOutput {
    pub fn encode<T: Serialize + Any>(value: &T, codec: &ValueCodec) -> Result<Self> {
        Ok(CallOutput::Encoded(codec.encode(value)?))
    }

    pub fn encode_optional<T: Serialize + Any>(value: Option<&T>, codec: &ValueCodec) -> Result<Self> {
        Ok(match codec.encode_optional(value)? {
            Some(text) => CallOutput::Encoded(text),
            None => CallOutput::None,
        })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CallOutput::None)
    }

    /// The encoded text, if this output carries one.
    pub fn into_encoded(self) -> Result<Option<String>> {
        match self {
            CallOutput::None => Ok(None),
            CallOutput::Encoded(text) => Ok(Some(text)),
            CallOutput::Stream(_) => Err(ServiceDiscError::UnsupportedSignature(
                "expected an encoded value, got a stream".to_string(),
            )),
        }
    }

    pub fn into_stream(self) -> Result<ByteStream> {
        match self {
            CallOutput::Stream(stream) => Ok(stream),
            CallOutput::None => Ok(ByteStream::empty()),
            CallOutput::Encoded(_) => Err(ServiceDiscError::UnsupportedSignature(
                "expected a stream, got an encoded value".to_string(),
            )),
        }
    }
}

/// Caller-side argument, prepared before dispatch.
///
/// Stream arguments are buffered so a retry can replay the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Value(Option<String>),
    Stream(Bytes),
}

impl Argument {
    pub fn encode<T: Serialize + Any>(value: &T, codec: &ValueCodec) -> Result<Self> {
        Ok(Argument::Value(Some(codec.encode(value)?)))
    }

    pub fn encode_optional<T: Serialize + Any>(value: Option<&T>, codec: &ValueCodec) -> Result<Self> {
        Ok(Argument::Value(codec.encode_optional(value)?))
    }

    pub fn null() -> Self {
        Argument::Value(None)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Argument::Stream(_))
    }
}

/// A service interface implemented by a hosted object.
#[async_trait]
pub trait ServiceInterface: Send + Sync + 'static {
    /// Fully-qualified interface name used in descriptors and queue names
    const INTERFACE: &'static str;
    const METHODS: &'static [MethodSignature];

    async fn invoke(&self, method: &str, args: CallArgs, codec: &ValueCodec) -> Result<CallOutput>;
}

/// Object-safe view of a [`ServiceInterface`], used by transport hosts.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn interface(&self) -> &'static str;

    fn methods(&self) -> &'static [MethodSignature];

    fn method(&self, name: &str) -> Option<&'static MethodSignature> {
        find_method(self.methods(), name)
    }

    async fn dispatch(&self, method: &str, args: CallArgs, codec: &ValueCodec) -> Result<CallOutput>;
}

#[async_trait]
impl<S: ServiceInterface> HostedService for S {
    fn interface(&self) -> &'static str {
        S::INTERFACE
    }

    fn methods(&self) -> &'static [MethodSignature] {
        S::METHODS
    }

    async fn dispatch(&self, method: &str, args: CallArgs, codec: &ValueCodec) -> Result<CallOutput> {
        ServiceInterface::invoke(self, method, args, codec).await
    }
}
