use serde::de::DeserializeOwned;
use serde::Serialize;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::{Argument, CallOutput, MethodSignature, ParamKind};
use servicedisc_common::protocol::error::{Result, ServiceDiscError};
use servicedisc_common::protocol::ServiceDescriptor;
use servicedisc_common::ByteStream;
use std::any::Any;
use std::sync::Arc;

use crate::dispatcher::CallDispatcher;

/// Handle to a resolved service.
///
/// Calls go through a [`CallDispatcher`] over the instances found at
/// resolution time. Typed wrappers are expected to declare the interface's
/// [`MethodSignature`]s and build on [`call`](Self::call),
/// [`call_stream`](Self::call_stream) and the argument helpers:
///
/// ```ignore
/// pub async fn add(proxy: &ServiceProxy, a: i32, b: i32) -> Result<Option<i32>> {
///     proxy.call(&ADD, vec![proxy.argument(&a)?, proxy.argument(&b)?]).await
/// }
/// ```
pub struct ServiceProxy {
    interface: String,
    dispatcher: CallDispatcher,
    codec: Arc<ValueCodec>,
}

impl ServiceProxy {
    pub fn new(interface: impl Into<String>, dispatcher: CallDispatcher, codec: Arc<ValueCodec>) -> Self {
        Self {
            interface: interface.into(),
            dispatcher,
            codec,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Instances the proxy was resolved with.
    pub fn instances(&self) -> &[ServiceDescriptor] {
        self.dispatcher.candidates().all()
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    pub fn argument<T: Serialize + Any>(&self, value: &T) -> Result<Argument> {
        Argument::encode(value, &self.codec)
    }

    pub fn optional_argument<T: Serialize + Any>(&self, value: Option<&T>) -> Result<Argument> {
        Argument::encode_optional(value, &self.codec)
    }

    /// Reads `stream` to the end so the call can be retried.
    pub async fn stream_argument(&self, stream: ByteStream) -> Result<Argument> {
        Ok(Argument::Stream(stream.collect().await?))
    }

    /// Dispatches `method` and returns the raw output.
    pub async fn invoke(&self, method: &'static MethodSignature, args: Vec<Argument>) -> Result<CallOutput> {
        check_arguments(method, &args)?;
        self.dispatcher.invoke(method, &args).await
    }

    /// Dispatches `method` and decodes its return value.
    ///
    /// Void methods and null results both yield `None`.
    pub async fn call<T: DeserializeOwned + Any>(
        &self,
        method: &'static MethodSignature,
        args: Vec<Argument>,
    ) -> Result<Option<T>> {
        let output = self.invoke(method, args).await?;
        self.decode(method, output)
    }

    /// Dispatches a method that returns a byte stream.
    pub async fn call_stream(&self, method: &'static MethodSignature, args: Vec<Argument>) -> Result<ByteStream> {
        self.invoke(method, args).await?.into_stream()
    }

    /// Decodes an output of `method` with the proxy's codec.
    pub fn decode<T: DeserializeOwned + Any>(&self, method: &MethodSignature, output: CallOutput) -> Result<Option<T>> {
        let text = output.into_encoded()?;
        self.codec.decode_return(method.returns, text.as_deref())
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("interface", &self.interface)
            .field("candidates", self.dispatcher.candidates())
            .finish()
    }
}

fn check_arguments(method: &MethodSignature, args: &[Argument]) -> Result<()> {
    if args.len() != method.params.len() {
        return Err(ServiceDiscError::UnsupportedSignature(format!(
            "{} takes {} arguments, got {}",
            method.name,
            method.params.len(),
            args.len()
        )));
    }
    for (param, arg) in method.params.iter().zip(args) {
        if (param.kind == ParamKind::Stream) != arg.is_stream() {
            return Err(ServiceDiscError::UnsupportedSignature(format!(
                "argument '{}' of {} has the wrong kind",
                param.name, method.name
            )));
        }
    }
    Ok(())
}
