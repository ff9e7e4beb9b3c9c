//! Binds transport-level parameters to a hosted service's methods.

use futures::FutureExt;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::{ArgValue, CallArgs, CallOutput, HostedService, ParamKind};
use servicedisc_common::protocol::{Result, ServiceDiscError};
use servicedisc_common::stream::ByteStream;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Invokes methods of one hosted service by name.
pub struct ServiceInvoker {
    service: Arc<dyn HostedService>,
    codec: Arc<ValueCodec>,
}

impl ServiceInvoker {
    pub fn new(service: Arc<dyn HostedService>, codec: Arc<ValueCodec>) -> Self {
        Self { service, codec }
    }

    pub fn service(&self) -> &Arc<dyn HostedService> {
        &self.service
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    /// Resolves `method_name` and invokes it.
    ///
    /// Value parameters are looked up by name through `lookup`; the stream
    /// parameter, if declared, is bound to `body`. When a value parameter has
    /// no value the method is not invoked and the result is
    /// [`CallOutput::None`]. A panicking method is reported as
    /// `ServiceDiscError::Remote`.
    pub async fn invoke<F>(
        &self,
        method_name: &str,
        lookup: F,
        body: Option<ByteStream>,
    ) -> Result<CallOutput>
    where
        F: Fn(&str) -> Option<String> + Send,
    {
        let method = self
            .service
            .method(method_name)
            .ok_or_else(|| ServiceDiscError::MethodNotFound(method_name.to_string()))?;
        method.validate()?;

        let mut body = body;
        let mut values = Vec::with_capacity(method.params.len());
        for param in method.params {
            match param.kind {
                ParamKind::Stream => {
                    values.push(ArgValue::Stream(body.take().unwrap_or_else(ByteStream::empty)));
                }
                ParamKind::Value => match lookup(param.name) {
                    Some(text) => values.push(ArgValue::Encoded(text)),
                    None => {
                        debug!(
                            "{}.{} called without {}, returning no value",
                            self.service.interface(),
                            method.name,
                            param.name
                        );
                        return Ok(CallOutput::None);
                    }
                },
            }
        }

        let call = self
            .service
            .dispatch(method.name, CallArgs::new(values), &self.codec);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(
                    "{}.{} panicked: {}",
                    self.service.interface(),
                    method.name,
                    message
                );
                Err(ServiceDiscError::Remote(format!("{} panicked: {}", method.name, message)))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
