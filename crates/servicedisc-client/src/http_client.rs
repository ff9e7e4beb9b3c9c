//! HTTP transport client
//!
//! Calls an [`HttpHost`](servicedisc_server::HttpHost) at the descriptor's
//! address. Value arguments travel as URL-encoded query parameters, a stream
//! argument as the `POST` body.
//!
//! | Response | Result |
//! |----------|--------|
//! | 204 | `CallOutput::None` |
//! | 200, stream return | lazily read body |
//! | 200 | body text, codec-encoded |
//! | anything else | `Transport` error |

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use servicedisc_common::dispatch::{Argument, CallOutput, MethodSignature, ParamKind, ReturnKind};
use servicedisc_common::protocol::error::{Result, ServiceDiscError};
use servicedisc_common::protocol::ServiceDescriptor;
use servicedisc_common::ByteStream;
use std::io;
use tracing::debug;

use crate::ServiceClient;

#[derive(Clone)]
pub struct HttpServiceClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpServiceClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpServiceClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds `{address}{method}?{name}={value}&...`.
///
/// Null values and the stream parameter are left out of the query.
pub fn request_target(address: &str, method: &MethodSignature, args: &[Argument]) -> String {
    let mut target = format!("{}{}", address, method.name);
    let mut separator = '?';
    for (param, arg) in method.params.iter().zip(args) {
        if param.kind != ParamKind::Value {
            continue;
        }
        if let Argument::Value(Some(text)) = arg {
            target.push(separator);
            target.push_str(&urlencoding::encode(param.name));
            target.push('=');
            target.push_str(&urlencoding::encode(text));
            separator = '&';
        }
    }
    target
}

fn transport(context: &str, e: impl std::fmt::Display) -> ServiceDiscError {
    ServiceDiscError::Transport(format!("{}: {}", context, e))
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &'static MethodSignature,
        args: &[Argument],
    ) -> Result<CallOutput> {
        method.validate()?;
        if args.len() != method.params.len() {
            return Err(ServiceDiscError::UnsupportedSignature(format!(
                "{} takes {} arguments, got {}",
                method.name,
                method.params.len(),
                args.len()
            )));
        }

        let target = request_target(&descriptor.address, method, args);
        let body = method
            .stream_param()
            .and_then(|index| match &args[index] {
                Argument::Stream(bytes) => Some(bytes.clone()),
                Argument::Value(_) => None,
            });

        let request = Request::builder()
            .method(if body.is_some() { Method::POST } else { Method::GET })
            .uri(&target)
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| transport("Failed to build request", e))?;

        debug!("{} {}", request.method(), target);
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| transport(&format!("HTTP request to {} failed", target), e))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(CallOutput::None);
        }
        if !status.is_success() {
            let text = match response.into_body().collect().await {
                Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
                Err(_) => String::new(),
            };
            return Err(ServiceDiscError::Transport(format!(
                "{} returned {}: {}",
                target, status, text
            )));
        }

        match method.returns {
            ReturnKind::Stream => {
                let stream = response
                    .into_body()
                    .into_data_stream()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
                Ok(CallOutput::Stream(ByteStream::new(stream)))
            }
            ReturnKind::Void => Ok(CallOutput::None),
            ReturnKind::Value => {
                let bytes = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| transport("Failed to read response", e))?
                    .to_bytes();
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| ServiceDiscError::Decode(format!("response is not UTF-8: {}", e)))?;
                Ok(CallOutput::Encoded(text))
            }
        }
    }
}
