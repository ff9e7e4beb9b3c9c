//! HTTP Host Integration Tests
//!
//! Hosts a service on a loopback port and talks to it with a plain hyper
//! client, checking the routes and status codes a transport client relies on.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::{
    CallArgs, CallOutput, MethodSignature, ParamSpec, ReturnKind, ServiceInterface,
};
use servicedisc_common::protocol::{HostKind, Result, ServiceDiscError};
use servicedisc_common::stream::ByteStream;
use servicedisc_server::{HostConfig, HttpHost, TransportHost};
use std::sync::Arc;

// ============================================================================
// Test Helpers
// ============================================================================

struct Files;

#[async_trait]
impl ServiceInterface for Files {
    const INTERFACE: &'static str = "tests.Files";
    const METHODS: &'static [MethodSignature] = &[
        MethodSignature::new("Echo", &[ParamSpec::value("text")], ReturnKind::Value),
        MethodSignature::new("Reverse", &[ParamSpec::stream("data")], ReturnKind::Stream),
        MethodSignature::new("Touch", &[ParamSpec::value("path")], ReturnKind::Void),
        MethodSignature::new("Fail", &[], ReturnKind::Value),
    ];

    async fn invoke(&self, method: &str, mut args: CallArgs, codec: &ValueCodec) -> Result<CallOutput> {
        match method {
            "Echo" => {
                let text: Option<String> = args.optional(0, codec)?;
                CallOutput::encode_optional(text.as_ref(), codec)
            }
            "Reverse" => {
                let mut data = args.take_stream(0)?.collect().await?.to_vec();
                data.reverse();
                Ok(CallOutput::Stream(ByteStream::from_bytes(data)))
            }
            "Touch" => Ok(CallOutput::None),
            "Fail" => Err(ServiceDiscError::Remote("disk full".to_string())),
            other => Err(ServiceDiscError::MethodNotFound(other.to_string())),
        }
    }
}

async fn start() -> HttpHost {
    let config = HostConfig {
        local_port: Some(0),
        ..HostConfig::loopback()
    };
    HttpHost::start(Arc::new(Files), Arc::new(ValueCodec::new()), &config)
        .await
        .unwrap()
}

async fn call(host: &HttpHost, method: Method, path: &str, body: &'static [u8]) -> (StatusCode, Bytes) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = Request::builder()
        .method(method)
        .uri(format!("{}{}", host.address(), path))
        .body(Full::new(Bytes::from_static(body)))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_published_address() {
    let host = start().await;
    let port = host.local_addr().port();
    assert_eq!(host.address(), format!("http://127.0.0.1:{}/", port));
    assert_eq!(host.kind(), HostKind::Http);
    assert_eq!(host.interface(), "tests.Files");
    host.close().await;
}

#[tokio::test]
async fn test_get_returns_encoded_value() {
    let host = start().await;
    let (status, body) = call(&host, Method::GET, "Echo?text=a%00b%0D%0A%E2%82%AC%2B", b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], "a\0b\r\n€+".as_bytes());
    host.close().await;
}

#[tokio::test]
async fn test_empty_value_is_not_missing() {
    let host = start().await;
    let (status, body) = call(&host, Method::GET, "Echo?text=", b"").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    host.close().await;
}

#[tokio::test]
async fn test_missing_value_is_no_content() {
    let host = start().await;
    let (status, _) = call(&host, Method::GET, "Echo", b"").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    host.close().await;
}

#[tokio::test]
async fn test_void_method_is_no_content() {
    let host = start().await;
    let (status, _) = call(&host, Method::GET, "Touch?path=x", b"").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    host.close().await;
}

#[tokio::test]
async fn test_post_binds_body_and_streams_result() {
    let host = start().await;
    let (status, body) = call(&host, Method::POST, "Reverse", b"\x00\x01\x02abc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"cba\x02\x01\x00");
    host.close().await;
}

#[tokio::test]
async fn test_unknown_method_is_not_found() {
    let host = start().await;
    let (status, _) = call(&host, Method::GET, "Delete?path=x", b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    host.close().await;
}

#[tokio::test]
async fn test_failure_is_server_error() {
    let host = start().await;
    let (status, body) = call(&host, Method::GET, "Fail", b"").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8_lossy(&body).contains("disk full"));
    host.close().await;
}

#[tokio::test]
async fn test_closed_host_refuses_connections() {
    let host = start().await;
    let uri = format!("{}Touch?path=x", host.address());
    host.close().await;
    host.close().await;

    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = Request::get(uri).body(Full::new(Bytes::new())).unwrap();
    assert!(client.request(request).await.is_err());
}
