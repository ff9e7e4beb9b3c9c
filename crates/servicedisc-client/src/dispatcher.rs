//! Call dispatcher
//!
//! Routes one proxy invocation to a live candidate and fails over on error.
//!
//! # Algorithm
//!
//! 1. Pick a candidate from the [`CandidateSet`]
//! 2. Call it through the transport client registered for its host kind
//! 3. On success return the result; on a candidate failure evict the
//!    candidate and try again
//! 4. Give up with `RetriesExhausted` once `retry_factor x |all|` attempts
//!    have failed
//!
//! The whole loop runs under a single deadline (`call_timeout`). Errors that
//! would fail on every instance (bad signature, undecodable value) are
//! returned straight away.

use servicedisc_common::dispatch::{Argument, CallOutput, MethodSignature};
use servicedisc_common::protocol::error::{Result, ServiceDiscError};
use servicedisc_common::protocol::{HostKind, ServiceDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::candidates::CandidateSet;
use crate::ServiceClient;

/// Transport clients keyed by the host kind they can call.
pub type ClientMap = HashMap<HostKind, Arc<dyn ServiceClient>>;

/// Configuration for proxy calls.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Deadline for one invocation, retries included
    ///
    /// Default: 5 minutes
    pub call_timeout: Duration,
    /// Failed attempts allowed per resolved candidate
    ///
    /// Default: 2
    pub retry_factor: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5 * 60),
            retry_factor: 2,
        }
    }
}

pub struct CallDispatcher {
    candidates: CandidateSet,
    clients: Arc<ClientMap>,
    config: DispatchConfig,
}

impl CallDispatcher {
    pub fn new(candidates: CandidateSet, clients: Arc<ClientMap>, config: DispatchConfig) -> Self {
        Self {
            candidates,
            clients,
            config,
        }
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Invokes `method` on some candidate.
    ///
    /// `args` must line up with `method.params`.
    pub async fn invoke(&self, method: &'static MethodSignature, args: &[Argument]) -> Result<CallOutput> {
        method.validate()?;

        let timeout = self.config.call_timeout;
        match tokio::time::timeout(timeout, self.attempt(method, args)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Call {} exceeded its {:?} deadline", method.name, timeout);
                Err(ServiceDiscError::DeadlineExceeded(timeout.as_millis() as u64))
            }
        }
    }

    async fn attempt(&self, method: &'static MethodSignature, args: &[Argument]) -> Result<CallOutput> {
        let max_attempts = self.config.retry_factor * self.candidates.all().len();
        let mut failures = 0usize;
        let mut last_error: Option<ServiceDiscError> = None;

        loop {
            let Some(descriptor) = self.candidates.select() else {
                return Err(match last_error {
                    Some(e) => ServiceDiscError::unavailable_after(e),
                    None => ServiceDiscError::unavailable(),
                });
            };

            debug!("Calling {} on {}", method.name, descriptor);
            let result = self.call_candidate(&descriptor, method, args).await;
            let error = match result {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_candidate_failure() => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            warn!(
                "Call {} on {} failed (attempt {}): {}",
                method.name, descriptor.address, failures, error
            );
            self.candidates.evict(&descriptor);

            if failures >= max_attempts {
                return Err(ServiceDiscError::RetriesExhausted {
                    attempts: failures,
                    last: Box::new(error),
                });
            }
            last_error = Some(error);
        }
    }

    async fn call_candidate(
        &self,
        descriptor: &ServiceDescriptor,
        method: &'static MethodSignature,
        args: &[Argument],
    ) -> Result<CallOutput> {
        match self.clients.get(&descriptor.host_kind) {
            Some(client) => client.call(descriptor, method, args).await,
            None => Err(ServiceDiscError::Transport(format!(
                "no transport client for host kind '{}'",
                descriptor.host_kind
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use servicedisc_common::dispatch::{ParamSpec, ReturnKind};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    const PING: MethodSignature = MethodSignature::new("Ping", &[ParamSpec::value("text")], ReturnKind::Value);

    /// Fails for addresses listed in `failing`, echoes otherwise.
    struct ScriptedClient {
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<Uuid>>,
        delay: Option<Duration>,
        error: fn() -> ServiceDiscError,
    }

    impl ScriptedClient {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: Mutex::new(failing.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
                delay: None,
                error: || ServiceDiscError::Transport("connection refused".to_string()),
            }
        }
    }

    #[async_trait]
    impl ServiceClient for ScriptedClient {
        async fn call(
            &self,
            descriptor: &ServiceDescriptor,
            _method: &'static MethodSignature,
            args: &[Argument],
        ) -> Result<CallOutput> {
            self.calls.lock().push(descriptor.id);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().contains(&descriptor.address) {
                return Err((self.error)());
            }
            match &args[0] {
                Argument::Value(Some(text)) => Ok(CallOutput::Encoded(text.clone())),
                _ => Ok(CallOutput::None),
            }
        }
    }

    fn descriptor(address: &str, kind: HostKind) -> ServiceDescriptor {
        ServiceDescriptor::new("tests.Ping", None, kind, address)
    }

    fn dispatcher(descriptors: Vec<ServiceDescriptor>, client: Arc<ScriptedClient>) -> CallDispatcher {
        let mut clients: ClientMap = HashMap::new();
        clients.insert(HostKind::Http, client);
        CallDispatcher::new(
            CandidateSet::new(descriptors),
            Arc::new(clients),
            DispatchConfig::default(),
        )
    }

    fn ping() -> Vec<Argument> {
        vec![Argument::Value(Some("hi".to_string()))]
    }

    #[tokio::test]
    async fn test_fails_over_to_live_candidate() {
        let client = Arc::new(ScriptedClient::new(&["a", "b"]));
        let all = vec![
            descriptor("a", HostKind::Http),
            descriptor("b", HostKind::Http),
            descriptor("c", HostKind::Http),
        ];
        let dispatcher = dispatcher(all, client.clone());

        for _ in 0..5 {
            let output = dispatcher.invoke(&PING, &ping()).await.unwrap();
            assert_eq!(output.into_encoded().unwrap(), Some("hi".to_string()));
        }
        // c never fails, so a and b are each tried at most once
        assert!(client.calls.lock().len() <= 7);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_factor_times_candidates() {
        let client = Arc::new(ScriptedClient::new(&["a", "b", "c"]));
        let all = vec![
            descriptor("a", HostKind::Http),
            descriptor("b", HostKind::Http),
            descriptor("c", HostKind::Http),
        ];
        let dispatcher = dispatcher(all, client.clone());

        let err = dispatcher.invoke(&PING, &ping()).await.unwrap_err();
        match err {
            ServiceDiscError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 6);
                assert!(matches!(*last, ServiceDiscError::Transport(_)));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(client.calls.lock().len(), 6);
    }

    #[tokio::test]
    async fn test_empty_candidates_unavailable() {
        let client = Arc::new(ScriptedClient::new(&[]));
        let dispatcher = dispatcher(Vec::new(), client);

        let err = dispatcher.invoke(&PING, &ping()).await.unwrap_err();
        assert!(matches!(err, ServiceDiscError::ServiceUnavailable { last: None }));
    }

    #[tokio::test]
    async fn test_unknown_host_kind_counts_as_failure() {
        let client = Arc::new(ScriptedClient::new(&[]));
        let all = vec![descriptor("q", HostKind::Unknown), descriptor("h", HostKind::Http)];
        let dispatcher = dispatcher(all, client.clone());

        for _ in 0..4 {
            assert!(dispatcher.invoke(&PING, &ping()).await.is_ok());
        }
        // only the http candidate ever reached the client
        let calls = client.calls.lock();
        assert!(calls.iter().all(|id| *id == dispatcher.candidates().all()[1].id));
    }

    #[tokio::test]
    async fn test_non_candidate_failure_not_retried() {
        let mut client = ScriptedClient::new(&["a"]);
        client.error = || ServiceDiscError::Decode("bad value".to_string());
        let client = Arc::new(client);
        let dispatcher = dispatcher(
            vec![descriptor("a", HostKind::Http), descriptor("a", HostKind::Http)],
            client.clone(),
        );

        let err = dispatcher.invoke(&PING, &ping()).await.unwrap_err();
        assert!(matches!(err, ServiceDiscError::Decode(_)));
        assert_eq!(client.calls.lock().len(), 1);
        assert_eq!(dispatcher.candidates().active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let mut client = ScriptedClient::new(&[]);
        client.delay = Some(Duration::from_secs(10));
        let mut clients: ClientMap = HashMap::new();
        clients.insert(HostKind::Http, Arc::new(client));
        let dispatcher = CallDispatcher::new(
            CandidateSet::new(vec![descriptor("a", HostKind::Http)]),
            Arc::new(clients),
            DispatchConfig {
                call_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );

        let err = dispatcher.invoke(&PING, &ping()).await.unwrap_err();
        assert!(matches!(err, ServiceDiscError::DeadlineExceeded(1000)));
    }

    #[tokio::test]
    async fn test_eviction_observer_sees_failures() {
        let client = Arc::new(ScriptedClient::new(&["a"]));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let set = CandidateSet::with_observer(
            vec![descriptor("a", HostKind::Http), descriptor("b", HostKind::Http)],
            move |d| {
                assert_eq!(d.address, "a");
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        let mut clients: ClientMap = HashMap::new();
        clients.insert(HostKind::Http, client);
        let dispatcher = CallDispatcher::new(set, Arc::new(clients), DispatchConfig::default());

        for _ in 0..10 {
            dispatcher.invoke(&PING, &ping()).await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
