use apns_dispatcher::config::DispatcherConfig;
use apns_dispatcher::domain::push::{ProviderResponse, WireMessage};
use apns_dispatcher::services::push::{CompletionExecutor, PushTransport, TransportError};
use apns_dispatcher::PushDispatcher;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub const BUNDLE_ID: &str = "org.example.app";

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("apns_dispatcher=debug".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// How the fake provider answers one submission.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    Reject(Option<&'static str>),
    Fail,
}

#[allow(dead_code)]
#[derive(Debug)]
pub struct FakeTransport {
    outcomes: Mutex<VecDeque<Outcome>>,
    default_outcome: Outcome,
    delay: Duration,
    pub submitted: Mutex<Vec<WireMessage>>,
    pub submit_threads: Mutex<Vec<Option<String>>>,
    pub close_calls: AtomicUsize,
    closed: AtomicBool,
}

#[allow(dead_code)]
impl FakeTransport {
    pub fn new(default_outcome: Outcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            default_outcome,
            delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
            submit_threads: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Outcome::Accept)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, outcome: Outcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn last_submitted(&self) -> Option<WireMessage> {
        self.submitted.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn submit(&self, message: WireMessage) -> Result<ProviderResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.submit_threads.lock().unwrap().push(std::thread::current().name().map(ToString::to_string));
        self.submitted.lock().unwrap().push(message);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
        }

        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| self.default_outcome.clone());
        match outcome {
            Outcome::Accept => Ok(ProviderResponse::accepted()),
            Outcome::Reject(reason) => Ok(ProviderResponse::rejected(reason.map(ToString::to_string))),
            Outcome::Fail => Err(TransportError::Other(anyhow::anyhow!("connection reset by peer"))),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds a dispatcher on the current runtime around the given fake.
#[allow(dead_code)]
pub fn dispatcher(transport: &Arc<FakeTransport>, config: &DispatcherConfig) -> PushDispatcher {
    setup_tracing();
    let transport: Arc<dyn PushTransport> = Arc::clone(transport) as Arc<dyn PushTransport>;
    PushDispatcher::new(BUNDLE_ID, transport, CompletionExecutor::current(config.worker_concurrency), config)
}
