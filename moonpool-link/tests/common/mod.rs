//! Mock protocol engine shared by the integration tests.
//!
//! Every wire action a manager performs is recorded in a [`Wire`] log so
//! tests can assert on transmissions, credit and dispositions, or on the
//! absence of any network activity.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use moonpool_link::{
    DeliveryTag, ExponentialRetry, InboundDelivery, JsonCodec, LinkError, LinkEvent,
    LinkEventSink, LinkFactory, LinkResult, ManagementChannel, ManagementRequest,
    ManagementResponse, Message, MessageCodec, OutboundDelivery, Outcome, ReceiverAttach,
    ReceiverLink, RemoteAttach, RequestResponseLink, RetryPolicy, Scheduler, SenderAttach,
    SenderLink, TokenRenewer, TransactionId,
};

pub const ENTITY: &str = "orders";

/// Install a test subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Let every spawned task run until it blocks. Time is paused in these
/// tests, so the runtime fast-forwards instead of actually sleeping.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// One recorded wire action.
#[derive(Debug, Clone)]
pub enum WireAction {
    AttachSender(SenderAttach),
    AttachReceiver(ReceiverAttach),
    Transmit(OutboundDelivery),
    Flow(u32),
    Drain,
    Disposition {
        tag: DeliveryTag,
        outcome: Outcome,
        transaction: Option<TransactionId>,
    },
    Settle(DeliveryTag),
    Close,
    AttachManagement(String),
    Request(ManagementRequest),
    CloseManagement,
}

/// Shared log of wire actions.
#[derive(Debug, Clone, Default)]
pub struct Wire {
    actions: Arc<Mutex<Vec<WireAction>>>,
}

impl Wire {
    pub fn record(&self, action: WireAction) {
        self.actions.lock().push(action);
    }

    pub fn actions(&self) -> Vec<WireAction> {
        self.actions.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn transmissions(&self) -> Vec<OutboundDelivery> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                WireAction::Transmit(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn flows(&self) -> Vec<u32> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                WireAction::Flow(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    pub fn total_credit(&self) -> u32 {
        self.flows().iter().sum()
    }

    pub fn drains(&self) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|a| matches!(a, WireAction::Drain))
            .count()
    }

    /// Credit granted since the last drain.
    pub fn credit_since_drain(&self) -> u32 {
        let actions = self.actions.lock();
        actions
            .iter()
            .rev()
            .take_while(|a| !matches!(a, WireAction::Drain))
            .filter_map(|a| match a {
                WireAction::Flow(c) => Some(*c),
                _ => None,
            })
            .sum()
    }

    pub fn dispositions(&self) -> Vec<(DeliveryTag, Outcome)> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                WireAction::Disposition { tag, outcome, .. } => Some((tag.clone(), outcome.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn settles(&self) -> Vec<DeliveryTag> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                WireAction::Settle(tag) => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn requests(&self) -> Vec<ManagementRequest> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                WireAction::Request(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn attach_count(&self) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    WireAction::AttachSender(_) | WireAction::AttachReceiver(_)
                )
            })
            .count()
    }

    pub fn management_attach_count(&self) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|a| matches!(a, WireAction::AttachManagement(_)))
            .count()
    }
}

/// Link factory handing out recording links.
pub struct MockFactory {
    pub wire: Wire,
    sinks: Mutex<Vec<LinkEventSink>>,
    attach_failures: Mutex<VecDeque<LinkError>>,
    remote: Mutex<RemoteAttach>,
    responses: Arc<Mutex<VecDeque<LinkResult<ManagementResponse>>>>,
    fail_transmit: Arc<AtomicBool>,
    fail_flow: Arc<AtomicBool>,
    fail_disposition: Arc<AtomicBool>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wire: Wire::default(),
            sinks: Mutex::new(Vec::new()),
            attach_failures: Mutex::new(VecDeque::new()),
            remote: Mutex::new(RemoteAttach::default()),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fail_transmit: Arc::new(AtomicBool::new(false)),
            fail_flow: Arc::new(AtomicBool::new(false)),
            fail_disposition: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Make the next attach fail with `error`.
    pub fn fail_next_attach(&self, error: LinkError) {
        self.attach_failures.lock().push_back(error);
    }

    /// Remote attach properties returned by subsequent attaches.
    pub fn set_remote(&self, remote: RemoteAttach) {
        *self.remote.lock() = remote;
    }

    /// Queue the response to the next management request.
    pub fn respond(&self, response: LinkResult<ManagementResponse>) {
        self.responses.lock().push_back(response);
    }

    pub fn fail_transmit(&self, fail: bool) {
        self.fail_transmit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_flow(&self, fail: bool) {
        self.fail_flow.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disposition(&self, fail: bool) {
        self.fail_disposition.store(fail, Ordering::SeqCst);
    }

    /// Event sink of the most recently attached link.
    pub fn sink(&self) -> LinkEventSink {
        self.sinks
            .lock()
            .last()
            .cloned()
            .expect("no link attached yet")
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Deliver an encoded message on the most recent receiver link.
    pub fn deliver(&self, tag: &DeliveryTag, message: &Message, settled: bool) {
        let payload = JsonCodec.encode(message).expect("encode");
        assert!(self.sink().emit(LinkEvent::Delivery(InboundDelivery {
            tag: tag.clone(),
            payload: Bytes::from(payload),
            settled,
        })));
    }

    /// Settle a delivery from the broker side.
    pub fn settle_remote(&self, tag: &DeliveryTag, outcome: Outcome) {
        assert!(self.sink().emit(LinkEvent::Settled {
            tag: tag.clone(),
            outcome,
        }));
    }

    /// Grant sender credit (new total).
    pub fn grant(&self, credit: u32) {
        assert!(self.sink().emit(LinkEvent::Credit(credit)));
    }

    pub fn detach(&self, error: Option<LinkError>) {
        assert!(self.sink().emit(LinkEvent::Detached(error)));
    }

    fn take_failure(&self) -> Option<LinkError> {
        self.attach_failures.lock().pop_front()
    }
}

#[async_trait]
impl LinkFactory for MockFactory {
    async fn create_sender(
        &self,
        attach: SenderAttach,
        events: LinkEventSink,
    ) -> LinkResult<(Box<dyn SenderLink>, RemoteAttach)> {
        self.wire.record(WireAction::AttachSender(attach));
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        self.sinks.lock().push(events);
        let link = MockSenderLink {
            wire: self.wire.clone(),
            fail_transmit: self.fail_transmit.clone(),
        };
        Ok((Box::new(link), self.remote.lock().clone()))
    }

    async fn create_receiver(
        &self,
        attach: ReceiverAttach,
        events: LinkEventSink,
    ) -> LinkResult<(Box<dyn ReceiverLink>, RemoteAttach)> {
        self.wire.record(WireAction::AttachReceiver(attach));
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        self.sinks.lock().push(events);
        let link = MockReceiverLink {
            wire: self.wire.clone(),
            fail_flow: self.fail_flow.clone(),
            fail_disposition: self.fail_disposition.clone(),
        };
        Ok((Box::new(link), self.remote.lock().clone()))
    }

    async fn create_request_response(
        &self,
        entity_path: &str,
    ) -> LinkResult<Arc<dyn RequestResponseLink>> {
        self.wire
            .record(WireAction::AttachManagement(entity_path.to_string()));
        Ok(Arc::new(MockManagementLink {
            wire: self.wire.clone(),
            responses: self.responses.clone(),
        }))
    }
}

struct MockSenderLink {
    wire: Wire,
    fail_transmit: Arc<AtomicBool>,
}

#[async_trait]
impl SenderLink for MockSenderLink {
    fn transmit(&self, delivery: OutboundDelivery) -> LinkResult<()> {
        if self.fail_transmit.load(Ordering::SeqCst) {
            return Err(LinkError::new(
                moonpool_link::ErrorKind::Communication,
                "connection reset",
            ));
        }
        self.wire.record(WireAction::Transmit(delivery));
        Ok(())
    }

    async fn close(&self) {
        self.wire.record(WireAction::Close);
    }
}

struct MockReceiverLink {
    wire: Wire,
    fail_flow: Arc<AtomicBool>,
    fail_disposition: Arc<AtomicBool>,
}

#[async_trait]
impl ReceiverLink for MockReceiverLink {
    fn flow(&self, credit: u32) -> LinkResult<()> {
        if self.fail_flow.load(Ordering::SeqCst) {
            return Err(LinkError::new(
                moonpool_link::ErrorKind::Communication,
                "connection reset",
            ));
        }
        self.wire.record(WireAction::Flow(credit));
        Ok(())
    }

    fn drain(&self) -> LinkResult<()> {
        self.wire.record(WireAction::Drain);
        Ok(())
    }

    fn disposition(
        &self,
        tag: &DeliveryTag,
        outcome: &Outcome,
        transaction: Option<&TransactionId>,
    ) -> LinkResult<()> {
        if self.fail_disposition.load(Ordering::SeqCst) {
            return Err(LinkError::new(
                moonpool_link::ErrorKind::Communication,
                "connection reset",
            ));
        }
        self.wire.record(WireAction::Disposition {
            tag: tag.clone(),
            outcome: outcome.clone(),
            transaction: transaction.cloned(),
        });
        Ok(())
    }

    fn settle(&self, tag: &DeliveryTag) {
        self.wire.record(WireAction::Settle(tag.clone()));
    }

    async fn close(&self) {
        self.wire.record(WireAction::Close);
    }
}

struct MockManagementLink {
    wire: Wire,
    responses: Arc<Mutex<VecDeque<LinkResult<ManagementResponse>>>>,
}

#[async_trait]
impl RequestResponseLink for MockManagementLink {
    async fn request(
        &self,
        request: ManagementRequest,
        _transaction: Option<TransactionId>,
        _timeout: Duration,
    ) -> LinkResult<ManagementResponse> {
        self.wire.record(WireAction::Request(request));
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(ManagementResponse::Empty))
    }

    async fn close(&self) {
        self.wire.record(WireAction::CloseManagement);
    }
}

/// Token renewer that always succeeds and counts its calls.
#[derive(Default)]
pub struct MockRenewer {
    pub calls: AtomicU32,
}

#[async_trait]
impl TokenRenewer for MockRenewer {
    async fn renew(&self, _audience: &str) -> LinkResult<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Duration::from_secs(3600))
    }
}

/// Fast retry policy for tests: 100 ms to 1 s, five attempts.
pub fn fast_retry() -> Arc<dyn RetryPolicy> {
    Arc::new(ExponentialRetry::new(
        Duration::from_millis(100),
        Duration::from_secs(1),
        5,
    ))
}

/// Everything a test needs to build managers against the mock engine.
pub struct Harness {
    pub factory: Arc<MockFactory>,
    pub renewer: Arc<MockRenewer>,
    pub retry: Arc<dyn RetryPolicy>,
    pub scheduler: Scheduler,
    pub management: ManagementChannel,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retry(fast_retry())
    }

    pub fn with_retry(retry: Arc<dyn RetryPolicy>) -> Self {
        init_tracing();
        let factory = MockFactory::new();
        let scheduler = Scheduler::current().expect("inside a runtime");
        let management = ManagementChannel::new(
            ENTITY,
            "management-test",
            factory.clone() as Arc<dyn LinkFactory>,
            retry.clone(),
        );
        Self {
            factory,
            renewer: Arc::new(MockRenewer::default()),
            retry,
            scheduler,
            management,
        }
    }

    pub fn wire(&self) -> &Wire {
        &self.factory.wire
    }
}

/// A message with the given id.
pub fn message(id: &str) -> Message {
    Message::new(format!("body of {}", id).into_bytes()).with_message_id(id)
}

/// A 16-byte delivery tag derived from `n`, which maps to a lock token.
pub fn tag(n: u8) -> DeliveryTag {
    DeliveryTag::new(vec![n; 16])
}
