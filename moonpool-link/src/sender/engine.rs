//! Engine task of a sender link manager.
//!
//! The engine is the only owner of the underlying link, its credit, the send
//! queue and the pending table. Handles, the protocol engine and the tasks
//! the engine spawns all reach it through channels, so every decision that
//! touches the wire is taken here.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::queue::SendQueue;
use super::{Command, Internal, SendWork};
use crate::batch::{BATCH_MESSAGE_FORMAT, encode_batch};
use crate::completion::Completer;
use crate::config::{SenderConfig, SenderSettleMode};
use crate::error::{ErrorKind, LinkError};
use crate::management::ManagementChannel;
use crate::message::{DeliveryTag, Outcome, TransactionId};
use crate::pending::{PendingTable, PendingWork};
use crate::protocol::{
    LinkEvent, LinkEventSink, LinkFactory, LinkId, OutboundDelivery, SenderAttach, SenderLink,
};
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SchedulerLease};
use crate::state::LinkState;
use crate::timeout::TimeoutTracker;
use crate::token::TokenRefresher;

/// Everything an engine needs from its manager.
pub(crate) struct EngineParts {
    pub(crate) config: SenderConfig,
    pub(crate) client_id: String,
    pub(crate) factory: Arc<dyn LinkFactory>,
    pub(crate) refresher: TokenRefresher,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) scheduler: Scheduler,
    pub(crate) lease: SchedulerLease,
    pub(crate) management: ManagementChannel,
}

/// Start the engine task. Returns the command channel and state feed.
pub(crate) fn spawn(
    parts: EngineParts,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<LinkState>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LinkState::Uninitialized);

    let name = format!("sender-engine:{}", parts.client_id);
    let scheduler = parts.scheduler.clone();
    let engine = SenderEngine {
        max_message_size: parts.config.max_message_size,
        config: parts.config,
        client_id: parts.client_id,
        factory: parts.factory,
        refresher: parts.refresher,
        retry: parts.retry,
        scheduler: parts.scheduler,
        management: parts.management,
        state_tx,
        events_tx,
        internal_tx,
        state: LinkState::Uninitialized,
        link: None,
        link_id: LinkId::new(0),
        link_token: CancellationToken::new(),
        detached_while_opening: None,
        credit: 0,
        queue: SendQueue::new(),
        pending: PendingTable::new("send"),
        _lease: parts.lease,
    };
    scheduler.spawn_task(&name, engine.run(commands_rx, events_rx, internal_rx));
    (commands_tx, state_rx)
}

struct SenderEngine {
    config: SenderConfig,
    client_id: String,
    factory: Arc<dyn LinkFactory>,
    refresher: TokenRefresher,
    retry: Arc<dyn RetryPolicy>,
    scheduler: Scheduler,
    management: ManagementChannel,
    state_tx: watch::Sender<LinkState>,
    events_tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    state: LinkState,
    link: Option<Box<dyn SenderLink>>,
    link_id: LinkId,
    /// Cancels the token renewal of the current link.
    link_token: CancellationToken,
    /// Detach reported before the pending attach resolved.
    detached_while_opening: Option<Option<LinkError>>,
    credit: u32,
    max_message_size: usize,
    queue: SendQueue,
    pending: PendingTable<DeliveryTag, SendWork>,
    _lease: SchedulerLease,
}

impl SenderEngine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { completer }) => {
                        self.shutdown().await;
                        let _ = completer.complete(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!(client_id = %self.client_id, "all sender handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some((link_id, event)) = events.recv() => self.handle_event(link_id, event),
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = sweep.tick() => self.sweep(),
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject(LinkError::illegal_state("sender is closed"));
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            tracing::trace!(client_id = %self.client_id, from = ?self.state, to = ?state, "sender state");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                payload,
                message_format,
                transaction,
                completer,
            } => self.enqueue(payload, message_format, transaction, completer),
            Command::SendBatch {
                payloads,
                transaction,
                completer,
            } => match encode_batch(&payloads, self.max_message_size) {
                Ok(envelope) => {
                    self.enqueue(envelope, BATCH_MESSAGE_FORMAT, transaction, completer)
                }
                Err(e) => {
                    let _ = completer.complete(Err(e));
                }
            },
            Command::Close { completer } => {
                // Handled by the run loop.
                let _ = completer.complete(Ok(()));
            }
        }
    }

    fn enqueue(
        &mut self,
        payload: Bytes,
        message_format: u32,
        transaction: Option<TransactionId>,
        completer: Completer<()>,
    ) {
        if self.state.is_terminal() {
            let _ = completer.complete(Err(LinkError::illegal_state("sender is closed")));
            return;
        }
        if payload.len() > self.max_message_size {
            let _ = completer.complete(Err(self.too_large(payload.len())));
            return;
        }

        let tag = self.fresh_tag();
        let work = SendWork {
            payload,
            message_format,
            transaction,
            completer,
            tracker: TimeoutTracker::new(self.config.operation_timeout),
            last_error: None,
            transmitted_on: None,
        };
        if let Err(work) = self.pending.insert(tag.clone(), work) {
            work.fail(LinkError::illegal_state("delivery tag already pending"));
            return;
        }
        self.queue.push(tag.clone());
        tracing::trace!(client_id = %self.client_id, delivery_tag = %tag, queued = self.queue.len(), "send enqueued");
        self.ensure_open();
        self.dispatch();
    }

    fn fresh_tag(&self) -> DeliveryTag {
        loop {
            let tag = DeliveryTag::random();
            if !self.pending.contains(&tag) {
                return tag;
            }
        }
    }

    fn too_large(&self, size: usize) -> LinkError {
        LinkError::new(
            ErrorKind::PayloadTooLarge,
            format!(
                "payload of {} bytes exceeds the link limit of {} bytes",
                size, self.max_message_size
            ),
        )
    }

    fn ensure_open(&mut self) {
        if matches!(self.state, LinkState::Uninitialized | LinkState::Errored) {
            self.start_open();
        }
    }

    fn start_open(&mut self) {
        self.link_id = self.link_id.next();
        self.detached_while_opening = None;
        self.credit = 0;
        self.set_state(LinkState::Opening);

        let link_id = self.link_id;
        let attach = SenderAttach {
            name: self.client_id.clone(),
            entity_path: self.config.entity_path.clone(),
            via_path: self.config.via_path.clone(),
            settle_modes: self.config.settle_modes,
        };
        let sink = LinkEventSink::new(link_id, self.events_tx.clone());
        let factory = self.factory.clone();
        let refresher = self.refresher.clone();
        let internal_tx = self.internal_tx.clone();
        let timeout = self.config.operation_timeout;

        tracing::debug!(
            client_id = %self.client_id,
            %link_id,
            entity_path = %self.config.entity_path,
            "opening sender link"
        );
        self.scheduler
            .spawn_task(&format!("sender-open:{}", link_id), async move {
                let open = async {
                    let validity = refresher.authorize().await?;
                    let (link, remote) = factory.create_sender(attach, sink).await?;
                    Ok::<_, LinkError>((link, remote, validity))
                };
                let result = tokio::time::timeout(timeout, open)
                    .await
                    .unwrap_or_else(|_| Err(LinkError::timeout("sender link attach timed out")));
                let _ = internal_tx.send(Internal::Opened { link_id, result });
            });
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { link_id, result } => {
                if link_id != self.link_id || self.state != LinkState::Opening {
                    if let Ok((link, _, _)) = result {
                        self.close_in_background(link);
                    }
                    return;
                }
                match result {
                    Ok((link, remote, validity)) => {
                        if let Some(error) = self.detached_while_opening.take() {
                            self.close_in_background(link);
                            self.on_link_lost(error);
                            return;
                        }
                        self.max_message_size = remote
                            .max_message_size
                            .unwrap_or(self.config.max_message_size);
                        self.link = Some(link);
                        self.link_token = self.scheduler.shutdown_token().child_token();
                        self.refresher
                            .spawn_renewal(&self.scheduler, validity, self.link_token.clone());
                        self.retry.reset_retry_count(&self.client_id);
                        self.set_state(LinkState::Active);
                        tracing::debug!(
                            client_id = %self.client_id,
                            %link_id,
                            max_message_size = self.max_message_size,
                            "sender link attached"
                        );
                        self.dispatch();
                    }
                    Err(error) => {
                        tracing::warn!(client_id = %self.client_id, %link_id, error = %error, "sender link attach failed");
                        self.recover(error);
                    }
                }
            }
            Internal::ReopenDue { link_id } => {
                if link_id != self.link_id || self.state != LinkState::Opening || self.link.is_some()
                {
                    return;
                }
                if self.pending.is_empty() {
                    self.set_state(LinkState::Uninitialized);
                } else {
                    self.start_open();
                }
            }
            Internal::RetryDue { tag } => {
                if self.pending.contains(&tag) && !self.state.is_terminal() {
                    self.queue.push_retry(tag);
                    self.ensure_open();
                    self.dispatch();
                }
            }
        }
    }

    fn handle_event(&mut self, link_id: LinkId, event: LinkEvent) {
        if link_id != self.link_id || self.state.is_terminal() {
            tracing::trace!(client_id = %self.client_id, %link_id, "dropping event from stale link");
            return;
        }
        match event {
            LinkEvent::Credit(credit) => {
                self.credit = credit;
                self.dispatch();
            }
            LinkEvent::Settled { tag, outcome } => self.on_settled(tag, outcome),
            LinkEvent::Delivery(delivery) => {
                tracing::warn!(client_id = %self.client_id, delivery_tag = %delivery.tag, "delivery on a sender link ignored");
            }
            LinkEvent::Detached(error) => match self.state {
                LinkState::Active => self.on_link_lost(error),
                LinkState::Opening if self.link.is_none() => {
                    self.detached_while_opening = Some(error);
                }
                _ => {}
            },
        }
    }

    /// Transmit queued work while the link is active and has credit.
    fn dispatch(&mut self) {
        if self.state != LinkState::Active {
            return;
        }
        let presettled = self.config.settle_modes.sender == SenderSettleMode::Settled;
        let mut failure = None;

        if let Some(link) = self.link.as_ref() {
            while self.credit > 0 {
                let Some(tag) = self.queue.pop() else {
                    break;
                };
                let oversized = match self.pending.get(&tag) {
                    None => continue,
                    Some(work) if work.transmitted_on.is_some() => continue,
                    Some(work) => work.payload.len() > self.max_message_size,
                };
                if oversized {
                    if let Some(work) = self.pending.remove(&tag) {
                        let size = work.payload.len();
                        work.fail(LinkError::new(
                            ErrorKind::PayloadTooLarge,
                            format!(
                                "payload of {} bytes exceeds the link limit of {} bytes",
                                size, self.max_message_size
                            ),
                        ));
                    }
                    continue;
                }
                let Some(work) = self.pending.get_mut(&tag) else {
                    continue;
                };

                let delivery = OutboundDelivery {
                    tag: tag.clone(),
                    payload: work.payload.clone(),
                    message_format: work.message_format,
                    settled: presettled,
                    transaction: work.transaction.clone(),
                };
                match link.transmit(delivery) {
                    Ok(()) => {
                        self.credit -= 1;
                        work.transmitted_on = Some(self.link_id);
                        tracing::trace!(delivery_tag = %tag, credit = self.credit, "delivery transmitted");
                    }
                    Err(e) => {
                        work.last_error = Some(e.clone());
                        self.queue.push_retry(tag);
                        failure = Some(e);
                        break;
                    }
                }
                if presettled {
                    if let Some(work) = self.pending.remove(&tag) {
                        let _ = work.completer.complete(Ok(()));
                    }
                }
            }
        }

        if let Some(error) = failure {
            tracing::warn!(client_id = %self.client_id, error = %error, "transmit failed");
            self.on_link_lost(Some(error));
        }
    }

    fn on_settled(&mut self, tag: DeliveryTag, outcome: Outcome) {
        let Some(mut work) = self.pending.remove(&tag) else {
            tracing::warn!(client_id = %self.client_id, delivery_tag = %tag, "settlement for unknown delivery");
            return;
        };
        work.transmitted_on = None;

        match &outcome {
            Outcome::Accepted => {
                self.retry.reset_retry_count(&self.client_id);
                let _ = work.completer.complete(Ok(()));
            }
            Outcome::Released | Outcome::Modified { .. } => {
                tracing::debug!(client_id = %self.client_id, delivery_tag = %tag, ?outcome, "delivery cancelled by broker");
                work.fail(
                    LinkError::cancelled(format!("delivery {} was not accepted by the broker", tag))
                        .with_transient(false),
                );
            }
            Outcome::Rejected(_) => {
                let error = outcome.rejection_error().unwrap_or_else(|| {
                    LinkError::new(ErrorKind::Internal, "delivery rejected").with_transient(false)
                });
                self.retry_or_fail(tag, work, error);
            }
        }
    }

    /// Re-enqueue a rejected delivery after the policy's backoff, under a
    /// fresh tag, or fail it.
    fn retry_or_fail(&mut self, old_tag: DeliveryTag, mut work: SendWork, error: LinkError) {
        if error.is_transient() {
            self.retry.increment_retry_count(&self.client_id);
        }
        let Some(interval) =
            self.retry
                .next_interval(&self.client_id, &error, work.tracker.remaining())
        else {
            tracing::debug!(client_id = %self.client_id, delivery_tag = %old_tag, error = %error, "send failed");
            work.fail(error);
            return;
        };

        let tag = self.fresh_tag();
        tracing::debug!(
            client_id = %self.client_id,
            delivery_tag = %old_tag,
            new_tag = %tag,
            ?interval,
            error = %error,
            "send rejected, retrying"
        );
        work.last_error = Some(error);
        if let Err(work) = self.pending.insert(tag.clone(), work) {
            work.fail(LinkError::illegal_state("delivery tag already pending"));
            return;
        }
        let internal_tx = self.internal_tx.clone();
        self.scheduler
            .spawn_task(&format!("sender-retry:{}", tag), async move {
                tokio::time::sleep(interval).await;
                let _ = internal_tx.send(Internal::RetryDue { tag });
            });
    }

    fn on_link_lost(&mut self, error: Option<LinkError>) {
        self.link_token.cancel();
        self.credit = 0;
        if let Some(link) = self.link.take() {
            self.close_in_background(link);
        }

        let mut requeued = 0;
        for (tag, work) in self.pending.iter_mut() {
            if work.transmitted_on.take().is_some() {
                self.queue.push_retry(tag.clone());
                requeued += 1;
            }
        }

        let error = error.unwrap_or_else(|| {
            LinkError::new(ErrorKind::Communication, "sender link detached")
        });
        tracing::warn!(
            client_id = %self.client_id,
            link_id = %self.link_id,
            error = %error,
            requeued,
            "sender link lost"
        );
        self.recover(error);
    }

    /// Decide how to continue after the link failed or could not be opened.
    fn recover(&mut self, error: LinkError) {
        if !error.is_transient() {
            tracing::error!(client_id = %self.client_id, error = %error, "sender link failed");
            self.pending.fail_all(|_| error.clone());
            self.queue.clear();
            self.set_state(LinkState::Errored);
            return;
        }

        if self.pending.is_empty() {
            self.set_state(LinkState::Uninitialized);
            return;
        }
        for (_, work) in self.pending.iter_mut() {
            work.last_error = Some(error.clone());
        }

        self.retry.increment_retry_count(&self.client_id);
        let budget = self.longest_remaining();
        match self.retry.next_interval(&self.client_id, &error, budget) {
            Some(interval) => {
                self.set_state(LinkState::Opening);
                let link_id = self.link_id;
                let internal_tx = self.internal_tx.clone();
                tracing::debug!(client_id = %self.client_id, ?interval, "reopening sender link");
                self.scheduler
                    .spawn_task(&format!("sender-reopen:{}", link_id), async move {
                        tokio::time::sleep(interval).await;
                        let _ = internal_tx.send(Internal::ReopenDue { link_id });
                    });
            }
            None => {
                tracing::error!(client_id = %self.client_id, error = %error, "sender link retries exhausted");
                self.pending.fail_all(|_| error.clone());
                self.queue.clear();
                self.set_state(LinkState::Errored);
            }
        }
    }

    fn longest_remaining(&mut self) -> Duration {
        self.pending
            .iter_mut()
            .map(|(_, work)| work.tracker.remaining())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn close_in_background(&self, link: Box<dyn SenderLink>) {
        self.scheduler.spawn_task("sender-link-close", async move {
            link.close().await;
        });
    }

    fn sweep(&mut self) {
        let expired = self.pending.sweep();
        if !expired.is_empty() {
            tracing::debug!(client_id = %self.client_id, count = expired.len(), "sends timed out");
        }
    }

    async fn shutdown(&mut self) {
        self.set_state(LinkState::Closing);
        self.link_token.cancel();
        // Late attach results and events are ignored from now on.
        self.link_id = self.link_id.next();

        let cancelled = self
            .pending
            .fail_all(|_| LinkError::cancelled("sender closed").with_transient(false));
        self.queue.clear();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.management.release().await;
        self.set_state(LinkState::Closed);
        tracing::debug!(client_id = %self.client_id, cancelled, "sender closed");
    }
}
