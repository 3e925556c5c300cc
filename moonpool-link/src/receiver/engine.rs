//! Engine task of a receiver link manager.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::prefetch::PrefetchBuffer;
use super::{Command, DispositionWork, Internal, ReceiveWork};
use crate::codec::MessageCodec;
use crate::completion::Completer;
use crate::config::{ReceiveMode, ReceiverConfig, SessionRequest};
use crate::credit::CreditFlowController;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::management::ManagementChannel;
use crate::message::{DeliveryTag, Message, Outcome, ReceivedMessage, TransactionId};
use crate::pending::{PendingTable, PendingWork};
use crate::protocol::{
    InboundDelivery, LinkEvent, LinkEventSink, LinkFactory, LinkId, ReceiverAttach, ReceiverLink,
    RemoteAttach,
};
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SchedulerLease};
use crate::state::{LinkState, LinkStatus};
use crate::timeout::TimeoutTracker;
use crate::token::TokenRefresher;

/// Everything an engine needs from its manager.
pub(crate) struct EngineParts<C> {
    pub(crate) config: ReceiverConfig,
    pub(crate) client_id: String,
    pub(crate) factory: Arc<dyn LinkFactory>,
    pub(crate) refresher: TokenRefresher,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) scheduler: Scheduler,
    pub(crate) lease: SchedulerLease,
    pub(crate) management: ManagementChannel,
    pub(crate) codec: C,
}

/// Start the engine task. Returns the command channel and status feed.
pub(crate) fn spawn<C: MessageCodec>(
    parts: EngineParts<C>,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<LinkStatus>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(LinkStatus::new());

    let name = format!("receiver-engine:{}", parts.client_id);
    let scheduler = parts.scheduler.clone();
    let engine = ReceiverEngine {
        credit: CreditFlowController::new(
            parts.config.prefetch_count,
            parts.config.credit_batch_threshold,
        ),
        config: parts.config,
        client_id: parts.client_id,
        factory: parts.factory,
        refresher: parts.refresher,
        retry: parts.retry,
        scheduler: parts.scheduler,
        management: parts.management,
        codec: parts.codec,
        status_tx,
        events_tx,
        internal_tx,
        status: LinkStatus::new(),
        link: None,
        link_id: LinkId::new(0),
        link_token: CancellationToken::new(),
        detached_while_opening: None,
        buffer: PrefetchBuffer::new(),
        receives: VecDeque::new(),
        unsettled: HashMap::new(),
        dispositions: PendingTable::new("disposition"),
        _lease: parts.lease,
    };
    scheduler.spawn_task(&name, engine.run(commands_rx, events_rx, internal_rx));
    (commands_tx, status_rx)
}

struct ReceiverEngine<C> {
    config: ReceiverConfig,
    client_id: String,
    factory: Arc<dyn LinkFactory>,
    refresher: TokenRefresher,
    retry: Arc<dyn RetryPolicy>,
    scheduler: Scheduler,
    management: ManagementChannel,
    codec: C,
    status_tx: watch::Sender<LinkStatus>,
    events_tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    status: LinkStatus,
    link: Option<Box<dyn ReceiverLink>>,
    link_id: LinkId,
    link_token: CancellationToken,
    detached_while_opening: Option<Option<LinkError>>,
    credit: CreditFlowController,
    buffer: PrefetchBuffer,
    receives: VecDeque<ReceiveWork>,
    /// Deliveries left unsettled on the wire, by the link they arrived on.
    unsettled: HashMap<DeliveryTag, LinkId>,
    dispositions: PendingTable<DeliveryTag, DispositionWork>,
    _lease: SchedulerLease,
}

impl<C: MessageCodec> ReceiverEngine<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut dispatch =
            tokio::time::interval(self.config.dispatch_interval.max(Duration::from_millis(1)));
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep =
            tokio::time::interval(self.config.sweep_interval.max(Duration::from_millis(1)));
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
                        tracing::debug!(client_id = %self.client_id, "all receiver handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some((link_id, event)) = events.recv() => self.handle_event(link_id, event),
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = dispatch.tick() => self.on_dispatch_tick(),
                _ = sweep.tick() => self.sweep(),
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject(LinkError::illegal_state("receiver is closed"));
        }
    }

    fn state(&self) -> LinkState {
        self.status.state
    }

    fn set_state(&mut self, state: LinkState) {
        if self.status.state != state {
            tracing::trace!(client_id = %self.client_id, from = ?self.status.state, to = ?state, "receiver state");
        }
        self.status.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn check_usable(&self) -> LinkResult<()> {
        if self.status.session_lock_lost {
            return Err(LinkError::illegal_state(
                "session lock lost; the receiver can no longer be used",
            ));
        }
        if self.state().is_terminal() {
            return Err(LinkError::illegal_state("receiver is closed"));
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Receive {
                max_messages,
                timeout,
                completer,
            } => self.on_receive(max_messages, timeout, completer),
            Command::Settle {
                tag,
                outcome,
                transaction,
                completer,
            } => self.on_settle(tag, outcome, transaction, completer),
            Command::Open => {
                if self.check_usable().is_ok() {
                    self.ensure_open();
                }
            }
            Command::SessionLockRenewed { locked_until } => {
                if !self.status.session_lock_lost {
                    self.status.session_locked_until = Some(locked_until);
                    self.publish();
                }
            }
            Command::SessionLockLost { error } => self.on_session_lock_lost(error),
            Command::Close { completer } => {
                // Handled by the run loop.
                let _ = completer.complete(Ok(()));
            }
        }
    }

    // ---- receive path -------------------------------------------------

    fn on_receive(
        &mut self,
        max_messages: u32,
        timeout: Duration,
        completer: Completer<Vec<ReceivedMessage>>,
    ) {
        if let Err(e) = self.check_usable() {
            let _ = completer.complete(Err(e));
            return;
        }
        if max_messages == 0 {
            let _ = completer.complete(Err(LinkError::new(
                ErrorKind::InvalidArgument,
                "max_messages must be at least 1",
            )));
            return;
        }

        self.ensure_open();
        if timeout.is_zero() {
            // Non-blocking poll: whatever is buffered right now.
            let messages = self.buffer.pop_up_to(max_messages);
            if let Err(Ok(messages)) = completer.complete(Ok(messages)) {
                self.buffer.restore(messages);
            }
        } else {
            self.receives.push_back(ReceiveWork {
                max_messages,
                completer,
                tracker: TimeoutTracker::new(timeout),
            });
            self.dispatch_receives();
        }
        self.update_credit();
    }

    fn demand(&self) -> u32 {
        self.receives
            .iter()
            .fold(0u32, |total, work| total.saturating_add(work.max_messages))
    }

    /// Hand buffered messages to pending receive calls, oldest call first.
    fn dispatch_receives(&mut self) {
        while !self.buffer.is_empty() {
            let Some(work) = self.receives.pop_front() else {
                break;
            };
            if work.completer.is_abandoned() {
                continue;
            }
            let messages = self.buffer.pop_up_to(work.max_messages);
            tracing::trace!(client_id = %self.client_id, count = messages.len(), "receive satisfied");
            if let Err(Ok(messages)) = work.completer.complete(Ok(messages)) {
                self.buffer.restore(messages);
            }
        }
    }

    /// Complete expired receive calls with an empty result.
    fn expire_receives(&mut self) {
        if self.receives.is_empty() {
            return;
        }
        let mut kept = VecDeque::with_capacity(self.receives.len());
        for work in self.receives.drain(..) {
            if work.completer.is_abandoned() {
                continue;
            }
            if work.tracker.is_expired() {
                let _ = work.completer.complete(Ok(Vec::new()));
            } else {
                kept.push_back(work);
            }
        }
        self.receives = kept;
    }

    fn on_dispatch_tick(&mut self) {
        self.dispatch_receives();
        self.expire_receives();
        self.reclaim_credit();
        self.update_credit();
        if self.state() == LinkState::Active {
            if let Some(credit) = self.credit.flush() {
                self.flow(credit);
            }
        }
    }

    fn update_credit(&mut self) {
        if self.state() != LinkState::Active {
            return;
        }
        let demand = self.demand();
        if let Some(credit) = self.credit.evaluate(self.buffer.len(), demand) {
            self.flow(credit);
        }
    }

    /// Drain the link when granted credit outlived the receives it was for.
    fn reclaim_credit(&mut self) {
        if self.state() != LinkState::Active {
            return;
        }
        let outstanding = self.credit.outstanding();
        let demand = self.demand();
        if !self.credit.reclaim(self.buffer.len(), demand) {
            return;
        }
        let result = match self.link.as_ref() {
            Some(link) => link.drain(),
            None => return,
        };
        match result {
            Ok(()) => {
                tracing::debug!(client_id = %self.client_id, outstanding, "credit drained");
            }
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, error = %e, "drain failed");
                self.on_link_lost(Some(e));
            }
        }
    }

    fn flow(&mut self, credit: u32) {
        let result = match self.link.as_ref() {
            Some(link) => link.flow(credit),
            None => return,
        };
        match result {
            Ok(()) => {
                tracing::trace!(client_id = %self.client_id, credit, "credit granted");
            }
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, error = %e, "flow failed");
                self.on_link_lost(Some(e));
            }
        }
    }

    fn on_delivery(&mut self, delivery: InboundDelivery) {
        self.credit.on_delivery();
        let InboundDelivery {
            tag,
            payload,
            settled,
        } = delivery;

        let message: Message = match self.codec.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, delivery_tag = %tag, error = %e, "dropping undecodable delivery");
                if !settled {
                    if let Some(link) = self.link.as_ref() {
                        if let Err(e) = link.disposition(&tag, &Outcome::Released, None) {
                            tracing::warn!(client_id = %self.client_id, delivery_tag = %tag, error = %e, "release of undecodable delivery failed");
                        }
                        link.settle(&tag);
                    }
                }
                self.update_credit();
                return;
            }
        };

        let settled = if !settled && self.config.receive_mode == ReceiveMode::ReceiveAndDelete {
            if let Some(link) = self.link.as_ref() {
                if let Err(e) = link.disposition(&tag, &Outcome::Accepted, None) {
                    tracing::warn!(client_id = %self.client_id, delivery_tag = %tag, error = %e, "auto-accept in receive-and-delete mode failed");
                }
                link.settle(&tag);
            }
            true
        } else {
            settled
        };

        let lock_token = if settled { None } else { tag.lock_token() };
        if !settled {
            self.unsettled.insert(tag.clone(), self.link_id);
        }
        self.buffer.push(ReceivedMessage {
            message,
            delivery_tag: Some(tag),
            lock_token,
            settled,
        });
        self.dispatch_receives();
        self.update_credit();
    }

    // ---- disposition path ---------------------------------------------

    fn on_settle(
        &mut self,
        tag: DeliveryTag,
        outcome: Outcome,
        transaction: Option<TransactionId>,
        completer: Completer<()>,
    ) {
        if let Err(e) = self.check_usable() {
            let _ = completer.complete(Err(e));
            return;
        }
        if self.config.receive_mode == ReceiveMode::ReceiveAndDelete {
            let _ = completer.complete(Err(LinkError::new(
                ErrorKind::InvalidOperation,
                "messages received in receive-and-delete mode are already settled",
            )));
            return;
        }
        if self.dispositions.contains(&tag) {
            let _ = completer.complete(Err(LinkError::illegal_state(format!(
                "a disposition for delivery {} is already in flight",
                tag
            ))));
            return;
        }
        if !self.is_live(&tag) {
            let _ = completer.complete(Err(Self::delivery_not_found(&tag)));
            return;
        }

        let work = DispositionWork {
            outcome,
            transaction,
            completer,
            tracker: TimeoutTracker::new(self.config.operation_timeout),
            last_error: None,
        };
        if let Err(work) = self.dispositions.insert(tag.clone(), work) {
            work.fail(LinkError::illegal_state("disposition already in flight"));
            return;
        }
        self.send_disposition(&tag);
    }

    /// Whether `tag` is unsettled on the current, attached link.
    fn is_live(&self, tag: &DeliveryTag) -> bool {
        self.link.is_some()
            && self.state() == LinkState::Active
            && self.unsettled.get(tag) == Some(&self.link_id)
    }

    fn delivery_not_found(tag: &DeliveryTag) -> LinkError {
        LinkError::new(
            ErrorKind::DeliveryNotFound,
            format!(
                "delivery {} is not known to the current link; receive the message again",
                tag
            ),
        )
    }

    /// Write the disposition frame of a pending disposition.
    fn send_disposition(&mut self, tag: &DeliveryTag) {
        let Some(work) = self.dispositions.get(tag) else {
            return;
        };
        let result = match self.link.as_ref() {
            Some(link) => link.disposition(tag, &work.outcome, work.transaction.as_ref()),
            None => Err(LinkError::new(
                ErrorKind::Communication,
                "receiver link is not attached",
            )),
        };
        match result {
            Ok(()) => {
                tracing::trace!(client_id = %self.client_id, delivery_tag = %tag, "disposition sent");
            }
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, delivery_tag = %tag, error = %e, "disposition write failed");
                if let Some(work) = self.dispositions.remove(tag) {
                    work.fail(e.clone());
                }
                self.on_link_lost(Some(e));
            }
        }
    }

    fn on_remote_settled(&mut self, tag: DeliveryTag, outcome: Outcome) {
        let Some(work) = self.dispositions.remove(&tag) else {
            tracing::trace!(client_id = %self.client_id, delivery_tag = %tag, "remote settlement without pending disposition");
            return;
        };

        if outcome.kind() == work.outcome.kind() {
            if let Some(link) = self.link.as_ref() {
                link.settle(&tag);
            }
            self.unsettled.remove(&tag);
            self.retry.reset_retry_count(&self.client_id);
            let _ = work.completer.complete(Ok(()));
            return;
        }

        match &outcome {
            Outcome::Rejected(_) => {
                let error = outcome.rejection_error().unwrap_or_else(|| {
                    LinkError::new(ErrorKind::Internal, "disposition rejected").with_transient(false)
                });
                if error.is_session_lock_lost() {
                    work.fail(error.clone());
                    self.on_session_lock_lost(error);
                    return;
                }
                if error.kind() == ErrorKind::MessageLockLost {
                    self.unsettled.remove(&tag);
                }
                self.retry_disposition_or_fail(tag, work, error);
            }
            Outcome::Released => {
                work.fail(
                    LinkError::cancelled(format!("delivery {} was released by the broker", tag))
                        .with_transient(false),
                );
            }
            Outcome::Accepted | Outcome::Modified { .. } => {
                let error = LinkError::new(
                    ErrorKind::Internal,
                    format!(
                        "broker answered {:?} to a {:?} disposition",
                        outcome.kind(),
                        work.outcome.kind()
                    ),
                )
                .with_transient(false);
                work.fail(error);
            }
        }
    }

    fn retry_disposition_or_fail(
        &mut self,
        tag: DeliveryTag,
        mut work: DispositionWork,
        error: LinkError,
    ) {
        if error.is_transient() {
            self.retry.increment_retry_count(&self.client_id);
        }
        let Some(interval) =
            self.retry
                .next_interval(&self.client_id, &error, work.tracker.remaining())
        else {
            work.fail(error);
            return;
        };

        tracing::debug!(client_id = %self.client_id, delivery_tag = %tag, ?interval, error = %error, "disposition rejected, retrying");
        work.last_error = Some(error);
        if let Err(work) = self.dispositions.insert(tag.clone(), work) {
            work.fail(LinkError::illegal_state("disposition already in flight"));
            return;
        }
        let internal_tx = self.internal_tx.clone();
        self.scheduler
            .spawn_task(&format!("disposition-retry:{}", tag), async move {
                tokio::time::sleep(interval).await;
                let _ = internal_tx.send(Internal::DispositionRetryDue { tag });
            });
    }

    fn on_disposition_retry_due(&mut self, tag: DeliveryTag) {
        if !self.dispositions.contains(&tag) {
            return;
        }
        if self.is_live(&tag) {
            self.send_disposition(&tag);
            return;
        }
        if let Some(work) = self.dispositions.remove(&tag) {
            let mut error = Self::delivery_not_found(&tag);
            if let Some(cause) = work.last_error.clone() {
                error = error.with_cause(cause);
            }
            work.fail(error);
        }
    }

    // ---- link lifecycle -----------------------------------------------

    fn ensure_open(&mut self) {
        if self.status.session_lock_lost {
            return;
        }
        if matches!(self.state(), LinkState::Uninitialized | LinkState::Errored) {
            self.start_open();
        }
    }

    fn start_open(&mut self) {
        self.link_id = self.link_id.next();
        self.detached_while_opening = None;
        self.set_state(LinkState::Opening);

        let link_id = self.link_id;
        let attach = ReceiverAttach {
            name: self.client_id.clone(),
            entity_path: self.config.entity_path.clone(),
            settle_modes: self.config.settle_modes,
            session: self.config.session.clone(),
            browsable_session: self.config.browsable_session,
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
            "opening receiver link"
        );
        self.scheduler
            .spawn_task(&format!("receiver-open:{}", link_id), async move {
                let open = async {
                    let validity = refresher.authorize().await?;
                    let (link, remote) = factory.create_receiver(attach, sink).await?;
                    Ok::<_, LinkError>((link, remote, validity))
                };
                let result = tokio::time::timeout(timeout, open)
                    .await
                    .unwrap_or_else(|_| Err(LinkError::timeout("receiver link attach timed out")));
                let _ = internal_tx.send(Internal::Opened { link_id, result });
            });
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { link_id, result } => self.on_opened(link_id, result),
            Internal::ReopenDue { link_id } => {
                if link_id != self.link_id
                    || self.state() != LinkState::Opening
                    || self.link.is_some()
                    || self.status.session_lock_lost
                {
                    return;
                }
                if self.wants_link() {
                    self.start_open();
                } else {
                    self.set_state(LinkState::Uninitialized);
                }
            }
            Internal::DispositionRetryDue { tag } => self.on_disposition_retry_due(tag),
        }
    }

    fn on_opened(
        &mut self,
        link_id: LinkId,
        result: LinkResult<(Box<dyn ReceiverLink>, RemoteAttach, Duration)>,
    ) {
        if link_id != self.link_id || self.state() != LinkState::Opening {
            if let Ok((link, _, _)) = result {
                self.close_in_background(link);
            }
            return;
        }

        let (link, remote, validity) = match result {
            Ok(opened) => opened,
            Err(error) => {
                tracing::warn!(client_id = %self.client_id, %link_id, error = %error, "receiver link attach failed");
                if error.is_session_lock_lost() && self.config.session.is_some() {
                    self.on_session_lock_lost(error);
                } else {
                    self.recover(error);
                }
                return;
            }
        };
        if let Some(error) = self.detached_while_opening.take() {
            self.close_in_background(link);
            self.on_link_lost(error);
            return;
        }

        if self.config.session.is_some() {
            let session_id = remote.session_id.clone().or_else(|| match &self.config.session {
                Some(SessionRequest::Named(id)) => Some(id.clone()),
                _ => None,
            });
            self.status.session_id = session_id;
            self.status.session_locked_until = if self.config.browsable_session {
                None
            } else {
                remote.session_locked_until
            };
        }

        self.link = Some(link);
        self.link_token = self.scheduler.shutdown_token().child_token();
        self.refresher
            .spawn_renewal(&self.scheduler, validity, self.link_token.clone());
        self.credit.reset();
        self.retry.reset_retry_count(&self.client_id);
        self.set_state(LinkState::Active);
        tracing::debug!(
            client_id = %self.client_id,
            %link_id,
            session_id = ?self.status.session_id,
            "receiver link attached"
        );
        self.update_credit();
    }

    fn handle_event(&mut self, link_id: LinkId, event: LinkEvent) {
        if link_id != self.link_id || self.state().is_terminal() || self.status.session_lock_lost {
            tracing::trace!(client_id = %self.client_id, %link_id, "dropping event from stale link");
            return;
        }
        match event {
            LinkEvent::Delivery(delivery) => self.on_delivery(delivery),
            LinkEvent::Settled { tag, outcome } => self.on_remote_settled(tag, outcome),
            LinkEvent::Credit(_) => {}
            LinkEvent::Detached(error) => match self.state() {
                LinkState::Active => self.on_link_lost(error),
                LinkState::Opening if self.link.is_none() => {
                    self.detached_while_opening = Some(error);
                }
                _ => {}
            },
        }
    }

    /// Whether anything needs an attached link.
    fn wants_link(&self) -> bool {
        !self.receives.is_empty() || self.config.prefetch_count > 0
    }

    fn on_link_lost(&mut self, error: Option<LinkError>) {
        self.link_token.cancel();
        if let Some(link) = self.link.take() {
            self.close_in_background(link);
        }
        self.credit.reset();

        let cause = error.unwrap_or_else(|| {
            LinkError::new(ErrorKind::Communication, "receiver link detached")
        });
        let dropped = self.buffer.drop_unsettled();
        self.unsettled.clear();
        let failed = self.dispositions.fail_all(|_| {
            LinkError::new(
                ErrorKind::DeliveryNotFound,
                "receiver link was lost before the disposition was acknowledged",
            )
            .with_cause(cause.clone())
        });
        tracing::warn!(
            client_id = %self.client_id,
            link_id = %self.link_id,
            error = %cause,
            dropped,
            failed,
            "receiver link lost"
        );

        if cause.is_session_lock_lost() && self.config.session.is_some() {
            self.on_session_lock_lost(cause);
            return;
        }
        self.recover(cause);
    }

    /// Decide how to continue after the link failed or could not be opened.
    fn recover(&mut self, error: LinkError) {
        if !error.is_transient() {
            tracing::error!(client_id = %self.client_id, error = %error, "receiver link failed");
            self.fail_receives(&error);
            self.set_state(LinkState::Errored);
            return;
        }
        if !self.wants_link() {
            self.set_state(LinkState::Uninitialized);
            return;
        }

        self.retry.increment_retry_count(&self.client_id);
        let budget = self
            .receives
            .iter()
            .map(|work| work.tracker.remaining())
            .max()
            .unwrap_or(self.config.operation_timeout);
        match self.retry.next_interval(&self.client_id, &error, budget) {
            Some(interval) => {
                self.set_state(LinkState::Opening);
                let link_id = self.link_id;
                let internal_tx = self.internal_tx.clone();
                tracing::debug!(client_id = %self.client_id, ?interval, "reopening receiver link");
                self.scheduler
                    .spawn_task(&format!("receiver-reopen:{}", link_id), async move {
                        tokio::time::sleep(interval).await;
                        let _ = internal_tx.send(Internal::ReopenDue { link_id });
                    });
            }
            None => {
                tracing::error!(client_id = %self.client_id, error = %error, "receiver link retries exhausted");
                self.fail_receives(&error);
                self.set_state(LinkState::Errored);
            }
        }
    }

    fn fail_receives(&mut self, error: &LinkError) {
        for work in self.receives.drain(..) {
            let _ = work.completer.complete(Err(error.clone()));
        }
    }

    /// The session lock is gone: the receiver is unusable for good.
    fn on_session_lock_lost(&mut self, error: LinkError) {
        if self.status.session_lock_lost {
            return;
        }
        tracing::error!(
            client_id = %self.client_id,
            session_id = ?self.status.session_id,
            error = %error,
            "session lock lost"
        );
        self.link_token.cancel();
        if let Some(link) = self.link.take() {
            self.close_in_background(link);
        }
        self.fail_receives(&error);
        self.dispositions.fail_all(|_| error.clone());
        self.buffer.clear();
        self.unsettled.clear();
        self.status.session_lock_lost = true;
        self.status.session_locked_until = None;
        self.set_state(LinkState::Errored);
    }

    fn close_in_background(&self, link: Box<dyn ReceiverLink>) {
        self.scheduler.spawn_task("receiver-link-close", async move {
            link.close().await;
        });
    }

    fn sweep(&mut self) {
        let expired = self.dispositions.sweep();
        if !expired.is_empty() {
            tracing::debug!(client_id = %self.client_id, count = expired.len(), "dispositions timed out");
        }
    }

    async fn shutdown(&mut self) {
        self.set_state(LinkState::Closing);
        self.link_token.cancel();
        self.link_id = self.link_id.next();

        // A clean close ends pending receives with what they have: nothing.
        for work in self.receives.drain(..) {
            let _ = work.completer.complete(Ok(Vec::new()));
        }
        let cancelled = self
            .dispositions
            .fail_all(|_| LinkError::cancelled("receiver closed").with_transient(false));
        let dropped = self.buffer.clear();
        self.unsettled.clear();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.management.release().await;
        self.set_state(LinkState::Closed);
        tracing::debug!(client_id = %self.client_id, cancelled, dropped, "receiver closed");
    }
}
