//! Caller-facing handle of a receiver link manager.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::Command;
use super::engine::{self, EngineParts};
use crate::codec::{JsonCodec, MessageCodec};
use crate::completion::{Completion, completion};
use crate::config::{ReceiveMode, ReceiverConfig, SessionRequest};
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::management::{ManagementChannel, ManagementRequest, ManagementResponse};
use crate::message::{
    DeliveryTag, DispositionStatus, LockToken, Outcome, ReceivedMessage, TransactionId,
};
use crate::protocol::LinkFactory;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::state::LinkStatus;
use crate::token::{TokenRefresher, TokenRenewer};

/// Reliable receiver for one entity or session.
///
/// Cloning is cheap; all clones share one link, one prefetch buffer and one
/// queue of receive calls, served in call order. The link is attached on
/// the first receive (or at once when prefetching) and re-attached after
/// transient failures.
///
/// Losing the session lock of a session receiver is final: every later call
/// fails with [`ErrorKind::IllegalState`] without touching the network.
pub struct ReceiverLinkManager<C = JsonCodec> {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<LinkStatus>,
    config: Arc<ReceiverConfig>,
    client_id: Arc<str>,
    management: ManagementChannel,
    scheduler: Scheduler,
    next_peek: Arc<AtomicI64>,
    _codec: PhantomData<C>,
}

impl<C> Clone for ReceiverLinkManager<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            config: self.config.clone(),
            client_id: self.client_id.clone(),
            management: self.management.clone(),
            scheduler: self.scheduler.clone(),
            next_peek: self.next_peek.clone(),
            _codec: PhantomData,
        }
    }
}

impl ReceiverLinkManager<JsonCodec> {
    /// Create a receiver using the JSON codec.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler already shut down.
    pub fn create(
        config: ReceiverConfig,
        factory: Arc<dyn LinkFactory>,
        renewer: Arc<dyn TokenRenewer>,
        retry: Arc<dyn RetryPolicy>,
        scheduler: &Scheduler,
        management: ManagementChannel,
    ) -> LinkResult<Self> {
        Self::create_with_codec(config, factory, renewer, retry, scheduler, management, JsonCodec)
    }
}

impl<C: MessageCodec> ReceiverLinkManager<C> {
    /// Create a receiver with a custom message codec.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler already shut down.
    pub fn create_with_codec(
        config: ReceiverConfig,
        factory: Arc<dyn LinkFactory>,
        renewer: Arc<dyn TokenRenewer>,
        retry: Arc<dyn RetryPolicy>,
        scheduler: &Scheduler,
        management: ManagementChannel,
        codec: C,
    ) -> LinkResult<Self> {
        let lease = scheduler.lease()?;
        let client_id = format!("receiver-{:08x}", rand::random::<u32>());
        let refresher = TokenRefresher::new(
            renewer,
            config.entity_path.clone(),
            config.token_refresh_margin,
        );
        management.retain();

        tracing::debug!(
            client_id = %client_id,
            entity_path = %config.entity_path,
            receive_mode = ?config.receive_mode,
            prefetch = config.prefetch_count,
            "creating receiver"
        );
        let (commands, status) = engine::spawn(EngineParts {
            config: config.clone(),
            client_id: client_id.clone(),
            factory,
            refresher,
            retry,
            scheduler: scheduler.clone(),
            lease,
            management: management.clone(),
            codec,
        });

        let manager = Self {
            commands,
            status,
            config: Arc::new(config),
            client_id: client_id.into(),
            management,
            scheduler: scheduler.clone(),
            next_peek: Arc::new(AtomicI64::new(0)),
            _codec: PhantomData,
        };
        if manager.config.prefetch_count > 0 {
            // Start filling the prefetch buffer right away.
            let _ = manager.commands.send(Command::Open);
        }
        Ok(manager)
    }

    /// Identifier of this receiver, used as link name and retry key.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Entity this receiver reads from.
    pub fn entity_path(&self) -> &str {
        &self.config.entity_path
    }

    /// Receive mode of this receiver.
    pub fn receive_mode(&self) -> ReceiveMode {
        self.config.receive_mode
    }

    /// Latest status published by the engine.
    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Session the receiver is bound to, once known.
    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    /// Wait for up to `max_messages` messages.
    ///
    /// Resolves with whatever arrived once at least one message is
    /// available, or with an empty list when `timeout` passes. A zero
    /// timeout only drains the prefetch buffer.
    pub fn receive(&self, max_messages: u32, timeout: Duration) -> Completion<Vec<ReceivedMessage>> {
        if let Err(e) = self.check_usable() {
            return Completion::failed(e);
        }
        let (completer, completion) = completion();
        self.post(Command::Receive {
            max_messages,
            timeout,
            completer,
        });
        completion
    }

    /// Complete a message: it is removed from the entity.
    pub fn complete(
        &self,
        tag: &DeliveryTag,
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        self.settle(tag, Outcome::Accepted, transaction)
    }

    /// Abandon a message: its lock is released for redelivery.
    pub fn abandon(
        &self,
        tag: &DeliveryTag,
        properties: BTreeMap<String, serde_json::Value>,
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        self.settle(tag, Outcome::abandon(properties), transaction)
    }

    /// Defer a message: it stays in the entity and can only be fetched by
    /// sequence number.
    pub fn defer(
        &self,
        tag: &DeliveryTag,
        properties: BTreeMap<String, serde_json::Value>,
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        self.settle(tag, Outcome::defer(properties), transaction)
    }

    /// Move a message to the dead-letter sub-queue.
    pub fn dead_letter(
        &self,
        tag: &DeliveryTag,
        reason: Option<String>,
        description: Option<String>,
        properties: BTreeMap<String, serde_json::Value>,
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        self.settle(
            tag,
            Outcome::dead_letter(reason, description, properties),
            transaction,
        )
    }

    fn settle(
        &self,
        tag: &DeliveryTag,
        outcome: Outcome,
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        if let Err(e) = self.check_usable() {
            return Completion::failed(e);
        }
        if let Err(e) = self.check_peek_lock() {
            return Completion::failed(e);
        }
        let (completer, completion) = completion();
        self.post(Command::Settle {
            tag: tag.clone(),
            outcome,
            transaction: transaction.cloned(),
            completer,
        });
        completion
    }

    /// Settle messages identified only by lock token, e.g. messages fetched
    /// with [`receive_deferred_messages`](Self::receive_deferred_messages).
    #[allow(clippy::too_many_arguments)]
    pub fn update_disposition_by_lock_tokens(
        &self,
        lock_tokens: Vec<LockToken>,
        status: DispositionStatus,
        dead_letter_reason: Option<String>,
        dead_letter_description: Option<String>,
        properties: BTreeMap<String, serde_json::Value>,
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        if let Err(e) = self.check_usable().and_then(|_| self.check_peek_lock()) {
            return Completion::failed(e);
        }
        if lock_tokens.is_empty() {
            return Completion::ready(Ok(()));
        }
        self.management.call(
            &self.scheduler,
            ManagementRequest::UpdateDisposition {
                lock_tokens,
                status,
                dead_letter_reason,
                dead_letter_description,
                properties,
                session_id: self.management_session_id(),
            },
            transaction.cloned(),
            self.config.operation_timeout,
            ManagementResponse::into_empty,
        )
    }

    /// Extend the locks of peek-locked messages. Resolves to the new expiry
    /// of each lock, in request order.
    pub fn renew_message_locks(&self, lock_tokens: Vec<LockToken>) -> Completion<Vec<SystemTime>> {
        if let Err(e) = self.check_usable().and_then(|_| self.check_peek_lock()) {
            return Completion::failed(e);
        }
        if self.config.session.is_some() {
            return Completion::failed(LinkError::new(
                ErrorKind::InvalidOperation,
                "messages of a session receiver are locked by the session lock",
            ));
        }
        if lock_tokens.is_empty() {
            return Completion::ready(Ok(Vec::new()));
        }
        self.management.call(
            &self.scheduler,
            ManagementRequest::RenewMessageLocks { lock_tokens },
            None,
            self.config.operation_timeout,
            ManagementResponse::into_locked_until,
        )
    }

    /// Fetch deferred messages by sequence number.
    pub fn receive_deferred_messages(
        &self,
        sequence_numbers: Vec<i64>,
    ) -> Completion<Vec<ReceivedMessage>> {
        if let Err(e) = self.check_usable() {
            return Completion::failed(e);
        }
        if sequence_numbers.is_empty() {
            return Completion::ready(Ok(Vec::new()));
        }
        self.management.call(
            &self.scheduler,
            ManagementRequest::ReceiveBySequenceNumbers {
                sequence_numbers,
                receive_mode: self.config.receive_mode,
                session_id: self.management_session_id(),
            },
            None,
            self.config.operation_timeout,
            ManagementResponse::into_messages,
        )
    }

    /// Extend the session lock. Resolves to the new expiry.
    ///
    /// A lock-lost answer makes the receiver permanently unusable.
    pub fn renew_session_lock(&self) -> Completion<SystemTime> {
        let session_id = match self.locked_session_id() {
            Ok(id) => id,
            Err(e) => return Completion::failed(e),
        };
        let (completer, completion) = completion();
        let management = self.management.clone();
        let commands = self.commands.clone();
        let timeout = self.config.operation_timeout;
        let client_id = self.client_id.clone();
        self.scheduler
            .spawn_task(&format!("session-lock-renewal:{}", session_id), async move {
                let result = management
                    .request(
                        ManagementRequest::RenewSessionLock {
                            session_id: session_id.clone(),
                        },
                        None,
                        timeout,
                    )
                    .await
                    .and_then(ManagementResponse::into_session_locked_until);
                match &result {
                    Ok(locked_until) => {
                        tracing::debug!(%client_id, %session_id, "session lock renewed");
                        let _ = commands.send(Command::SessionLockRenewed {
                            locked_until: *locked_until,
                        });
                    }
                    Err(error) if error.is_session_lock_lost() => {
                        let _ = commands.send(Command::SessionLockLost {
                            error: error.clone(),
                        });
                    }
                    Err(_) => {}
                }
                let _ = completer.complete(result);
            });
        completion
    }

    /// Read the state stored on the session.
    pub fn get_session_state(&self) -> Completion<Option<Bytes>> {
        let session_id = match self.locked_session_id() {
            Ok(id) => id,
            Err(e) => return Completion::failed(e),
        };
        self.management.call(
            &self.scheduler,
            ManagementRequest::GetSessionState { session_id },
            None,
            self.config.operation_timeout,
            ManagementResponse::into_session_state,
        )
    }

    /// Replace the state stored on the session; `None` clears it.
    pub fn set_session_state(&self, state: Option<Bytes>) -> Completion<()> {
        let session_id = match self.locked_session_id() {
            Ok(id) => id,
            Err(e) => return Completion::failed(e),
        };
        self.management.call(
            &self.scheduler,
            ManagementRequest::SetSessionState { session_id, state },
            None,
            self.config.operation_timeout,
            ManagementResponse::into_empty,
        )
    }

    /// Browse up to `count` messages starting at `from_sequence_number`
    /// without locking them. Later [`peek`](Self::peek) calls continue
    /// after the last message returned.
    pub fn peek_messages(
        &self,
        from_sequence_number: i64,
        count: u32,
    ) -> Completion<Vec<ReceivedMessage>> {
        if let Err(e) = self.check_usable() {
            return Completion::failed(e);
        }
        if count == 0 {
            return Completion::failed(LinkError::new(
                ErrorKind::InvalidArgument,
                "peek count must be at least 1",
            ));
        }
        let next_peek = self.next_peek.clone();
        self.management.call(
            &self.scheduler,
            ManagementRequest::PeekMessages {
                from_sequence_number,
                count,
                session_id: self.management_session_id(),
            },
            None,
            self.config.operation_timeout,
            move |response| {
                let messages = response.into_messages()?;
                if let Some(last) = messages.iter().filter_map(|m| m.sequence_number()).max() {
                    next_peek.store(last.saturating_add(1), Ordering::Release);
                }
                Ok(messages)
            },
        )
    }

    /// Browse the next `count` messages after the last peeked one.
    pub fn peek(&self, count: u32) -> Completion<Vec<ReceivedMessage>> {
        self.peek_messages(self.next_peek.load(Ordering::Acquire), count)
    }

    /// Close the receiver. Pending receive calls resolve empty; pending
    /// dispositions fail with [`ErrorKind::Cancelled`].
    pub fn close(&self) -> Completion<()> {
        let (completer, completion) = completion();
        self.post(Command::Close { completer });
        completion
    }

    fn check_usable(&self) -> LinkResult<()> {
        let status = self.status.borrow();
        if status.session_lock_lost {
            return Err(LinkError::illegal_state(
                "session lock lost; the receiver can no longer be used",
            ));
        }
        if status.state.is_terminal() {
            return Err(LinkError::illegal_state("receiver is closed"));
        }
        Ok(())
    }

    fn check_peek_lock(&self) -> LinkResult<()> {
        if self.config.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(LinkError::new(
                ErrorKind::InvalidOperation,
                "messages received in receive-and-delete mode are already settled",
            ));
        }
        Ok(())
    }

    /// Session id for side-channel calls, if the receiver is session bound.
    fn management_session_id(&self) -> Option<String> {
        self.session_id().or_else(|| match &self.config.session {
            Some(SessionRequest::Named(id)) => Some(id.clone()),
            _ => None,
        })
    }

    fn locked_session_id(&self) -> LinkResult<String> {
        self.check_usable()?;
        if self.config.session.is_none() {
            return Err(LinkError::new(
                ErrorKind::InvalidOperation,
                "receiver is not bound to a session",
            ));
        }
        self.management_session_id().ok_or_else(|| {
            LinkError::illegal_state("no session was acquired yet; receive first")
        })
    }

    fn post(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            command.reject(LinkError::illegal_state("receiver is closed"));
        }
    }
}
