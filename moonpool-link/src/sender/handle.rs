//! Caller-facing handle of a sender link manager.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::Command;
use super::engine::{self, EngineParts};
use crate::batch::SINGLE_MESSAGE_FORMAT;
use crate::codec::{JsonCodec, MessageCodec};
use crate::completion::{Completion, completion};
use crate::config::SenderConfig;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::management::{ManagementChannel, ManagementRequest, ManagementResponse};
use crate::message::{Message, TransactionId};
use crate::protocol::LinkFactory;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::state::LinkState;
use crate::token::{TokenRefresher, TokenRenewer};

/// Reliable sender for one entity.
///
/// Cloning is cheap; all clones drive the same link. The underlying link is
/// attached on the first send and transparently re-attached after transient
/// failures. The manager shuts down on [`close`](Self::close) or when the
/// last clone is dropped.
///
/// ```rust,ignore
/// let sender = SenderLinkManager::create(config, factory, renewer, retry, &scheduler, management)?;
/// sender.send(&Message::new(b"hello".to_vec()), None).await?;
/// ```
pub struct SenderLinkManager<C = JsonCodec> {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    config: Arc<SenderConfig>,
    client_id: Arc<str>,
    management: ManagementChannel,
    scheduler: Scheduler,
    codec: C,
}

impl<C: Clone> Clone for SenderLinkManager<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            client_id: self.client_id.clone(),
            management: self.management.clone(),
            scheduler: self.scheduler.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl SenderLinkManager<JsonCodec> {
    /// Create a sender using the JSON codec.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler already shut down.
    pub fn create(
        config: SenderConfig,
        factory: Arc<dyn LinkFactory>,
        renewer: Arc<dyn TokenRenewer>,
        retry: Arc<dyn RetryPolicy>,
        scheduler: &Scheduler,
        management: ManagementChannel,
    ) -> LinkResult<Self> {
        Self::create_with_codec(config, factory, renewer, retry, scheduler, management, JsonCodec)
    }
}

impl<C: MessageCodec> SenderLinkManager<C> {
    /// Create a sender with a custom message codec.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler already shut down.
    pub fn create_with_codec(
        config: SenderConfig,
        factory: Arc<dyn LinkFactory>,
        renewer: Arc<dyn TokenRenewer>,
        retry: Arc<dyn RetryPolicy>,
        scheduler: &Scheduler,
        management: ManagementChannel,
        codec: C,
    ) -> LinkResult<Self> {
        let lease = scheduler.lease()?;
        let client_id = format!("sender-{:08x}", rand::random::<u32>());
        let refresher = TokenRefresher::new(
            renewer,
            config.target_path().to_string(),
            config.token_refresh_margin,
        );
        management.retain();

        tracing::debug!(client_id = %client_id, entity_path = %config.entity_path, "creating sender");
        let (commands, state) = engine::spawn(EngineParts {
            config: config.clone(),
            client_id: client_id.clone(),
            factory,
            refresher,
            retry,
            scheduler: scheduler.clone(),
            lease,
            management: management.clone(),
        });

        Ok(Self {
            commands,
            state,
            config: Arc::new(config),
            client_id: client_id.into(),
            management,
            scheduler: scheduler.clone(),
            codec,
        })
    }

    /// Identifier of this sender, used as link name and retry key.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Entity this sender sends to.
    pub fn entity_path(&self) -> &str {
        &self.config.entity_path
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Send one message.
    ///
    /// Resolves once the broker accepted the message. Transient failures are
    /// retried within the configured operation timeout.
    pub fn send(&self, message: &Message, transaction: Option<&TransactionId>) -> Completion<()> {
        let payload = match self.codec.encode(message) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => return Completion::failed(e.into()),
        };
        let (completer, completion) = completion();
        self.post(Command::Send {
            payload,
            message_format: SINGLE_MESSAGE_FORMAT,
            transaction: transaction.cloned(),
            completer,
        });
        completion
    }

    /// Send several messages as one delivery.
    ///
    /// Fails with [`ErrorKind::PayloadTooLarge`] without sending anything
    /// when the batch does not fit the link's size limit.
    pub fn send_batch(
        &self,
        messages: &[Message],
        transaction: Option<&TransactionId>,
    ) -> Completion<()> {
        let payloads = match messages
            .iter()
            .map(|message| self.codec.encode(message))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(payloads) => payloads,
            Err(e) => return Completion::failed(e.into()),
        };
        let (completer, completion) = completion();
        self.post(Command::SendBatch {
            payloads,
            transaction: transaction.cloned(),
            completer,
        });
        completion
    }

    /// Schedule messages for enqueueing at their `scheduled_enqueue_time`.
    /// Resolves to the broker-assigned sequence numbers.
    pub fn schedule_messages(
        &self,
        messages: &[Message],
        transaction: Option<&TransactionId>,
        timeout: Duration,
    ) -> Completion<Vec<i64>> {
        if let Err(e) = self.check_open() {
            return Completion::failed(e);
        }
        if messages.is_empty() {
            return Completion::failed(LinkError::new(
                ErrorKind::InvalidArgument,
                "no messages to schedule",
            ));
        }
        if messages.iter().any(|m| m.scheduled_enqueue_time.is_none()) {
            return Completion::failed(LinkError::new(
                ErrorKind::InvalidArgument,
                "every scheduled message needs a scheduled enqueue time",
            ));
        }
        self.management.call(
            &self.scheduler,
            ManagementRequest::ScheduleMessages {
                messages: messages.to_vec(),
            },
            transaction.cloned(),
            timeout,
            ManagementResponse::into_sequence_numbers,
        )
    }

    /// Cancel previously scheduled messages.
    pub fn cancel_scheduled_messages(
        &self,
        sequence_numbers: Vec<i64>,
        timeout: Duration,
    ) -> Completion<()> {
        if let Err(e) = self.check_open() {
            return Completion::failed(e);
        }
        if sequence_numbers.is_empty() {
            return Completion::ready(Ok(()));
        }
        self.management.call(
            &self.scheduler,
            ManagementRequest::CancelScheduledMessages { sequence_numbers },
            None,
            timeout,
            ManagementResponse::into_empty,
        )
    }

    /// Close the sender. Pending sends fail with
    /// [`ErrorKind::Cancelled`].
    pub fn close(&self) -> Completion<()> {
        let (completer, completion) = completion();
        self.post(Command::Close { completer });
        completion
    }

    fn check_open(&self) -> LinkResult<()> {
        if self.state().is_terminal() {
            return Err(LinkError::illegal_state("sender is closed"));
        }
        Ok(())
    }

    fn post(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            command.reject(LinkError::illegal_state("sender is closed"));
        }
    }
}
