//! Channel handles.
//!
//! A [`Channel`] is a name bound to a connection. It holds no state of its
//! own; attaching, publishing and subscribing all go through the
//! connection's [`ConnectionManager`].

use std::collections::VecDeque;
use std::time::Duration;

use tidewire_connection::{ConnectionManager, InboundEvent};
use tidewire_encoding::ChannelOptions;
use tidewire_protocol::{codes, Action, Data, ErrorInfo, Message, ProtocolMessage};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::TidewireError;

/// A named channel on a connection.
///
/// Cheap to clone; every clone refers to the same channel.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    connection: ConnectionManager,
    request_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(name: String, connection: ConnectionManager, request_timeout: Duration) -> Self {
        Self {
            name,
            connection,
            request_timeout,
        }
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets how this channel's payloads are encoded and decoded, e.g. to
    /// enable encryption.
    pub async fn set_options(&self, options: ChannelOptions) -> Result<(), TidewireError> {
        self.connection
            .set_channel_options(self.name.clone(), options)
            .await?;
        Ok(())
    }

    /// Attaches to the channel and waits for the server to confirm.
    ///
    /// # Errors
    /// [`TidewireError::Channel`] if the server refuses the attach or does not
    /// answer within the request timeout.
    pub async fn attach(&self) -> Result<(), TidewireError> {
        self.request(Action::Attach, Action::Attached).await
    }

    /// Detaches from the channel and waits for the server to confirm.
    pub async fn detach(&self) -> Result<(), TidewireError> {
        self.request(Action::Detach, Action::Detached).await
    }

    /// Sends `action` and waits for `reply` on this channel.
    async fn request(&self, action: Action, reply: Action) -> Result<(), TidewireError> {
        // Subscribe first so the reply cannot slip past.
        let mut inbound = self.connection.subscribe();
        let mut msg = ProtocolMessage::new(action);
        msg.channel = Some(self.name.clone());
        self.connection.send(msg).await?;
        debug!(channel = %self.name, %action, "waiting for reply");

        let wait = async {
            loop {
                let frame = match inbound.recv().await {
                    Ok(InboundEvent::Message(frame)) => frame,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %self.name, skipped, "subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(self.state_error());
                    }
                };
                if frame.channel.as_deref() != Some(self.name.as_str()) {
                    continue;
                }
                if frame.action == reply {
                    return Ok(());
                }
                if matches!(frame.action, Action::Error | Action::Detached) {
                    return Err(frame.error.unwrap_or_else(|| {
                        ErrorInfo::new(codes::UNKNOWN_CHANNEL_ERROR, Some(500), format!("{action} refused"))
                    }));
                }
            }
        };

        let result = match tokio::time::timeout(self.request_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ErrorInfo::new(
                codes::TIMEOUT,
                Some(504),
                format!("no {reply} within the request timeout"),
            )),
        };
        result.map_err(|error| TidewireError::Channel {
            channel: self.name.clone(),
            error,
        })
    }

    fn state_error(&self) -> ErrorInfo {
        self.connection.state().error()
    }

    /// Publishes one message and waits for the server to acknowledge it.
    pub async fn publish(&self, name: impl Into<String>, data: impl Into<Data>) -> Result<(), TidewireError> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    /// Publishes several messages in one frame; they are acknowledged
    /// together.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), TidewireError> {
        let frame = ProtocolMessage::publish(self.name.clone(), messages);
        self.connection.send(frame).await?;
        Ok(())
    }

    /// Subscribes to messages published on this channel.
    ///
    /// Only messages received after this call are delivered.
    pub fn subscribe(&self) -> ChannelSubscription {
        ChannelSubscription {
            channel: self.name.clone(),
            inbound: self.connection.subscribe(),
            buffered: VecDeque::new(),
        }
    }
}

/// Messages arriving on one channel, decoded.
#[derive(Debug)]
pub struct ChannelSubscription {
    channel: String,
    inbound: broadcast::Receiver<InboundEvent>,
    buffered: VecDeque<Message>,
}

impl ChannelSubscription {
    /// The next message, or `None` once the connection is gone.
    ///
    /// Messages the subscriber was too slow to receive are skipped with a
    /// warning.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(msg) = self.buffered.pop_front() {
                return Some(msg);
            }
            match self.inbound.recv().await {
                Ok(InboundEvent::Message(frame))
                    if frame.action == Action::Message
                        && frame.channel.as_deref() == Some(self.channel.as_str()) =>
                {
                    self.buffered.extend(frame.messages);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
