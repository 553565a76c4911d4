//! Tracks outbound messages until the server acknowledges them.
//!
//! Every `Message` or `Presence` frame gets the next `msgSerial` when it is
//! sent and waits in a FIFO queue. The server answers with `Ack` or `Nack`
//! frames that cover a contiguous serial range:
//!
//! ```text
//!   queue:  [1] [2] [3] [4] [5]
//!   Ack  msgSerial=1 count=3   -> 1,2,3 resolved Ok
//!   queue:              [4] [5]
//!   Nack msgSerial=4 count=2   -> 4,5 resolved Err(error)
//! ```
//!
//! Resolution is cumulative: an entry whose serial is at or below the end
//! of an acknowledged range is resolved even if the range started after it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tidewire_protocol::{codes, Action, ErrorInfo, ProtocolMessage};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Resolves one send.
pub type Completion = oneshot::Sender<Result<(), ErrorInfo>>;

/// The ack processor as shared between the actor and its handles.
pub type SharedAckProcessor = Arc<Mutex<AckProcessor>>;

/// Locks a shared processor. A poisoned lock still holds a consistent
/// queue, since no processor method panics midway through an update.
pub(crate) fn lock(acks: &SharedAckProcessor) -> MutexGuard<'_, AckProcessor> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingAck {
    serial: i64,
    message: ProtocolMessage,
    completion: Completion,
}

/// Queue of sent messages awaiting `Ack` / `Nack`.
pub struct AckProcessor {
    next_serial: i64,
    queue: VecDeque<PendingAck>,
}

impl Default for AckProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AckProcessor {
    /// Creates an empty processor whose first serial is 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates an empty processor whose first serial is `serial`.
    pub fn starting_at(serial: i64) -> Self {
        Self {
            next_serial: serial,
            queue: VecDeque::new(),
        }
    }

    /// Assigns a serial to `msg` and queues it if its action needs an
    /// acknowledgement.
    ///
    /// Returns the completion back when the message does not need one, so
    /// the caller can resolve it as soon as the frame is written.
    pub fn queue_if_necessary(
        &mut self,
        msg: &mut ProtocolMessage,
        completion: Completion,
    ) -> Option<Completion> {
        if !msg.action.requires_ack() {
            return Some(completion);
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        msg.msg_serial = Some(serial);
        trace!(serial, channel = ?msg.channel, "queued for ack");
        self.queue.push_back(PendingAck {
            serial,
            message: msg.clone(),
            completion,
        });
        None
    }

    /// Processes an inbound frame. Returns `true` if it was an `Ack` or
    /// `Nack` and has been handled.
    pub fn on_message_received(&mut self, msg: &ProtocolMessage) -> bool {
        let outcome = match msg.action {
            Action::Ack => Ok(()),
            Action::Nack => Err(msg.error.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::NACK, Some(400), "message rejected by the server")
            })),
            _ => return false,
        };

        let Some((start, end)) = msg.serial_range() else {
            warn!(action = %msg.action, "ack frame without a usable serial range ignored");
            return true;
        };
        debug!(action = %msg.action, start, end, "ack range received");

        while self.queue.front().is_some_and(|entry| entry.serial <= end) {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            if entry.serial < start {
                debug!(serial = entry.serial, "entry resolved by a later range");
            }
            complete(entry.serial, entry.completion, outcome.clone());
        }
        true
    }

    /// Fails and removes every queued entry.
    pub fn clear_queue_and_fail_messages(&mut self, error: &ErrorInfo) {
        if !self.queue.is_empty() {
            debug!(pending = self.queue.len(), code = error.code, "failing ack queue");
        }
        for entry in self.queue.drain(..) {
            complete(entry.serial, entry.completion, Err(error.clone()));
        }
    }

    /// Fails and removes the one entry with `serial`. Returns whether such
    /// an entry existed.
    pub fn fail(&mut self, serial: i64, error: ErrorInfo) -> bool {
        let Some(index) = self.queue.iter().position(|entry| entry.serial == serial) else {
            return false;
        };
        match self.queue.remove(index) {
            Some(entry) => {
                complete(entry.serial, entry.completion, Err(error));
                true
            }
            None => false,
        }
    }

    /// Copies of every queued message, for sending again on a new link.
    ///
    /// When `new_epoch` is set the connection changed identity, so the
    /// serial counter restarts at 0 and the queued entries are renumbered in
    /// order before being returned.
    pub fn messages_for_resend(&mut self, new_epoch: bool) -> Vec<ProtocolMessage> {
        if new_epoch {
            self.next_serial = 0;
            for entry in &mut self.queue {
                entry.serial = self.next_serial;
                entry.message.msg_serial = Some(self.next_serial);
                self.next_serial += 1;
            }
        }
        self.queue.iter().map(|entry| entry.message.clone()).collect()
    }

    /// The serial the next queued message will get.
    pub fn next_serial(&self) -> i64 {
        self.next_serial
    }

    /// Number of messages awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing awaits acknowledgement.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn complete(serial: i64, completion: Completion, result: Result<(), ErrorInfo>) {
    if completion.send(result).is_err() {
        warn!(serial, "completion receiver dropped");
    }
}
