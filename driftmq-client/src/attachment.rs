//! Client-side record of topic attachments
//!
//! Each attachment moves through three states:
//!
//! ```text
//!   subscribe()      ATTACHED           detach()          DETACHED
//!  ───────────▶ Pending ──────▶ Active ──────────▶ Detaching ──────▶ (removed)
//! ```
//!
//! A `Pending` attachment can also go straight to `Detaching`. The set keeps
//! the last offset delivered on every attachment, which is what lets a new
//! connection resume with `ATTACH-FROM-OFFSET` and lets the session drop
//! DATA frames it has already seen.

use crate::error::ClientError;
use crate::Result;
use bytes::Bytes;
use driftmq::{Command, Message, Offset};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Callback invoked for every DATA frame delivered on an attachment
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked whenever the broker confirms an attachment, with the
/// offset delivery resumes from
pub type AttachedHandler = Arc<dyn Fn(&str, Offset) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// ATTACH sent (or about to be), no ATTACHED yet
    Pending,
    Active,
    /// DETACH requested, waiting for DETACHED
    Detaching,
}

struct Attachment {
    state: AttachmentState,
    /// Explicit start offset while pending, then the last offset seen
    offset: Option<Offset>,
    on_message: MessageHandler,
    on_attached: Option<AttachedHandler>,
    // Connection generation the last ATTACH / DETACH went out on
    attach_sent: u64,
    detach_sent: u64,
}

impl Attachment {
    fn attach_command(&self, topic: &str) -> Command {
        Command::Attach {
            topic: topic.to_string(),
            offset: self.offset,
        }
    }
}

/// Attachments keyed by topic name
#[derive(Default)]
pub struct AttachmentSet {
    inner: Mutex<BTreeMap<String, Attachment>>,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending attachment. Fails if the topic already has
    /// one in any state.
    pub fn add(
        &self,
        topic: &str,
        from_offset: Option<Offset>,
        on_message: MessageHandler,
        on_attached: Option<AttachedHandler>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(topic) {
            return Err(ClientError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        inner.insert(
            topic.to_string(),
            Attachment {
                state: AttachmentState::Pending,
                offset: from_offset,
                on_message,
                on_attached,
                attach_sent: 0,
                detach_sent: 0,
            },
        );
        Ok(())
    }

    /// Mark an attachment as detaching
    pub fn detach(&self, topic: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.get_mut(topic) {
            Some(attachment) => {
                attachment.state = AttachmentState::Detaching;
                Ok(())
            }
            None => Err(ClientError::NotSubscribed {
                topic: topic.to_string(),
            }),
        }
    }

    /// Broker confirmed the attachment. Returns the callback to run, if any;
    /// callers invoke it outside the lock.
    pub fn on_attached(&self, topic: &str, offset: Offset) -> Option<AttachedHandler> {
        let mut inner = self.inner.lock();
        let attachment = inner.get_mut(topic)?;
        if attachment.state == AttachmentState::Detaching {
            return None;
        }
        attachment.state = AttachmentState::Active;
        attachment.offset = Some(offset);
        attachment.on_attached.clone()
    }

    /// Broker confirmed a detach. Stray DETACHED frames for live attachments
    /// are ignored.
    pub fn on_detached(&self, topic: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(topic) {
            Some(attachment) if attachment.state == AttachmentState::Detaching => {
                inner.remove(topic);
                true
            }
            _ => false,
        }
    }

    /// Accept a DATA frame if it is new for an active attachment, advancing
    /// the stored offset. Returns the handler and message to dispatch.
    pub fn on_data(
        &self,
        topic: &str,
        offset: Offset,
        payload: Bytes,
    ) -> Option<(MessageHandler, Message)> {
        let mut inner = self.inner.lock();
        let attachment = inner.get_mut(topic)?;
        if attachment.state != AttachmentState::Active {
            return None;
        }
        if matches!(attachment.offset, Some(last) if offset <= last) {
            return None;
        }
        attachment.offset = Some(offset);
        Some((
            Arc::clone(&attachment.on_message),
            Message::new(topic, payload, offset),
        ))
    }

    /// Frames that bring a fresh connection up to date with every
    /// attachment, in topic order: ATTACH for pending ones (with their
    /// original start offset), ATTACH-FROM-OFFSET for active ones and
    /// DETACH for detaching ones.
    pub fn connection_commands(&self, generation: u64) -> Vec<Command> {
        let mut inner = self.inner.lock();
        inner
            .iter_mut()
            .map(|(topic, attachment)| match attachment.state {
                AttachmentState::Pending | AttachmentState::Active => {
                    attachment.attach_sent = generation;
                    attachment.attach_command(topic)
                }
                AttachmentState::Detaching => {
                    attachment.detach_sent = generation;
                    Command::Detach {
                        topic: topic.clone(),
                    }
                }
            })
            .collect()
    }

    /// ATTACH for a pending attachment not yet announced on `generation`
    pub fn attach_command(&self, topic: &str, generation: u64) -> Option<Command> {
        let mut inner = self.inner.lock();
        let attachment = inner.get_mut(topic)?;
        if attachment.state != AttachmentState::Pending || attachment.attach_sent == generation {
            return None;
        }
        attachment.attach_sent = generation;
        Some(attachment.attach_command(topic))
    }

    /// DETACH for a detaching attachment not yet announced on `generation`
    pub fn detach_command(&self, topic: &str, generation: u64) -> Option<Command> {
        let mut inner = self.inner.lock();
        let attachment = inner.get_mut(topic)?;
        if attachment.state != AttachmentState::Detaching || attachment.detach_sent == generation {
            return None;
        }
        attachment.detach_sent = generation;
        Some(Command::Detach {
            topic: topic.to_string(),
        })
    }

    pub fn state(&self, topic: &str) -> Option<AttachmentState> {
        self.inner.lock().get(topic).map(|a| a.state)
    }

    /// Last offset delivered (or the requested start offset while pending)
    pub fn offset(&self, topic: &str) -> Option<Offset> {
        self.inner.lock().get(topic).and_then(|a| a.offset)
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
