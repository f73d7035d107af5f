//! Asynchronous callback delivery.
//!
//! Data-ready and data-consumed callbacks run on a dedicated notification
//! thread, never on the thread servicing the transport. Cross-process
//! consumers are modeled as a subscriber channel rather than any form of
//! signal delivery.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// What a notice reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    DataReady,
    DataConsumed,
}

/// One channel notification delivered to a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelNotice {
    pub link_id: u32,
    pub chan: u16,
    pub kind: NoticeKind,
}

/// Where a registered callback delivers.
#[derive(Clone)]
pub enum CallbackTarget {
    /// In-process function, invoked on the notification thread.
    Func(Arc<dyn Fn(u16) + Send + Sync>),
    /// Out-of-process consumer, reached over a subscription channel.
    Subscriber(mpsc::Sender<ChannelNotice>),
}

impl fmt::Debug for CallbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackTarget::Func(_) => f.write_str("CallbackTarget::Func"),
            CallbackTarget::Subscriber(_) => f.write_str("CallbackTarget::Subscriber"),
        }
    }
}

/// Owns the notification thread.
///
/// If the thread cannot be spawned, notices are delivered inline on the
/// caller's thread instead of being dropped.
pub struct Notifier {
    sender: Option<mpsc::Sender<(CallbackTarget, ChannelNotice)>>,
    handle: Option<thread::JoinHandle<()>>,
}

fn run(target: CallbackTarget, notice: ChannelNotice) {
    match target {
        CallbackTarget::Func(func) => func(notice.chan),
        CallbackTarget::Subscriber(tx) => {
            if tx.send(notice).is_err() {
                tracing::debug!(chan = notice.chan, "notification subscriber went away");
            }
        }
    }
}

impl Notifier {
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<(CallbackTarget, ChannelNotice)>();
        let spawned = thread::Builder::new()
            .name("linkmux-notify".to_string())
            .spawn(move || {
                for (target, notice) in receiver {
                    run(target, notice);
                }
            });
        match spawned {
            Ok(handle) => Self {
                sender: Some(sender),
                handle: Some(handle),
            },
            Err(err) => {
                tracing::warn!(error = %err, "notification thread unavailable, delivering inline");
                Self {
                    sender: None,
                    handle: None,
                }
            }
        }
    }

    /// Queue one notification for delivery.
    pub fn deliver(&self, target: CallbackTarget, notice: ChannelNotice) {
        match &self.sender {
            Some(sender) => {
                if sender.send((target, notice)).is_err() {
                    tracing::warn!(chan = notice.chan, "notification thread gone");
                }
            }
            None => run(target, notice),
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // Closing the queue lets the thread drain and exit.
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
