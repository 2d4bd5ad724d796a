use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::{HookError, Result};
use crate::types::Rank;

type Key = (Rank, u64);
type Receiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

#[derive(Default)]
struct Inbox {
    channels: HashMap<Key, (mpsc::UnboundedSender<Vec<u8>>, Receiver)>,
    /// Keys whose receiver gave up before the message arrived.
    abandoned: HashSet<Key>,
}

impl Inbox {
    fn channel(&mut self, key: Key) -> &(mpsc::UnboundedSender<Vec<u8>>, Receiver) {
        self.channels.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, Arc::new(tokio::sync::Mutex::new(rx)))
        })
    }
}

/// Per-`(src, tag)` inbox of one rank.
///
/// Channels are created lazily by whichever side touches a key first, so a
/// message delivered before its receiver asks for it is buffered rather than
/// lost. Each collective uses a fresh tag, which keeps concurrent collectives
/// from stealing each other's messages.
///
/// A channel is removed once its message is received or its receiver is
/// cancelled (e.g. by a timeout). A message arriving after cancellation is
/// discarded.
#[derive(Default)]
pub(super) struct Mailbox {
    inbox: Mutex<Inbox>,
}

impl Mailbox {
    fn lock(&self) -> Result<MutexGuard<'_, Inbox>> {
        self.inbox
            .lock()
            .map_err(|_| HookError::LockPoisoned("mailbox"))
    }

    pub(super) fn deliver(&self, src: Rank, tag: u64, data: Vec<u8>) -> Result<()> {
        let mut inbox = self.lock()?;
        if inbox.abandoned.remove(&(src, tag)) {
            tracing::trace!(src, tag, bytes = data.len(), "mailbox: dropping late message");
            return Ok(());
        }
        let tx = inbox.channel((src, tag)).0.clone();
        tracing::trace!(src, tag, bytes = data.len(), "mailbox: deliver");
        tx.send(data)
            .map_err(|_| HookError::transport(format!("mailbox for rank {src} closed")))
    }

    /// Wait for the single message of `(src, tag)` and drop the channel.
    pub(super) async fn recv(&self, src: Rank, tag: u64) -> Result<Vec<u8>> {
        let rx = Arc::clone(&self.lock()?.channel((src, tag)).1);
        let mut pending = PendingRecv {
            mailbox: self,
            key: (src, tag),
            received: false,
        };
        let msg = rx.lock().await.recv().await;
        pending.received = true;
        drop(pending);
        msg.ok_or_else(|| HookError::transport(format!("channel from rank {src} closed")))
    }

    #[cfg(test)]
    pub(super) fn open_channels(&self) -> usize {
        self.inbox.lock().map(|m| m.channels.len()).unwrap_or(0)
    }
}

/// Removes the channel of an in-progress receive, however it ends.
struct PendingRecv<'a> {
    mailbox: &'a Mailbox,
    key: Key,
    received: bool,
}

impl Drop for PendingRecv<'_> {
    fn drop(&mut self) {
        let mut inbox = match self.mailbox.inbox.lock() {
            Ok(inbox) => inbox,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some((_, rx)) = inbox.channels.remove(&self.key) else {
            return;
        };
        if self.received {
            return;
        }
        // Cancelled: a message that already landed goes away with the
        // channel, one still on its way is dropped on delivery.
        let buffered = rx
            .try_lock()
            .map(|mut rx| rx.try_recv().is_ok())
            .unwrap_or(false);
        if !buffered {
            inbox.abandoned.insert(self.key);
        }
    }
}
