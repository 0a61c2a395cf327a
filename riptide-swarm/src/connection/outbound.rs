//! Per-connection outbound message queue drained by the writer task

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::torrent::{BlockIndex, PeerMessage};

/// FIFO of messages waiting to be written to one peer.
///
/// Unlike a channel, queued `Piece` responses can still be withdrawn when
/// the peer cancels the request before the writer reaches them.
#[derive(Default)]
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    ready: Notify,
}

#[derive(Default)]
struct QueueInner {
    messages: VecDeque<PeerMessage>,
    closed: bool,
}

impl OutboundQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Returns false once the queue is closed.
    pub fn push(&self, message: PeerMessage) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.messages.push_back(message);
        }
        self.ready.notify_one();
        true
    }

    /// Withdraws a queued `Piece` answering `block`. Returns true if one was removed.
    pub fn cancel_piece(&self, block: &BlockIndex) -> bool {
        let mut inner = self.inner.lock();
        let position = inner.messages.iter().position(|message| {
            matches!(
                message,
                PeerMessage::Piece { piece_index, offset, data }
                    if *piece_index == block.piece
                        && *offset == block.offset
                        && data.len() as u32 == block.length
            )
        });
        position
            .and_then(|position| inner.messages.remove(position))
            .is_some()
    }

    /// Waits for the next message. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<PeerMessage> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.messages.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting messages; already queued ones are still handed out.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_waiters();
    }

    /// Messages waiting to be written.
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
