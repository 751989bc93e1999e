//! 🤝 The hand-off: a zero-capacity rendezvous between many consumers and one indexer.
//!
//! 🎬 *[a relay race. the baton must be taken, not dropped on the track.]*
//!
//! `async_channel` won't build a channel with capacity zero, so the rendezvous is made of
//! a one-slot channel plus a oneshot receipt per item. A sender only returns once the
//! receiving side has actually taken its item, which is exactly the backpressure contract:
//! callbacks can't get ahead of the indexer.
//!
//! 🧠 Knowledge graph:
//! - `HandOffSender` is cloned into every concurrent message callback.
//! - `HandOffReceiver` belongs to the single indexer worker.
//! - Dropping the receiver closes the channel and discards whatever was waiting, which
//!   makes every pending `send` fail. Those messages are nacked upstream, never acked. 🦆

use async_channel::{Receiver, Sender};
use thiserror::Error;
use tokio::sync::oneshot;

/// 💀 The receiving side is gone (or never took the item). Nobody is home.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("🤝 hand-off closed: the indexer is no longer accepting records")]
pub struct HandOffClosed;

/// 📦 One item in flight, plus the receipt that tells its sender it was taken.
type Parcel<T> = (T, oneshot::Sender<()>);

/// 🚀 Build a connected rendezvous pair.
pub(crate) fn rendezvous<T>() -> (HandOffSender<T>, HandOffReceiver<T>) {
    // 🔧 one slot, because zero is not allowed. The receipt makes it behave like zero.
    let (tx, rx) = async_channel::bounded(1);
    (HandOffSender { tx }, HandOffReceiver { rx })
}

#[derive(Debug)]
pub(crate) struct HandOffSender<T> {
    tx: Sender<Parcel<T>>,
}

impl<T> Clone for HandOffSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> HandOffSender<T> {
    /// 📡 Hand `item` over and wait until the receiver has taken it.
    ///
    /// Returns [`HandOffClosed`] if the receiver is gone before or after the item was queued
    /// but before it was taken. In that case the item was not processed.
    pub(crate) async fn send(&self, item: T) -> Result<(), HandOffClosed> {
        let (receipt_tx, receipt_rx) = oneshot::channel();
        self.tx
            .send((item, receipt_tx))
            .await
            .map_err(|_| HandOffClosed)?;
        receipt_rx.await.map_err(|_| HandOffClosed)
    }
}

#[derive(Debug)]
pub(crate) struct HandOffReceiver<T> {
    rx: Receiver<Parcel<T>>,
}

impl<T> HandOffReceiver<T> {
    /// 📥 Take the next item. `None` once every sender is gone.
    ///
    /// Cancel-safe: the only await is the channel receive, and the receipt is sent
    /// synchronously right after, so dropping this future never loses an item.
    pub(crate) async fn recv(&self) -> Option<T> {
        let (item, receipt) = self.rx.recv().await.ok()?;
        // -- the sender may have given up waiting; the item is ours either way
        let _ = receipt.send(());
        Some(item)
    }
}

impl<T> Drop for HandOffReceiver<T> {
    fn drop(&mut self) {
        // 🗑️ close first so new sends bounce, then drop what's queued so its senders wake up
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
