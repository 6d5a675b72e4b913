//! Latest-wins, single-slot delivery channel between the reconciler and a
//! device worker.
//!
//! A put never blocks and overwrites any record the worker has not picked
//! up yet. Dropping the [`MailboxSender`] retires the mailbox; undelivered
//! records are discarded at that point.

use std::sync::Arc;
use std::time::Duration;

use swcfg_common::DeviceRecord;
use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
struct Slot {
    seq: u64,
    record: Option<Arc<DeviceRecord>>,
}

/// What a wait on a [`Mailbox`] produced.
#[derive(Debug)]
pub enum Received {
    /// The freshest record, plus how many older ones it superseded.
    Record {
        /// The record to deploy.
        record: Arc<DeviceRecord>,
        /// Records put since the previous delivery that were never seen.
        skipped: u64,
    },
    /// Nothing arrived within the wait.
    Empty,
    /// The sender was dropped.
    Closed,
}

/// Creates a connected sender/receiver pair.
pub fn mailbox() -> (MailboxSender, Mailbox) {
    let (tx, rx) = watch::channel(Slot::default());
    (MailboxSender { tx }, Mailbox { rx, last_seq: 0 })
}

/// Reconciler side of a mailbox.
#[derive(Debug)]
pub struct MailboxSender {
    tx: watch::Sender<Slot>,
}

impl MailboxSender {
    /// Stores `record`, replacing any undelivered one.
    ///
    /// Returns false if the worker side is gone.
    pub fn put(&self, record: Arc<DeviceRecord>) -> bool {
        self.tx.send_modify(|slot| {
            slot.seq += 1;
            slot.record = Some(record);
        });
        !self.tx.is_closed()
    }
}

/// Worker side of a mailbox.
#[derive(Debug)]
pub struct Mailbox {
    rx: watch::Receiver<Slot>,
    last_seq: u64,
}

impl Mailbox {
    /// Waits up to `wait` for a record newer than the last one delivered.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Received {
        match tokio::time::timeout(wait, self.rx.changed()).await {
            Err(_) => Received::Empty,
            Ok(Err(_)) => Received::Closed,
            Ok(Ok(())) => {
                let slot = self.rx.borrow_and_update().clone();
                let skipped = slot.seq.saturating_sub(self.last_seq + 1);
                self.last_seq = slot.seq;
                match slot.record {
                    Some(record) => Received::Record { record, skipped },
                    None => Received::Empty,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(serial: &str) -> Arc<DeviceRecord> {
        Arc::new(DeviceRecord {
            id: "d1".to_string(),
            serial: serial.to_string(),
            nodename: "sw-1".to_string(),
            usecase: "access".to_string(),
            addresses: BTreeMap::new(),
            rendered: Some(String::new()),
            deploy: true,
            gateway: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_wait_times_out() {
        let (_tx, mut rx) = mailbox();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).await,
            Received::Empty
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_wins() {
        let (tx, mut rx) = mailbox();
        assert!(tx.put(record("A")));
        assert!(tx.put(record("B")));
        assert!(tx.put(record("C")));

        match rx.recv_timeout(Duration::from_secs(1)).await {
            Received::Record { record, skipped } => {
                assert_eq!(record.serial, "C");
                assert_eq!(skipped, 2);
            }
            other => panic!("Expected record, got {:?}", other),
        }

        // Already delivered, nothing new
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).await,
            Received::Empty
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_while_waiting() {
        let (tx, mut rx) = mailbox();
        let waiter = tokio::spawn(async move { rx.recv_timeout(Duration::from_secs(10)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.put(record("A"));

        match waiter.await.unwrap() {
            Received::Record { record, skipped } => {
                assert_eq!(record.serial, "A");
                assert_eq!(skipped, 0);
            }
            other => panic!("Expected record, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_closes() {
        let (tx, mut rx) = mailbox();
        drop(tx);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).await,
            Received::Closed
        ));
    }

    #[test]
    fn test_put_after_receiver_gone() {
        let (tx, rx) = mailbox();
        drop(rx);
        assert!(!tx.put(record("A")));
    }
}
