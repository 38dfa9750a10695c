//! Polling orchestrator — one failure-tolerant cycle per tick.
//!
//! The loop runs a first cycle immediately, then one per interval.
//! Cycles never overlap: a tick that lands while a cycle is still
//! running is skipped, not queued. Shutdown is only observed between
//! cycles, so an in-flight cycle always runs to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::mail::{Mailbox, MessageHandle, extract};
use crate::notify::Notifier;
use crate::store::{Ledger, NewLedgerEntry};

/// Counters for one completed cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages successfully retrieved from the mailbox.
    pub retrieved: usize,
    /// Messages forwarded to the sink and ledgered as sent.
    pub forwarded: usize,
    /// Messages already ledgered by a previous cycle.
    pub duplicates: usize,
    /// Messages that failed extraction, persistence, or delivery.
    pub failures: usize,
}

/// Per-message outcome, folded into the cycle report.
enum MessageOutcome {
    Forwarded,
    Duplicate,
    Failed,
}

/// Handle to a running poller.
pub struct PollerHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollerHandle {
    /// Request shutdown and wait for the poller to finish. An in-flight
    /// cycle always completes first; only the wait between cycles is
    /// interrupted.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
        if let Err(e) = self.handle.await {
            error!("Mail poller task failed: {e}");
        }
    }
}

/// Spawn the polling loop over the injected collaborators.
pub fn spawn_mail_poller(
    mut mailbox: Box<dyn Mailbox>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
) -> PollerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let shutdown_flag = Arc::clone(&shutdown);
    let wake_signal = Arc::clone(&wake);

    let handle = tokio::spawn(async move {
        info!(
            "Mail poller started — checking every {}s",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake_signal.notified() => {}
            }
            if shutdown_flag.load(Ordering::Relaxed) {
                info!("Mail poller shutting down");
                return;
            }

            let report = run_cycle(mailbox.as_mut(), ledger.as_ref(), notifier.as_ref()).await;
            info!(
                retrieved = report.retrieved,
                forwarded = report.forwarded,
                duplicates = report.duplicates,
                failures = report.failures,
                "Mail check completed"
            );
        }
    });

    PollerHandle {
        handle,
        shutdown,
        wake,
    }
}

/// Run one full cycle: connect, list, process sequentially, disconnect.
///
/// Never fails — every error is logged and contained to the message or
/// cycle it occurred in. Disconnect runs on every exit path.
pub async fn run_cycle(
    mailbox: &mut dyn Mailbox,
    ledger: &dyn Ledger,
    notifier: &dyn Notifier,
) -> CycleReport {
    let mut report = CycleReport::default();

    if let Err(e) = mailbox.connect().await {
        error!("Failed to connect to mail server: {e}");
        mailbox.disconnect().await;
        return report;
    }

    match mailbox.list_messages().await {
        Ok(handles) => {
            for handle in handles {
                process_message(mailbox, ledger, notifier, handle, &mut report).await;
            }
        }
        Err(e) => error!("Failed to list mailbox messages: {e}"),
    }

    mailbox.disconnect().await;
    report
}

/// Retrieve and process a single message.
///
/// The deletion mark is issued exactly once for every retrieved
/// message, regardless of the extraction, persistence, or delivery
/// outcome.
async fn process_message(
    mailbox: &mut dyn Mailbox,
    ledger: &dyn Ledger,
    notifier: &dyn Notifier,
    handle: MessageHandle,
    report: &mut CycleReport,
) {
    let raw = match mailbox.retrieve(handle).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(seq = handle.seq, "Failed to retrieve message: {e}");
            report.failures += 1;
            return;
        }
    };
    report.retrieved += 1;

    match ledger_and_deliver(ledger, notifier, &raw, handle.seq).await {
        MessageOutcome::Forwarded => report.forwarded += 1,
        MessageOutcome::Duplicate => report.duplicates += 1,
        MessageOutcome::Failed => report.failures += 1,
    }

    if let Err(e) = mailbox.mark_for_deletion(handle).await {
        warn!(seq = handle.seq, "Failed to mark message for deletion: {e}");
    }
}

/// Extract, dedup-check, persist, deliver, record.
async fn ledger_and_deliver(
    ledger: &dyn Ledger,
    notifier: &dyn Notifier,
    raw: &[u8],
    seq: u32,
) -> MessageOutcome {
    let content = match extract::extract(raw, seq) {
        Ok(content) => content,
        Err(e) => {
            error!(seq, "Dropping message: {e}");
            return MessageOutcome::Failed;
        }
    };

    if ledger.is_processed(&content.dedup_key).await {
        info!(subject = %content.subject, "Message already processed, clearing from mailbox");
        return MessageOutcome::Duplicate;
    }

    let entry = NewLedgerEntry::from_content(&content);
    let id = match ledger.save(&entry).await {
        Ok(id) => id,
        Err(DatabaseError::Duplicate(key)) => {
            // Raced with an earlier insert; the unique constraint wins
            info!(dedup_key = %key, "Message already ledgered");
            return MessageOutcome::Duplicate;
        }
        Err(e) => {
            error!(subject = %content.subject, "Failed to ledger message: {e}");
            return MessageOutcome::Failed;
        }
    };

    let outcome = notifier.deliver(&content).await;
    if let Err(e) = ledger
        .record_outcome(id, outcome.success, outcome.error.as_deref())
        .await
    {
        error!(id, "Failed to record delivery outcome: {e}");
    }

    info!(
        subject = %content.subject,
        images = content.images.len(),
        delivered = outcome.success,
        "Processed message"
    );

    if outcome.success {
        MessageOutcome::Forwarded
    } else {
        MessageOutcome::Failed
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::error::MailboxError;
    use crate::mail::EmailContent;
    use crate::notify::DeliveryOutcome;
    use crate::store::LedgerEntry;

    struct NullMailbox {
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Mailbox for NullMailbox {
        async fn connect(&mut self) -> Result<(), MailboxError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_messages(&mut self) -> Result<Vec<MessageHandle>, MailboxError> {
            Ok(Vec::new())
        }

        async fn retrieve(&mut self, _handle: MessageHandle) -> Result<Vec<u8>, MailboxError> {
            Err(MailboxError::NotConnected)
        }

        async fn mark_for_deletion(
            &mut self,
            _handle: MessageHandle,
        ) -> Result<(), MailboxError> {
            Ok(())
        }

        async fn disconnect(&mut self) {}
    }

    struct NullLedger;

    #[async_trait]
    impl Ledger for NullLedger {
        async fn is_processed(&self, _dedup_key: &str) -> bool {
            false
        }

        async fn save(&self, _entry: &NewLedgerEntry) -> Result<i64, DatabaseError> {
            Ok(1)
        }

        async fn record_outcome(
            &self,
            _id: i64,
            _success: bool,
            _error: Option<&str>,
        ) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn get_by_dedup_key(
            &self,
            _dedup_key: &str,
        ) -> Result<Option<LedgerEntry>, DatabaseError> {
            Ok(None)
        }
    }

    struct NullNotifier;

    #[async_trait]
    impl Notifier for NullNotifier {
        async fn deliver(&self, _content: &EmailContent) -> DeliveryOutcome {
            DeliveryOutcome::ok()
        }

        async fn test_connection(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn first_cycle_runs_immediately() {
        let connects = Arc::new(AtomicUsize::new(0));
        let mailbox = Box::new(NullMailbox {
            connects: Arc::clone(&connects),
        });

        let poller = spawn_mail_poller(
            mailbox,
            Arc::new(NullLedger),
            Arc::new(NullNotifier),
            Duration::from_secs(3600),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        poller.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_the_interval_wait() {
        let connects = Arc::new(AtomicUsize::new(0));
        let mailbox = Box::new(NullMailbox {
            connects: Arc::clone(&connects),
        });

        let poller = spawn_mail_poller(
            mailbox,
            Arc::new(NullLedger),
            Arc::new(NullNotifier),
            Duration::from_secs(3600),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Must return promptly despite the hour-long interval
        tokio::time::timeout(Duration::from_secs(5), poller.stop())
            .await
            .expect("stop should not wait for the next tick");
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }
}
