//! The transaction processing queue.
//!
//! Holds admitted transactions ordered by HLC timestamp and executes the
//! earliest one once its processing delay has elapsed. The delay gives
//! peers' transactions with slightly earlier timestamps time to arrive, so
//! out-of-order execution (and the reprocessing it forces) stays rare.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;

use crate::execution::{Executor, run_tx};
use crate::hlc::Hlc;
use crate::state::StateDriver;
use crate::types::{ProcessingResult, TxMessage, Vk};

/// Lower bound between a transaction's HLC wall time and its execution.
///
/// `self_delay` is added on top of `base` for transactions this node
/// admitted itself, biasing execution toward peer work first.
#[derive(Clone, Copy, Debug)]
pub struct ProcessingDelay {
    pub base_secs: f64,
    pub self_secs: f64,
}

impl Default for ProcessingDelay {
    fn default() -> Self {
        Self {
            base_secs: 1.0,
            self_secs: 0.5,
        }
    }
}

/// What `append` decided about an incoming transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum AppendOutcome {
    /// Enqueued normally.
    Queued,
    /// HLC is at or before the last consensus HLC; the decision is final
    /// and the transaction is dropped.
    AlreadyCommitted,
    /// HLC is earlier than transactions this node already executed; the
    /// caller must run the reprocessor with this transaction.
    NeedsReprocessing(Box<TxMessage>),
}

/// HLC-ordered queue of admitted transactions.
pub struct ProcessingQueue {
    queue: BTreeMap<Hlc, TxMessage>,
    delay: ProcessingDelay,
    my_vk: Vk,
    last_processed_hlc: Option<Hlc>,
}

impl ProcessingQueue {
    pub fn new(delay: ProcessingDelay, my_vk: Vk) -> Self {
        Self {
            queue: BTreeMap::new(),
            delay,
            my_vk,
            last_processed_hlc: None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The newest HLC this queue has executed.
    pub fn last_processed_hlc(&self) -> Option<&Hlc> {
        self.last_processed_hlc.as_ref()
    }

    /// Inserts a transaction, or reports why it cannot be inserted.
    ///
    /// `last_hlc_in_consensus` is the newest hard-applied HLC; anything at
    /// or before it is already decided. Anything after it but before the
    /// last *processed* HLC arrived out of order and needs reprocessing
    /// instead of queueing.
    pub fn append(
        &mut self,
        tx_message: TxMessage,
        last_hlc_in_consensus: Option<&Hlc>,
    ) -> AppendOutcome {
        let hlc = &tx_message.hlc_timestamp;

        if let Some(last) = last_hlc_in_consensus {
            if hlc <= last {
                debug!(%hlc, %last, "dropping tx at or before consensus");
                return AppendOutcome::AlreadyCommitted;
            }
        }

        if let Some(last_processed) = &self.last_processed_hlc {
            if hlc < last_processed {
                return AppendOutcome::NeedsReprocessing(Box::new(tx_message));
            }
        }

        self.queue.insert(hlc.clone(), tx_message);
        AppendOutcome::Queued
    }

    /// True when the earliest queued transaction's delay has elapsed.
    fn next_ready(&self, now_nanos: u64) -> bool {
        let Some((hlc, tx_message)) = self.queue.iter().next() else {
            return false;
        };

        let delay_secs = if tx_message.sender == self.my_vk {
            self.delay.base_secs + self.delay.self_secs
        } else {
            self.delay.base_secs
        };

        hlc.nanos() + (delay_secs * 1e9) as u64 <= now_nanos
    }

    /// Executes the earliest ready transaction, soft-applies its delta, and
    /// returns the processing result. `None` when nothing is ready yet.
    pub fn process_next(
        &mut self,
        driver: &mut StateDriver,
        executor: &dyn Executor,
    ) -> Option<ProcessingResult> {
        let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX) as u64;
        if !self.next_ready(now_nanos) {
            return None;
        }

        let (hlc, tx_message) = self.queue.pop_first()?;

        let result = run_tx(&tx_message, driver, executor);
        driver.soft_apply(&hlc);

        match &self.last_processed_hlc {
            Some(last) if last >= &hlc => {}
            _ => self.last_processed_hlc = Some(hlc.clone()),
        }

        debug!(%hlc, status = result.tx_result.status, "processed tx");
        Some(result)
    }

    /// Executes a transaction without queueing or soft-applying. The
    /// reprocessor drives this while replaying; it manages the driver's
    /// delta lifecycle itself.
    pub fn process_tx(
        &self,
        tx_message: &TxMessage,
        driver: &mut StateDriver,
        executor: &dyn Executor,
    ) -> ProcessingResult {
        run_tx(tx_message, driver, executor)
    }
}
