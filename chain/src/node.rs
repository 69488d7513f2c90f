//! The node orchestrator.
//!
//! Owns every component and drives three pumps from one cooperative loop:
//!
//! - the transaction-file pump (admission directory → broadcast → C5),
//! - the processing pump (execute earliest HLC, publish the result),
//! - the validation pump (collect proofs, commit the earliest consensus
//!   HLC via the minter).
//!
//! Startup: optional rollback → safe block height → optional chain
//! validation → genesis → peer catch-up → pumps. Unrecoverable errors
//! bubble up here, get logged, and stop the node.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::catchup::{CatchupError, CatchupHandler};
use crate::codec::{self, CodecError};
use crate::config::NodeConfig;
use crate::consensus::minter;
use crate::crypto::{self, Wallet};
use crate::events::{
    BLOCK_REORG_EVENT, Event, EventWriter, NETWORK_ERROR_EVENT, NEW_BLOCK_EVENT, UPGRADE_EVENT,
};
use crate::execution::Executor;
use crate::filequeue::FileQueue;
use crate::hlc::{Hlc, HlcClock};
use crate::metrics::MetricsRegistry;
use crate::missing::{MissingBlocksError, MissingBlocksHandler, MissingBlocksWriter};
use crate::network::{PeerSet, Publisher};
use crate::queues::{AppendOutcome, ProcessingQueue, ValidationQueue};
use crate::reprocess;
use crate::rollback::{RollbackBlocksHandler, RollbackError};
use crate::state::{KvStore, MEMBERS_KEY, SAFE_BLOCK_HEIGHT_KEY, StateDriver, StateError};
use crate::storage::{BlockStorage, BlockStorageError, NonceStorage};
use crate::types::{Block, ProcessingResult, Proof, Transaction, TxMessage, Vk, zero_hash};
use crate::validation::{
    BlockVerifyError, ChainValidationError, ValidateChainHandler, verify_block,
};
use crate::work::WorkValidator;

/// Pump loop cadence.
const LOOP_INTERVAL: Duration = Duration::from_millis(100);

/// Fatal node errors; all of them end in a clean shutdown.
#[derive(Debug)]
pub enum NodeError {
    /// Node has no genesis block and none was provided.
    MissingGenesis,
    /// The provided genesis block failed verification.
    InvalidGenesis(BlockVerifyError),
    State(StateError),
    Storage(BlockStorageError),
    ChainValidation(ChainValidationError),
    Rollback(RollbackError),
    Catchup(CatchupError),
    MissingBlocks(MissingBlocksError),
    Codec(CodecError),
    Io(io::Error),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::MissingGenesis => {
                write!(f, "cannot start without a genesis block")
            }
            NodeError::InvalidGenesis(e) => write!(f, "invalid genesis block: {e}"),
            NodeError::State(e) => write!(f, "{e}"),
            NodeError::Storage(e) => write!(f, "{e}"),
            NodeError::ChainValidation(e) => write!(f, "{e}"),
            NodeError::Rollback(e) => write!(f, "{e}"),
            NodeError::Catchup(e) => write!(f, "{e}"),
            NodeError::MissingBlocks(e) => write!(f, "{e}"),
            NodeError::Codec(e) => write!(f, "{e}"),
            NodeError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<StateError> for NodeError {
    fn from(e: StateError) -> Self {
        NodeError::State(e)
    }
}

impl From<BlockStorageError> for NodeError {
    fn from(e: BlockStorageError) -> Self {
        NodeError::Storage(e)
    }
}

impl From<ChainValidationError> for NodeError {
    fn from(e: ChainValidationError) -> Self {
        NodeError::ChainValidation(e)
    }
}

impl From<RollbackError> for NodeError {
    fn from(e: RollbackError) -> Self {
        NodeError::Rollback(e)
    }
}

impl From<CatchupError> for NodeError {
    fn from(e: CatchupError) -> Self {
        NodeError::Catchup(e)
    }
}

impl From<MissingBlocksError> for NodeError {
    fn from(e: MissingBlocksError) -> Self {
        NodeError::MissingBlocks(e)
    }
}

impl From<CodecError> for NodeError {
    fn from(e: CodecError) -> Self {
        NodeError::Codec(e)
    }
}

impl From<io::Error> for NodeError {
    fn from(e: io::Error) -> Self {
        NodeError::Io(e)
    }
}

/// A full node: every component plus the pump loop.
pub struct Node {
    config: NodeConfig,
    wallet: Wallet,
    hlc_clock: HlcClock,
    driver: StateDriver,
    blocks: BlockStorage,
    nonces: NonceStorage,
    events: EventWriter,
    tx_queue: FileQueue,
    processing_queue: ProcessingQueue,
    validation_queue: ValidationQueue,
    executor: Box<dyn Executor>,
    publisher: Arc<dyn Publisher>,
    peers: PeerSet,
    work_validator: WorkValidator,
    missing_blocks: MissingBlocksHandler,
    missing_writer: MissingBlocksWriter,
    catchup: CatchupHandler,
    metrics: Arc<MetricsRegistry>,
    running: Arc<AtomicBool>,
}

impl Node {
    /// Builds a node over the given durable state backend and network
    /// seams. Storage directories are created under the configured root.
    pub fn new(
        config: NodeConfig,
        wallet: Wallet,
        durable: Box<dyn KvStore>,
        executor: Box<dyn Executor>,
        publisher: Arc<dyn Publisher>,
        peers: PeerSet,
    ) -> Result<Self, NodeError> {
        let root = config.storage.root.clone();

        let blocks = BlockStorage::open(&root)?;
        let nonces = NonceStorage::open(&root)?;
        let events = EventWriter::open(&root)?;
        let tx_queue = FileQueue::open(&root)?;
        let missing_blocks = MissingBlocksHandler::open(&root, config.safe_block_num)?;
        let missing_writer = MissingBlocksWriter::open(&root)?;

        let driver = StateDriver::new(durable);
        let processing_queue =
            ProcessingQueue::new(config.consensus.processing_delay, wallet.verifying_key());

        let metrics = Arc::new(
            MetricsRegistry::new()
                .map_err(|e| NodeError::Io(io::Error::other(e.to_string())))?,
        );

        Ok(Self {
            catchup: CatchupHandler::new(config.safe_block_num),
            config,
            wallet,
            hlc_clock: HlcClock::new(),
            driver,
            blocks,
            nonces,
            events,
            tx_queue,
            processing_queue,
            validation_queue: ValidationQueue::new(),
            executor,
            publisher,
            peers,
            work_validator: WorkValidator,
            missing_blocks,
            missing_writer,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn vk(&self) -> Vk {
        self.wallet.verifying_key()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flag checked by the pump loop; sharable with signal handlers.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn blocks(&self) -> &BlockStorage {
        &self.blocks
    }

    pub fn driver(&self) -> &StateDriver {
        &self.driver
    }

    pub fn tx_queue(&self) -> &FileQueue {
        &self.tx_queue
    }

    /// Runs the start sequence: rollback, safe height, chain validation,
    /// genesis, catch-up.
    pub async fn start(&mut self, genesis_block: Option<Block>) -> Result<(), NodeError> {
        info!(vk = %self.vk(), "starting node");
        self.running.store(true, Ordering::SeqCst);

        if let Some(rollback_point) = self.config.rollback_point.clone() {
            RollbackBlocksHandler.run(
                &rollback_point,
                &self.blocks,
                &mut self.driver,
                &self.nonces,
            )?;
        }

        self.set_safe_block_height()?;

        if self.config.run_validation {
            ValidateChainHandler::new(self.config.safe_block_num).run(&self.blocks)?;
        }

        if !self.blocks.has_genesis() {
            let Some(genesis) = genesis_block else {
                self.stop();
                return Err(NodeError::MissingGenesis);
            };
            self.store_genesis_block(genesis)?;
        }

        if let Some(latest) = self.blocks.get_latest_block() {
            if !latest.is_genesis() {
                self.hlc_clock.merge(&latest.hlc_timestamp);
                self.validation_queue.advance_last_hlc(&latest.hlc_timestamp);
            }
        }

        if self.config.run_catchup {
            self.catchup
                .run(
                    &self.peers,
                    &self.blocks,
                    &mut self.driver,
                    &self.nonces,
                    &mut self.events,
                )
                .await?;

            if let Some(latest) = self.blocks.get_latest_block() {
                if !latest.is_genesis() {
                    self.hlc_clock.merge(&latest.hlc_timestamp);
                    self.validation_queue.advance_last_hlc(&latest.hlc_timestamp);
                }
            }
        }

        info!("node started");
        Ok(())
    }

    pub fn stop(&mut self) {
        info!("stopping node");
        self.running.store(false, Ordering::SeqCst);
    }

    /// The cooperative pump loop; returns when the node is stopped.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        while self.is_running() {
            self.pump_tx_queue().await?;
            self.pump_processing().await?;
            self.pump_validation().await?;
            self.sweep_missing_blocks().await?;

            self.validation_queue.purge_stalled(Duration::from_secs(
                self.config.consensus.stalled_round_timeout_secs,
            ));

            let node = &self.metrics.node;
            node.processing_queue_depth
                .set(self.processing_queue.len() as i64);
            node.validation_queue_depth
                .set(self.validation_queue.len() as i64);

            tokio::time::sleep(LOOP_INTERVAL).await;
        }
        Ok(())
    }

    fn set_safe_block_height(&mut self) -> Result<(), NodeError> {
        if let Some(height) = self.config.safe_block_num {
            info!(height, "setting safe block height");
            self.driver
                .safe_set(SAFE_BLOCK_HEIGHT_KEY, &Value::from(height))?;
        } else if let Some(stored) = self.driver.lookup(SAFE_BLOCK_HEIGHT_KEY) {
            self.config.safe_block_num = stored.as_u64();
        }

        self.missing_blocks.safe_block_num = self.config.safe_block_num;
        self.catchup.safe_block_num = self.config.safe_block_num;
        Ok(())
    }

    fn store_genesis_block(&mut self, genesis: Block) -> Result<(), NodeError> {
        info!("processing genesis block");
        verify_block(&genesis, None).map_err(NodeError::InvalidGenesis)?;

        self.driver.clear_pending_state();
        self.apply_state_changes_from_block(&genesis)?;
        self.blocks.store_block(&genesis)?;

        let _ = self.events.write_event(&Event::new(
            NEW_BLOCK_EVENT,
            serde_json::to_value(&genesis).unwrap_or(Value::Null),
        ));
        Ok(())
    }

    /// Wraps an admitted transaction into the message broadcast to peers,
    /// stamping it with a fresh HLC and this node's signature.
    pub fn make_tx_message(&mut self, tx: Transaction) -> Result<TxMessage, NodeError> {
        let hlc_timestamp = self.hlc_clock.now();
        let tx_hash = codec::tx_hash_from_tx(&tx)?;
        let signature = self.wallet.sign(&format!("{tx_hash}{hlc_timestamp}"));

        Ok(TxMessage {
            tx,
            hlc_timestamp,
            signature,
            sender: self.vk(),
        })
    }

    /// Transaction-file pump: admit one queued transaction, broadcast it,
    /// and feed it to the processing queue.
    pub async fn pump_tx_queue(&mut self) -> Result<(), NodeError> {
        let Some(tx) = self.tx_queue.pop() else {
            return Ok(());
        };

        let tx_message = self.make_tx_message(tx)?;
        self.publisher.publish_tx(&tx_message).await;
        self.handle_work(tx_message).await
    }

    /// Entry point for work arriving from peers (and from our own
    /// admission pump): validate, then queue or reprocess.
    pub async fn handle_work(&mut self, tx_message: TxMessage) -> Result<(), NodeError> {
        if !self.work_validator.admit_or_drop(
            &tx_message,
            &self.driver,
            &self.nonces,
            &mut self.hlc_clock,
        ) {
            return Ok(());
        }

        match self
            .processing_queue
            .append(tx_message, self.validation_queue.last_hlc_in_consensus())
        {
            AppendOutcome::Queued | AppendOutcome::AlreadyCommitted => Ok(()),
            AppendOutcome::NeedsReprocessing(tx_message) => {
                self.run_reprocess(&tx_message).await
            }
        }
    }

    /// Runs the reprocessor for an out-of-order arrival and republishes
    /// everything whose writes changed.
    async fn run_reprocess(&mut self, tx_message: &TxMessage) -> Result<(), NodeError> {
        self.metrics.node.reprocess_runs.inc();
        let my_vk = self.vk();

        let outcome = reprocess::reprocess(
            tx_message,
            &mut self.driver,
            &self.processing_queue,
            self.executor.as_ref(),
            &self.validation_queue,
            &my_vk,
        );

        for result in outcome.to_publish {
            self.store_solution_and_send(result).await?;
        }
        Ok(())
    }

    /// Processing pump: execute the earliest ready transaction and publish
    /// its result.
    pub async fn pump_processing(&mut self) -> Result<(), NodeError> {
        let started = std::time::Instant::now();
        let Some(result) = self
            .processing_queue
            .process_next(&mut self.driver, self.executor.as_ref())
        else {
            return Ok(());
        };

        let node = &self.metrics.node;
        node.txs_processed.inc();
        node.processing_seconds.observe(started.elapsed().as_secs_f64());

        let hlc = result.hlc_timestamp.clone();
        let already_committed = self
            .validation_queue
            .last_hlc_in_consensus()
            .map(|last| &hlc <= last)
            .unwrap_or(false);

        if already_committed {
            // A block for this HLC exists; if our execution disagrees with
            // it, our speculative state is stale and needs reprocessing.
            if let Some(block) = self.blocks.get_block_by_hlc(&hlc) {
                let my_hash =
                    codec::tx_result_hash(&result.tx_result, &hlc, &result.rewards)?;
                let block_hash_matches = block
                    .processed
                    .map(|processed| {
                        codec::tx_result_hash(&processed, &hlc, &block.rewards)
                            .map(|h| h == my_hash)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                if !block_hash_matches {
                    self.run_reprocess(&result.tx_message.clone()).await?;
                }
            }
            return Ok(());
        }

        self.store_solution_and_send(result).await
    }

    /// Signs a proof over a processing result using the current member
    /// set.
    fn sign_tx_results(&self, results: &ProcessingResult) -> Result<Proof, CodecError> {
        let members = self.driver.member_vk_list();
        let message = codec::proof_message(
            &results.tx_result,
            &results.hlc_timestamp,
            &results.rewards,
            &members,
        )?;
        let result_hash = codec::tx_result_hash(
            &results.tx_result,
            &results.hlc_timestamp,
            &results.rewards,
        )?;

        Ok(Proof {
            signature: self.wallet.sign(&message.message),
            signer: self.vk(),
            members_list_hash: message.members_list_hash,
            num_of_members: message.num_of_members,
            tx_result_hash: Some(result_hash),
        })
    }

    /// Attaches our proof, broadcasts the result, and records it in the
    /// validation queue. Publication happens only after the result's delta
    /// was soft-applied.
    async fn store_solution_and_send(
        &mut self,
        mut results: ProcessingResult,
    ) -> Result<(), NodeError> {
        results.proof = Some(self.sign_tx_results(&results)?);

        self.publisher.publish_result(&results).await;
        self.validation_queue.append(results, &self.blocks);
        Ok(())
    }

    /// Entry point for peer processing results (the contender topic).
    ///
    /// The result hash is recomputed locally rather than trusted, the
    /// proof must be signed over it, and the proof's member-set hash must
    /// equal ours — proofs from a different member set are not comparable.
    pub fn handle_contender(&mut self, mut results: ProcessingResult) {
        let Some(mut proof) = results.proof.take() else {
            warn!("dropping contender without proof");
            return;
        };

        let members = self.driver.member_vk_list();
        let local_members_hash = match codec::hash_members_list(&members) {
            Ok(hash) => hash,
            Err(err) => {
                error!(%err, "failed to hash member list");
                return;
            }
        };
        if proof.members_list_hash != local_members_hash {
            warn!(signer = %proof.signer, "dropping contender with foreign member set");
            return;
        }

        let result_hash = match codec::tx_result_hash(
            &results.tx_result,
            &results.hlc_timestamp,
            &results.rewards,
        ) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(%err, "dropping unhashable contender");
                return;
            }
        };

        let message = format!("{result_hash}{}", proof.members_list_hash);
        if !crypto::verify(&proof.signer, &message, &proof.signature) {
            warn!(signer = %proof.signer, "dropping contender with bad proof signature");
            return;
        }

        proof.tx_result_hash = Some(result_hash);
        results.proof = Some(proof);
        self.validation_queue.append(results, &self.blocks);
    }

    /// Validation pump: decide consensus for the earliest HLC and commit
    /// it.
    pub async fn pump_validation(&mut self) -> Result<(), NodeError> {
        let Some(next_hlc) = self.validation_queue.earliest_hlc().cloned() else {
            return Ok(());
        };

        let already_committed = self
            .validation_queue
            .last_hlc_in_consensus()
            .map(|last| &next_hlc <= last)
            .unwrap_or(false);
        if already_committed && self.blocks.get_block_by_hlc(&next_hlc).is_some() {
            self.validation_queue.flush_hlc(&next_hlc);
            return Ok(());
        }

        let participants = self.driver.member_vk_list().len().max(1);
        self.validation_queue.check_one(
            &next_hlc,
            participants,
            self.config.consensus.consensus_percent,
        );

        if !self.validation_queue.hlc_has_consensus(&next_hlc) {
            return Ok(());
        }

        let Some(results) = self.validation_queue.get_consensus_result(&next_hlc) else {
            warn!(%next_hlc, "consensus reached but winning result is missing");
            return Ok(());
        };

        match self.hard_apply_block(&results).await? {
            Some(_) => {
                self.validation_queue.mark_committed(&next_hlc);
            }
            None => {
                // Commit was refused (unknown processor); drop the round.
                self.validation_queue.flush_hlc(&next_hlc);
            }
        }
        Ok(())
    }

    /// Commits a consensus-winning result: extend the chain, or insert
    /// into the middle and rewrite everything later.
    pub async fn hard_apply_block(
        &mut self,
        results: &ProcessingResult,
    ) -> Result<Option<Block>, NodeError> {
        let hlc = results.hlc_timestamp.clone();
        let processor = &results.tx_result.transaction.payload.processor;

        let members = self.driver.member_vk_list();
        if !members.is_empty() && !members.contains(processor) {
            warn!(%hlc, %processor, "processor is not a member, dropping result");
            return Ok(None);
        }

        let later_blocks = self.blocks.get_later_blocks(&hlc);
        let block = if later_blocks.is_empty() {
            self.hard_apply_processing_results(results)?
        } else {
            self.hard_apply_has_later_blocks(results, later_blocks)?
        };

        self.hard_apply_block_finish(&block);
        Ok(Some(block))
    }

    /// Normal extend: mint on top of the previous block and promote this
    /// HLC's delta.
    fn hard_apply_processing_results(
        &mut self,
        results: &ProcessingResult,
    ) -> Result<Block, NodeError> {
        let hlc = results.hlc_timestamp.clone();

        let prev_hash = self
            .blocks
            .get_previous_block(hlc.nanos())
            .map(|b| b.hash)
            .unwrap_or_else(zero_hash);

        let new_block = minter::block_from_processing_results(
            results,
            self.validation_queue.get_proofs(&hlc),
            &prev_hash,
            &self.wallet,
        );

        let consensus_matches_me = self.validation_queue.consensus_matches_me(&hlc, &self.vk());

        if consensus_matches_me && self.driver.has_pending(&hlc) {
            match self.driver.hard_apply_one(&hlc) {
                Ok(delta) => self.driver.bust_cache(delta.writes.keys()),
                Err(StateError::NotOldestPending(_)) => {
                    // An older stalled delta is in the way; fall back to
                    // applying the block's writes, which also clears the
                    // stale speculation.
                    self.apply_state_changes_from_block(&new_block)?;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            // The network agreed on someone else's result; our speculation
            // for this HLC (if any) is overwritten by the block's state.
            self.apply_state_changes_from_block(&new_block)?;
        }

        self.blocks.store_block(&new_block)?;
        self.save_nonce_from_block(&new_block)?;
        self.metrics.node.blocks_minted.inc();
        let _ = self.events.write_event(&Event::new(
            NEW_BLOCK_EVENT,
            serde_json::to_value(&new_block).unwrap_or(Value::Null),
        ));

        info!(number = new_block.number, hash = %new_block.hash, "minted block");
        Ok(new_block)
    }

    /// Insert-then-reorg: mint between existing blocks and rewrite the
    /// hashes of everything later.
    fn hard_apply_has_later_blocks(
        &mut self,
        results: &ProcessingResult,
        mut later_blocks: Vec<Block>,
    ) -> Result<Block, NodeError> {
        let hlc = results.hlc_timestamp.clone();
        let next_block_num = later_blocks[0].number;

        let prev_hash = self
            .blocks
            .get_previous_block(next_block_num)
            .map(|b| b.hash)
            .unwrap_or_else(zero_hash);

        let new_block = minter::block_from_processing_results(
            results,
            self.validation_queue.get_proofs(&hlc),
            &prev_hash,
            &self.wallet,
        );

        info!(
            number = new_block.number,
            rewriting = later_blocks.len(),
            "inserting block mid-chain"
        );

        // Rewrite every later block's linkage in order.
        let mut prev_in_list = new_block.hash.clone();
        for block in later_blocks.iter_mut() {
            let rewritten = minter::recalc_block_info(block.clone(), &prev_in_list);
            prev_in_list = rewritten.hash.clone();
            *block = rewritten;
        }

        self.apply_state_changes_from_block(&new_block)?;
        self.blocks.store_block(&new_block)?;
        self.save_nonce_from_block(&new_block)?;
        self.metrics.node.blocks_minted.inc();
        let _ = self.events.write_event(&Event::new(
            NEW_BLOCK_EVENT,
            serde_json::to_value(&new_block).unwrap_or(Value::Null),
        ));

        for block in &later_blocks {
            self.apply_state_changes_from_block(block)?;
            self.blocks.store_block(block)?;
            self.metrics.node.block_reorgs.inc();
            let _ = self.events.write_event(&Event::new(
                BLOCK_REORG_EVENT,
                serde_json::to_value(block).unwrap_or(Value::Null),
            ));
        }

        Ok(new_block)
    }

    /// Force/catch-up path: apply a fully formed block from a peer.
    ///
    /// Without `force`, the block must extend the current tip; a
    /// previous-hash mismatch schedules catch-up instead of applying.
    pub async fn hard_apply_block_from_network(
        &mut self,
        block: Block,
        force: bool,
    ) -> Result<Option<Block>, NodeError> {
        if !force && block.number > 0 {
            let latest = self.blocks.get_latest_block();

            if let Some(latest) = &latest {
                if latest.hlc_timestamp >= block.hlc_timestamp {
                    warn!(number = block.number, "ignoring block at or before our tip");
                    return Ok(None);
                }
                if latest.hash != block.previous {
                    error!(
                        number = block.number,
                        expected = %latest.hash,
                        found = %block.previous,
                        "block does not extend our tip, scheduling catchup"
                    );
                    self.missing_writer.write_missing_block(block.number)?;
                    self.catchup
                        .run(
                            &self.peers,
                            &self.blocks,
                            &mut self.driver,
                            &self.nonces,
                            &mut self.events,
                        )
                        .await?;
                    return Ok(None);
                }
            }
        }

        if let Err(err) = verify_block(&block, None) {
            warn!(number = block.number, %err, "dropping invalid network block");
            return Ok(None);
        }

        self.apply_state_changes_from_block(&block)?;
        self.blocks.store_block(&block)?;
        self.save_nonce_from_block(&block)?;

        if !block.is_genesis() {
            self.validation_queue.advance_last_hlc(&block.hlc_timestamp);
            self.hlc_clock.merge(&block.hlc_timestamp);
        }

        let _ = self.events.write_event(&Event::new(
            NEW_BLOCK_EVENT,
            serde_json::to_value(&block).unwrap_or(Value::Null),
        ));

        self.hard_apply_block_finish(&block);
        Ok(Some(block))
    }

    /// Applies a block's writes through the driver and promotes them to
    /// durable storage at the block's HLC.
    fn apply_state_changes_from_block(&mut self, block: &Block) -> Result<(), NodeError> {
        // Speculation older than a committed block can never commit; drop
        // it before staging the block's writes.
        let stale: Option<Hlc> = self
            .driver
            .pending_deltas()
            .keys()
            .next()
            .filter(|first| *first < &block.hlc_timestamp)
            .cloned();
        if let Some(first) = stale {
            warn!(%first, block = block.number, "dropping stale speculation below committed block");
            self.driver.rollback_to(Some(&first));
        }

        for entry in block.state_changes() {
            self.driver.set(&entry.key, entry.value.clone());
        }
        for entry in &block.rewards {
            self.driver.set(&entry.key, entry.value.clone());
        }

        self.driver.soft_apply(&block.hlc_timestamp);
        let delta = self.driver.hard_apply_one(&block.hlc_timestamp)?;
        self.driver.bust_cache(delta.writes.keys());
        Ok(())
    }

    /// Advances the committed nonce table from a block's transaction.
    fn save_nonce_from_block(&self, block: &Block) -> Result<(), NodeError> {
        let Some(processed) = &block.processed else {
            return Ok(());
        };
        let payload = &processed.transaction.payload;

        match self.nonces.get_nonce(&payload.processor, &payload.sender) {
            Some(current) if payload.nonce <= current => {}
            _ => self
                .nonces
                .set_nonce(&payload.processor, &payload.sender, payload.nonce)?,
        }
        Ok(())
    }

    /// Post-commit checks: governance membership and upgrade markers.
    fn hard_apply_block_finish(&mut self, block: &Block) {
        if block.is_genesis() {
            return;
        }

        let state_changes = block.state_changes().to_vec();

        if state_changes.iter().any(|entry| entry.key == MEMBERS_KEY) {
            self.refresh_members(&block.hlc_timestamp);
        }
        if state_changes
            .iter()
            .any(|entry| entry.key.starts_with("upgrade."))
        {
            self.produce_upgrade_event();
        }
    }

    /// Reconciles connected peers and our own membership with the member
    /// list just committed to state.
    fn refresh_members(&mut self, hlc: &Hlc) {
        let members = self.driver.member_vk_list();

        let exiled: Vec<Vk> = self
            .peers
            .iter()
            .map(|peer| peer.vk())
            .filter(|vk| !members.contains(vk))
            .collect();
        for vk in exiled {
            warn!(%vk, "peer voted out of the member set");
            self.peers.remove(&vk);
            self.validation_queue.clear_solutions(&vk, hlc);
        }

        if !members.contains(&self.vk()) {
            error!("this node was voted out of the member set, shutting down");
            let _ = self.events.write_event(&Event::new(
                NETWORK_ERROR_EVENT,
                serde_json::json!({
                    "node_vk": self.vk(),
                    "reason": "voted out of member set",
                }),
            ));
            self.stop();
        }
    }

    fn produce_upgrade_event(&mut self) {
        let _ = self.events.write_event(&Event::new(
            UPGRADE_EVENT,
            serde_json::json!({
                "node_vk": self.vk(),
                "bootnode_ips": self.peers.ips(),
            }),
        ));
    }

    /// Repairs any gaps flagged since the last sweep.
    async fn sweep_missing_blocks(&mut self) -> Result<(), NodeError> {
        match self
            .missing_blocks
            .run(
                &self.peers,
                &self.blocks,
                &mut self.driver,
                &self.nonces,
                &mut self.events,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(MissingBlocksError::GenesisRequested) => {
                Err(NodeError::MissingBlocks(MissingBlocksError::GenesisRequested))
            }
            Err(err) => {
                // Network trouble here is recoverable; the markers are
                // re-written on the next mismatch.
                warn!(%err, "missing block sweep failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SetterExecutor;
    use crate::network::{MemoryPublisher, MockPeer};
    use crate::queues::ProcessingDelay;
    use crate::state::MemKvStore;
    use crate::types::{StateEntry, TxMetadata, TxPayload, TxResult};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    const NODE_SEED: &str = "1111111111111111111111111111111111111111111111111111111111111111";

    fn node_wallet() -> Wallet {
        Wallet::from_seed_hex(NODE_SEED).unwrap()
    }

    fn test_config(root: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::rooted(root.path());
        config.consensus.processing_delay = ProcessingDelay {
            base_secs: 0.0,
            self_secs: 0.0,
        };
        config
    }

    fn build_node(config: NodeConfig, peers: PeerSet) -> (Node, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let node = Node::new(
            config,
            node_wallet(),
            Box::new(MemKvStore::new()),
            Box::new(SetterExecutor),
            publisher.clone(),
            peers,
        )
        .unwrap();
        (node, publisher)
    }

    fn genesis_for(wallet: &Wallet) -> Block {
        minter::genesis_block_from_state(
            vec![StateEntry::new(MEMBERS_KEY, json!([wallet.verifying_key()]))],
            wallet,
        )
        .unwrap()
    }

    /// Sender-signed `set` transaction processed by the node itself.
    fn set_tx(sender: &Wallet, node_vk: &Vk, nonce: u64, key: &str, value: i64) -> Transaction {
        let payload = TxPayload {
            contract: "kv".to_string(),
            function: "set".to_string(),
            kwargs: json!({"key": key, "value": value}),
            nonce,
            processor: node_vk.clone(),
            sender: sender.verifying_key(),
            stamps_supplied: 10,
        };
        let message = codec::canonical_json(&payload).unwrap();
        Transaction {
            metadata: TxMetadata {
                signature: sender.sign(&message),
            },
            payload,
        }
    }

    fn event_topics(root: &TempDir) -> Vec<String> {
        let mut files: Vec<_> = fs::read_dir(root.path().join("events"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
            .into_iter()
            .map(|path| {
                let event: Event =
                    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
                event.topics[0].clone()
            })
            .collect()
    }

    #[tokio::test]
    async fn single_tx_extends_the_chain_from_genesis() {
        let tmp = TempDir::new().unwrap();
        let (mut node, publisher) = build_node(test_config(&tmp), PeerSet::default());
        let genesis = genesis_for(&node_wallet());
        let genesis_hash = genesis.hash.clone();

        node.start(Some(genesis)).await.unwrap();
        assert_eq!(node.blocks().total_blocks(), 1);

        let sender = Wallet::new();
        node.tx_queue()
            .push(&set_tx(&sender, &node.vk(), 0, "x", 42))
            .unwrap();

        node.pump_tx_queue().await.unwrap();
        node.pump_processing().await.unwrap();
        node.pump_validation().await.unwrap();

        // Exactly one new block at the HLC's nanosecond height, linked to
        // genesis.
        assert_eq!(node.blocks().total_blocks(), 2);
        let block = node.blocks().get_latest_block().unwrap();
        assert_eq!(block.number, block.hlc_timestamp.nanos());
        assert_eq!(block.previous, genesis_hash);
        assert_eq!(
            block.processed.as_ref().unwrap().state[0],
            StateEntry::new("x", json!(42))
        );

        // State was hard-applied.
        assert_eq!(node.driver().lookup("x"), Some(json!(42)));

        // The tx and its result were broadcast; exactly one new_block
        // event beyond the genesis one.
        assert_eq!(publisher.txs.lock().unwrap().len(), 1);
        assert_eq!(publisher.published_result_count(), 1);
        let topics = event_topics(&tmp);
        assert_eq!(
            topics.iter().filter(|t| *t == NEW_BLOCK_EVENT).count(),
            2
        );
        assert!(!topics.iter().any(|t| t == BLOCK_REORG_EVENT));
    }

    #[tokio::test]
    async fn late_earlier_consensus_inserts_and_reorgs() {
        let tmp = TempDir::new().unwrap();
        let (mut node, _publisher) = build_node(test_config(&tmp), PeerSet::default());
        let wallet = node_wallet();
        node.start(Some(genesis_for(&wallet))).await.unwrap();

        // Commit one transaction normally; its HLC is "now".
        let sender = Wallet::new();
        node.tx_queue()
            .push(&set_tx(&sender, &node.vk(), 0, "x", 1))
            .unwrap();
        node.pump_tx_queue().await.unwrap();
        node.pump_processing().await.unwrap();
        node.pump_validation().await.unwrap();
        assert_eq!(node.blocks().total_blocks(), 2);
        let first_block = node.blocks().get_latest_block().unwrap();

        // A peer's consensus result for a strictly earlier HLC arrives
        // after that block was committed.
        let early_hlc = Hlc::new("2000-01-01T00:00:00.000000000Z_0");
        let tx = set_tx(&sender, &node.vk(), 1, "y", 2);
        let tx_result = TxResult {
            hash: codec::tx_hash_from_tx(&tx).unwrap(),
            result: "None".to_string(),
            stamps_used: 1,
            state: vec![StateEntry::new("y", json!(2))],
            status: 0,
            transaction: tx.clone(),
        };
        let members = vec![wallet.verifying_key()];
        let message = codec::proof_message(&tx_result, &early_hlc, &[], &members).unwrap();
        let results = ProcessingResult {
            hlc_timestamp: early_hlc.clone(),
            tx_result,
            rewards: vec![],
            proof: Some(Proof {
                signature: wallet.sign(&message.message),
                signer: wallet.verifying_key(),
                members_list_hash: message.members_list_hash,
                num_of_members: message.num_of_members,
                tx_result_hash: None,
            }),
            tx_message: TxMessage {
                tx,
                hlc_timestamp: early_hlc.clone(),
                signature: "dd".repeat(64),
                sender: wallet.verifying_key(),
            },
        };

        node.handle_contender(results);
        node.pump_validation().await.unwrap();

        // One block at each height, linked in HLC order.
        assert_eq!(node.blocks().total_blocks(), 3);
        let inserted = node.blocks().get_block_by_hlc(&early_hlc).unwrap();
        assert_eq!(inserted.number, early_hlc.nanos());

        let rewritten = node.blocks().get_block(first_block.number).unwrap();
        assert_eq!(rewritten.previous, inserted.hash);
        assert_eq!(
            rewritten.hash,
            codec::block_hash(&rewritten.hlc_timestamp, rewritten.number, &inserted.hash)
        );

        // Exactly one reorg event, for the rewritten later block.
        let topics = event_topics(&tmp);
        assert_eq!(
            topics.iter().filter(|t| *t == BLOCK_REORG_EVENT).count(),
            1
        );

        // Both state writes ended durable.
        assert_eq!(node.driver().lookup("x"), Some(json!(1)));
        assert_eq!(node.driver().lookup("y"), Some(json!(2)));
    }

    #[tokio::test]
    async fn bad_previous_hash_triggers_catchup_and_convergence() {
        let tmp = TempDir::new().unwrap();
        let wallet = node_wallet();
        let genesis = genesis_for(&wallet);

        // A peer that is five signed blocks ahead of us.
        let mut peer_chain = vec![genesis.clone()];
        let mut previous = genesis.hash.clone();
        for i in 1..=5u32 {
            let sender = Wallet::from_seed_hex(NODE_SEED).unwrap();
            let payload = TxPayload {
                contract: "kv".to_string(),
                function: "set".to_string(),
                kwargs: json!({"key": "x", "value": i}),
                nonce: i as u64,
                processor: wallet.verifying_key(),
                sender: sender.verifying_key(),
                stamps_supplied: 10,
            };
            let payload_message = codec::canonical_json(&payload).unwrap();
            let tx = Transaction {
                metadata: TxMetadata {
                    signature: sender.sign(&payload_message),
                },
                payload,
            };
            let hlc = Hlc::new(format!("1970-01-01T00:00:{i:02}.000000000Z_0"));
            let tx_result = TxResult {
                hash: codec::tx_hash_from_tx(&tx).unwrap(),
                result: "None".to_string(),
                stamps_used: 1,
                state: vec![StateEntry::new("x", json!(i))],
                status: 0,
                transaction: tx.clone(),
            };
            let members = vec![wallet.verifying_key()];
            let message = codec::proof_message(&tx_result, &hlc, &[], &members).unwrap();
            let proof = Proof {
                signature: wallet.sign(&message.message),
                signer: wallet.verifying_key(),
                members_list_hash: message.members_list_hash,
                num_of_members: message.num_of_members,
                tx_result_hash: None,
            };
            let results = ProcessingResult {
                hlc_timestamp: hlc.clone(),
                tx_result,
                rewards: vec![],
                proof: None,
                tx_message: TxMessage {
                    tx,
                    hlc_timestamp: hlc,
                    signature: "dd".repeat(64),
                    sender: wallet.verifying_key(),
                },
            };
            let block = minter::block_from_processing_results(
                &results,
                vec![proof],
                &previous,
                &wallet,
            );
            previous = block.hash.clone();
            peer_chain.push(block);
        }

        let peers = PeerSet::new(vec![Arc::new(MockPeer::new("aa".repeat(32), peer_chain.clone()))]);
        let mut config = test_config(&tmp);
        config.run_catchup = false;
        let (mut node, _publisher) = build_node(config, peers);
        node.start(Some(genesis)).await.unwrap();
        assert_eq!(node.blocks().total_blocks(), 1);

        // Offer a block that does not link onto our tip: it is refused and
        // catch-up converges us with the peer instead.
        let tail = peer_chain.last().unwrap().clone();
        let applied = node
            .hard_apply_block_from_network(tail.clone(), false)
            .await
            .unwrap();
        assert!(applied.is_none());

        assert_eq!(node.blocks().total_blocks(), 6);
        assert_eq!(node.blocks().get_latest_block().unwrap().hash, tail.hash);

        // Catch-up never reorgs.
        let topics = event_topics(&tmp);
        assert!(!topics.iter().any(|t| t == BLOCK_REORG_EVENT));
    }

    #[tokio::test]
    async fn starting_without_genesis_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let (mut node, _publisher) = build_node(test_config(&tmp), PeerSet::default());

        match node.start(None).await {
            Err(NodeError::MissingGenesis) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn committed_nonces_increase_across_blocks() {
        let tmp = TempDir::new().unwrap();
        let (mut node, _publisher) = build_node(test_config(&tmp), PeerSet::default());
        node.start(Some(genesis_for(&node_wallet()))).await.unwrap();

        let sender = Wallet::new();
        for nonce in 0..3u64 {
            node.tx_queue()
                .push(&set_tx(&sender, &node.vk(), nonce, "x", nonce as i64))
                .unwrap();
            node.pump_tx_queue().await.unwrap();
            node.pump_processing().await.unwrap();
            node.pump_validation().await.unwrap();
        }

        assert_eq!(node.blocks().total_blocks(), 4);

        // Replaying an already-used nonce is refused at admission.
        node.tx_queue()
            .push(&set_tx(&sender, &node.vk(), 1, "x", 99))
            .unwrap();
        node.pump_tx_queue().await.unwrap();
        node.pump_processing().await.unwrap();
        node.pump_validation().await.unwrap();
        assert_eq!(node.blocks().total_blocks(), 4);
    }

    #[tokio::test]
    async fn member_exile_stops_the_node() {
        let tmp = TempDir::new().unwrap();
        let (mut node, _publisher) = build_node(test_config(&tmp), PeerSet::default());
        node.start(Some(genesis_for(&node_wallet()))).await.unwrap();
        assert!(node.is_running());

        // A committed transaction replaces the member set without us.
        let sender = Wallet::new();
        let payload = TxPayload {
            contract: "masternodes".to_string(),
            function: "set".to_string(),
            kwargs: json!({"key": MEMBERS_KEY, "value": ["ff".repeat(32)]}),
            nonce: 0,
            processor: node.vk(),
            sender: sender.verifying_key(),
            stamps_supplied: 10,
        };
        let message = codec::canonical_json(&payload).unwrap();
        let tx = Transaction {
            metadata: TxMetadata {
                signature: sender.sign(&message),
            },
            payload,
        };
        node.tx_queue().push(&tx).unwrap();

        node.pump_tx_queue().await.unwrap();
        node.pump_processing().await.unwrap();
        node.pump_validation().await.unwrap();

        assert!(!node.is_running());
        let topics = event_topics(&tmp);
        assert!(topics.iter().any(|t| t == NETWORK_ERROR_EVENT));
    }
}
