//! ## Chain Interface
//!
//! The Template Provider does not validate blocks or track the mempool
//! itself; it drives a [`ChainSource`] for everything chain-related:
//! initial-block-download state, best-block change signalling, a mempool
//! version counter, template assembly and block submission.
//!
//! [`mock::MockChain`] is an in-process implementation serving
//! deterministic regtest-style templates, used by the integration tests and
//! the development binary.

use std::time::Duration;

use bitcoin::{Block, BlockHash};

use crate::error::TpResult;

/// Maximum block weight; also bounds `coinbase_output_max_additional_size`.
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

/// A candidate block with per-transaction fees.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    /// Fee of each transaction in `block.txdata`; the coinbase entry is -1.
    pub tx_fees: Vec<i64>,
}

/// The blockchain/mempool engine the provider runs against.
///
/// All methods are called synchronously from the sv2 handler thread.
pub trait ChainSource: Send + Sync {
    /// Whether the node is still in initial block download. The provider
    /// does not serve templates during IBD.
    fn is_initial_block_download(&self) -> bool;

    /// Blocks for at most `timeout` waiting for a best-block change, then
    /// returns the current best block hash. The caller detects changes by
    /// comparing against the hash it last saw.
    fn wait_best_block(&self, timeout: Duration) -> BlockHash;

    /// Monotonic counter bumped whenever the mempool transaction set
    /// changes.
    fn transactions_updated(&self) -> u64;

    /// Assembles a new block template with at most `max_weight` block
    /// weight available to transactions.
    fn create_template(&self, max_weight: u64) -> TpResult<BlockTemplate>;

    /// Submits a solved block; returns whether it was accepted as a new
    /// valid block.
    fn submit_block(&self, block: Block) -> bool;
}

pub mod mock {
    //! A deterministic chain source for tests and local development.

    use std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Condvar, Mutex,
    };
    use std::time::Duration;

    use bitcoin::{
        absolute::LockTime,
        block::{Header, Version as BlockVersion},
        hashes::Hash,
        transaction::Version as TxVersion,
        Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
        TxIn, TxMerkleNode, TxOut, Txid, Witness,
    };

    use super::{BlockTemplate, ChainSource};
    use crate::error::{TpError, TpResult};

    const COIN: u64 = 100_000_000;

    struct MockChainState {
        height: u32,
        best_hash: BlockHash,
        mempool: Vec<(Transaction, i64)>,
    }

    /// An in-process [`ChainSource`] serving regtest-style templates built
    /// from a synthetic mempool.
    pub struct MockChain {
        state: Mutex<MockChainState>,
        best_block_cv: Condvar,
        transactions_updated: AtomicU64,
        ibd: AtomicBool,
        submitted: Mutex<Vec<Block>>,
    }

    impl MockChain {
        pub fn new() -> Self {
            let height = 100;
            Self {
                state: Mutex::new(MockChainState {
                    height,
                    best_hash: block_hash_at(height),
                    mempool: Vec::new(),
                }),
                best_block_cv: Condvar::new(),
                transactions_updated: AtomicU64::new(0),
                ibd: AtomicBool::new(false),
                submitted: Mutex::new(Vec::new()),
            }
        }

        pub fn set_initial_block_download(&self, ibd: bool) {
            self.ibd.store(ibd, Ordering::SeqCst);
        }

        /// Adds a transaction paying `fee` satoshis and bumps the mempool
        /// version.
        pub fn add_transaction(&self, tx: Transaction, fee: i64) {
            let mut state = self.state.lock().expect("mock chain state");
            state.mempool.push((tx, fee));
            drop(state);
            self.transactions_updated.fetch_add(1, Ordering::SeqCst);
        }

        /// Replaces the mempool entry at `index`, as a fee-bumping
        /// replacement would.
        pub fn replace_transaction(&self, index: usize, tx: Transaction, fee: i64) {
            let mut state = self.state.lock().expect("mock chain state");
            state.mempool[index] = (tx, fee);
            drop(state);
            self.transactions_updated.fetch_add(1, Ordering::SeqCst);
        }

        /// Connects a new best block: the height advances, the mempool is
        /// emptied and waiters on the best-block condition are woken.
        pub fn advance_best_block(&self) {
            let mut state = self.state.lock().expect("mock chain state");
            state.height += 1;
            state.best_hash = block_hash_at(state.height);
            state.mempool.clear();
            drop(state);
            self.transactions_updated.fetch_add(1, Ordering::SeqCst);
            self.best_block_cv.notify_all();
        }

        /// Blocks submitted through [`ChainSource::submit_block`].
        pub fn submitted_blocks(&self) -> Vec<Block> {
            self.submitted.lock().expect("submitted blocks").clone()
        }

        /// A spendable-looking transaction whose inputs are seeded from
        /// `seed`, so distinct seeds give distinct txids.
        pub fn sample_transaction(seed: u8) -> Transaction {
            Transaction {
                version: TxVersion(2),
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_byte_array([seed; 32]),
                        vout: 0,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                }],
                output: vec![TxOut {
                    value: Amount::from_sat(49 * COIN),
                    script_pubkey: ScriptBuf::new(),
                }],
            }
        }
    }

    impl Default for MockChain {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ChainSource for MockChain {
        fn is_initial_block_download(&self) -> bool {
            self.ibd.load(Ordering::SeqCst)
        }

        fn wait_best_block(&self, timeout: Duration) -> BlockHash {
            let state = self.state.lock().expect("mock chain state");
            let (state, _) = self
                .best_block_cv
                .wait_timeout(state, timeout)
                .expect("mock chain state");
            state.best_hash
        }

        fn transactions_updated(&self) -> u64 {
            self.transactions_updated.load(Ordering::SeqCst)
        }

        fn create_template(&self, _max_weight: u64) -> TpResult<BlockTemplate> {
            let state = self.state.lock().expect("mock chain state");
            let next_height = state.height + 1;

            let fees: i64 = state.mempool.iter().map(|(_, fee)| *fee).sum();
            let coinbase = build_coinbase(next_height, fees);

            let mut txdata = vec![coinbase];
            let mut tx_fees = vec![-1];
            for (tx, fee) in &state.mempool {
                txdata.push(tx.clone());
                tx_fees.push(*fee);
            }

            let mut block = Block {
                header: Header {
                    version: BlockVersion::from_consensus(0x2000_0000),
                    prev_blockhash: state.best_hash,
                    merkle_root: TxMerkleNode::all_zeros(),
                    time: 1_600_000_000 + next_height,
                    bits: CompactTarget::from_consensus(0x207f_ffff),
                    nonce: 0,
                },
                txdata,
            };
            let merkle_root = block
                .compute_merkle_root()
                .ok_or_else(|| TpError::BadBlock("no transactions in template".into()))?;
            block.header.merkle_root = merkle_root;

            Ok(BlockTemplate { block, tx_fees })
        }

        fn submit_block(&self, block: Block) -> bool {
            self.submitted.lock().expect("submitted blocks").push(block);
            true
        }
    }

    // Coinbase with a 3-byte height script, a reward output and a witness
    // commitment output, matching what a regtest assembler emits.
    fn build_coinbase(height: u32, fees: i64) -> Transaction {
        let mut commitment_script = vec![0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
        commitment_script.extend_from_slice(&[0u8; 32]);
        Transaction {
            version: TxVersion(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01, (height & 0xff) as u8, 0x00]),
                sequence: Sequence::MAX,
                witness: Witness::from_slice(&[[0u8; 32]]),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(50 * COIN + fees.max(0) as u64),
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::from_bytes(commitment_script),
                },
            ],
        }
    }

    fn block_hash_at(height: u32) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&height.to_le_bytes());
        bytes[4] = 0xbb;
        BlockHash::from_byte_array(bytes)
    }

}
