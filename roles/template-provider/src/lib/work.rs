//! ## Work Construction
//!
//! Converts an assembled [`BlockTemplate`] into the wire messages a client
//! mines from: [`NewTemplate`] carries the coinbase skeleton and the
//! coinbase merkle path, [`SetNewPrevHash`] carries the header fields tied
//! to the previous block.

use bitcoin::{
    consensus::serialize,
    hashes::{sha256d, Hash},
    Block, Target,
};
use tp_messages::{NewTemplate, SetNewPrevHash};

use crate::{
    chain::BlockTemplate,
    error::{TpError, TpResult},
};

/// Builds the `NewTemplate` message for `block`.
///
/// The first coinbase output holds the value spendable by the client and is
/// omitted from `coinbase_tx_outputs`; the remaining outputs (such as the
/// witness commitment) must be reproduced verbatim at the end of the final
/// coinbase.
pub fn new_template_msg(
    block: &Block,
    template_id: u64,
    future_template: bool,
) -> TpResult<NewTemplate> {
    let coinbase = block
        .txdata
        .first()
        .ok_or_else(|| TpError::BadBlock("template has no coinbase".into()))?;
    let input = coinbase
        .input
        .first()
        .ok_or_else(|| TpError::BadBlock("coinbase has no input".into()))?;

    let mut coinbase_tx_outputs = Vec::new();
    for output in coinbase.output.iter().skip(1) {
        coinbase_tx_outputs.extend_from_slice(&serialize(output));
    }

    Ok(NewTemplate {
        template_id,
        future_template,
        version: block.header.version.to_consensus() as u32,
        coinbase_tx_version: coinbase.version.0 as u32,
        coinbase_prefix: input.script_sig.as_bytes().to_vec(),
        coinbase_tx_input_sequence: input.sequence.0,
        coinbase_tx_value_remaining: coinbase
            .output
            .first()
            .map(|out| out.value.to_sat())
            .unwrap_or(0),
        coinbase_tx_outputs_count: coinbase.output.len().saturating_sub(1) as u32,
        coinbase_tx_outputs,
        coinbase_tx_locktime: coinbase.lock_time.to_consensus_u32(),
        merkle_path: coinbase_merkle_path(block),
    })
}

/// Builds the `SetNewPrevHash` message activating `template_id`.
pub fn set_new_prev_hash_msg(block: &Block, template_id: u64) -> SetNewPrevHash {
    SetNewPrevHash {
        template_id,
        prev_hash: block.header.prev_blockhash.to_byte_array(),
        header_timestamp: block.header.time,
        n_bits: block.header.bits.to_consensus(),
        target: Target::from_compact(block.header.bits).to_le_bytes(),
    }
}

/// Sum of the non-coinbase fees of a template; the coinbase entry is
/// negative and skipped.
pub fn template_fees(template: &BlockTemplate) -> i64 {
    template.tx_fees.iter().filter(|fee| **fee >= 0).sum()
}

/// Merkle path of the coinbase, deepest node first: the sibling hashes a
/// client combines with its own coinbase txid to reach the merkle root.
pub fn coinbase_merkle_path(block: &Block) -> Vec<[u8; 32]> {
    let mut layer: Vec<[u8; 32]> = block
        .txdata
        .iter()
        .map(|tx| tx.compute_txid().to_byte_array())
        .collect();

    // The coinbase sits at the leftmost position of every layer, so its
    // sibling is always the node at index 1. The value at index 0 never
    // feeds the siblings pushed onto the path.
    let mut path = Vec::new();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            if let Some(&last) = layer.last() {
                layer.push(last);
            }
        }
        path.push(layer[1]);
        layer = layer
            .chunks(2)
            .map(|pair| {
                let mut concat = [0u8; 64];
                concat[..32].copy_from_slice(&pair[0]);
                concat[32..].copy_from_slice(&pair[1]);
                sha256d::Hash::hash(&concat).to_byte_array()
            })
            .collect();
    }
    path
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::{mock::MockChain, ChainSource, MAX_BLOCK_WEIGHT};
    use tp_messages::{Sv2Message, Sv2NetMsg};

    fn template_with_txs(count: u8) -> BlockTemplate {
        let chain = MockChain::new();
        for seed in 0..count {
            chain.add_transaction(MockChain::sample_transaction(seed), 1000 * seed as i64);
        }
        chain.create_template(MAX_BLOCK_WEIGHT).unwrap()
    }

    // Folding the coinbase txid along the path must reproduce the block's
    // merkle root, for any transaction count.
    #[test]
    fn merkle_path_folds_back_to_the_root() {
        for count in 0..6u8 {
            let template = template_with_txs(count);
            let block = &template.block;
            let path = coinbase_merkle_path(block);

            let mut acc = block.txdata[0].compute_txid().to_byte_array();
            for node in &path {
                let mut concat = [0u8; 64];
                concat[..32].copy_from_slice(&acc);
                concat[32..].copy_from_slice(node);
                acc = sha256d::Hash::hash(&concat).to_byte_array();
            }
            assert_eq!(
                acc,
                block.header.merkle_root.to_byte_array(),
                "count = {}",
                count
            );
        }
    }

    #[test]
    fn empty_template_payload_is_91_bytes() {
        let template = template_with_txs(0);
        let msg = new_template_msg(&template.block, 1, true).unwrap();
        let mut payload = Vec::new();
        msg.serialize_payload(&mut payload).unwrap();
        assert_eq!(payload.len(), 91);
        assert!(msg.merkle_path.is_empty());
        assert_eq!(msg.coinbase_tx_outputs_count, 1);
    }

    #[test]
    fn each_transaction_extends_the_path_payload() {
        let template = template_with_txs(1);
        let msg = new_template_msg(&template.block, 2, false).unwrap();
        let net = Sv2NetMsg::from_message(&msg).unwrap();
        assert_eq!(net.payload.len(), 91 + 32);
    }

    #[test]
    fn set_new_prev_hash_matches_header() {
        let template = template_with_txs(0);
        let msg = set_new_prev_hash_msg(&template.block, 7);
        assert_eq!(msg.template_id, 7);
        assert_eq!(
            msg.prev_hash,
            template.block.header.prev_blockhash.to_byte_array()
        );
        assert_eq!(msg.n_bits, 0x207f_ffff);
        assert_eq!(msg.header_timestamp, template.block.header.time);
    }

    #[test]
    fn fees_skip_the_coinbase_entry() {
        let template = BlockTemplate {
            block: template_with_txs(0).block,
            tx_fees: vec![-1, 5000, 2500],
        };
        assert_eq!(template_fees(&template), 7500);
    }
}
