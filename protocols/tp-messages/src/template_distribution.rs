use crate::{
    error::Result,
    parser::{
        put_b0255, put_b064k, put_bool, put_seq0255_u256, put_seq064k_b016m, put_str0255, put_u32,
        put_u64, Reader,
    },
    Sv2Message, MESSAGE_TYPE_COINBASE_OUTPUT_DATA_SIZE, MESSAGE_TYPE_NEW_TEMPLATE,
    MESSAGE_TYPE_REQUEST_TRANSACTION_DATA, MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_ERROR,
    MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_SUCCESS, MESSAGE_TYPE_SET_NEW_PREV_HASH,
    MESSAGE_TYPE_SUBMIT_SOLUTION,
};

/// Client -> Server. Declares how many additional weighted bytes the client
/// may add to the coinbase transaction; templates are assembled with block
/// space reserved for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinbaseOutputDataSize {
    pub coinbase_output_max_additional_size: u32,
}

impl Sv2Message for CoinbaseOutputDataSize {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_COINBASE_OUTPUT_DATA_SIZE;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u32(out, self.coinbase_output_max_additional_size);
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            coinbase_output_max_additional_size: reader.read_u32()?,
        })
    }
}

/// Server -> Client. The primary template-providing message.
///
/// With `future_template` set, the template is to be activated by a later
/// [`SetNewPrevHash`] carrying the same `template_id`; otherwise it updates
/// work on the previously announced prev-hash and the client should switch
/// to it immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTemplate {
    /// Strictly increasing template identifier.
    pub template_id: u64,
    pub future_template: bool,
    /// Block header version.
    pub version: u32,
    /// The coinbase transaction nVersion field.
    pub coinbase_tx_version: u32,
    /// Bytes to be placed at the beginning of the coinbase scriptSig.
    pub coinbase_prefix: Vec<u8>,
    /// The coinbase transaction input's nSequence field.
    pub coinbase_tx_input_sequence: u32,
    /// Value, in satoshis, spendable in outputs added by the client. Block
    /// subsidy plus fees.
    pub coinbase_tx_value_remaining: u64,
    pub coinbase_tx_outputs_count: u32,
    /// Serialized outputs that must appear at the end of the coinbase.
    pub coinbase_tx_outputs: Vec<u8>,
    pub coinbase_tx_locktime: u32,
    /// Merkle path of the coinbase, ordered from deepest.
    pub merkle_path: Vec<[u8; 32]>,
}

impl Sv2Message for NewTemplate {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_NEW_TEMPLATE;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u64(out, self.template_id);
        put_bool(out, self.future_template);
        put_u32(out, self.version);
        put_u32(out, self.coinbase_tx_version);
        put_b0255(out, &self.coinbase_prefix)?;
        put_u32(out, self.coinbase_tx_input_sequence);
        put_u64(out, self.coinbase_tx_value_remaining);
        put_u32(out, self.coinbase_tx_outputs_count);
        put_b064k(out, &self.coinbase_tx_outputs)?;
        put_u32(out, self.coinbase_tx_locktime);
        put_seq0255_u256(out, &self.merkle_path)?;
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            template_id: reader.read_u64()?,
            future_template: reader.read_bool()?,
            version: reader.read_u32()?,
            coinbase_tx_version: reader.read_u32()?,
            coinbase_prefix: reader.read_b0255()?,
            coinbase_tx_input_sequence: reader.read_u32()?,
            coinbase_tx_value_remaining: reader.read_u64()?,
            coinbase_tx_outputs_count: reader.read_u32()?,
            coinbase_tx_outputs: reader.read_b064k()?,
            coinbase_tx_locktime: reader.read_u32()?,
            merkle_path: reader.read_seq0255_u256()?,
        })
    }
}

/// Server -> Client. The latest block header hash to mine on; activates a
/// previously sent future [`NewTemplate`] with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNewPrevHash {
    pub template_id: u64,
    /// Previous block hash as it appears in the next block header.
    pub prev_hash: [u8; 32],
    /// `nTime` the client should start at.
    pub header_timestamp: u32,
    pub n_bits: u32,
    /// Maximum valid double-SHA256 block hash.
    pub target: [u8; 32],
}

impl Sv2Message for SetNewPrevHash {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_SET_NEW_PREV_HASH;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u64(out, self.template_id);
        out.extend_from_slice(&self.prev_hash);
        put_u32(out, self.header_timestamp);
        put_u32(out, self.n_bits);
        out.extend_from_slice(&self.target);
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            template_id: reader.read_u64()?,
            prev_hash: reader.read_u256()?,
            header_timestamp: reader.read_u32()?,
            n_bits: reader.read_u32()?,
            target: reader.read_u256()?,
        })
    }
}

/// Client -> Server. Requests the full transaction set of a template, e.g.
/// for block propagation or job declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTransactionData {
    pub template_id: u64,
}

impl Sv2Message for RequestTransactionData {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_REQUEST_TRANSACTION_DATA;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u64(out, self.template_id);
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            template_id: reader.read_u64()?,
        })
    }
}

/// Server -> Client. The non-coinbase transactions of the template, with
/// the coinbase witness reserve value as excess data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTransactionDataSuccess {
    pub template_id: u64,
    /// First witness stack element of the coinbase input.
    pub excess_data: Vec<u8>,
    /// Serialized transactions, excluding the coinbase.
    pub transaction_list: Vec<Vec<u8>>,
}

impl Sv2Message for RequestTransactionDataSuccess {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_SUCCESS;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u64(out, self.template_id);
        put_b064k(out, &self.excess_data)?;
        put_seq064k_b016m(out, &self.transaction_list)?;
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            template_id: reader.read_u64()?,
            excess_data: reader.read_b064k()?,
            transaction_list: reader.read_seq064k_b016m()?,
        })
    }
}

/// Server -> Client. The requested template is not in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTransactionDataError {
    pub template_id: u64,
    /// Machine-readable reason, e.g. `template-id-not-found`.
    pub error_code: String,
}

impl Sv2Message for RequestTransactionDataError {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_ERROR;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u64(out, self.template_id);
        put_str0255(out, &self.error_code)?;
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            template_id: reader.read_u64()?,
            error_code: reader.read_str0255()?,
        })
    }
}

/// Client -> Server. A solved block for a cached template: the final
/// coinbase plus the header fields chosen by the miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSolution {
    pub template_id: u64,
    /// Block header version.
    pub version: u32,
    /// Block header nTime.
    pub header_timestamp: u32,
    /// Block header nNonce.
    pub header_nonce: u32,
    /// Serialized full coinbase transaction.
    pub coinbase_tx: Vec<u8>,
}

impl Sv2Message for SubmitSolution {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_SUBMIT_SOLUTION;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u64(out, self.template_id);
        put_u32(out, self.version);
        put_u32(out, self.header_timestamp);
        put_u32(out, self.header_nonce);
        put_b064k(out, &self.coinbase_tx)?;
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            template_id: reader.read_u64()?,
            version: reader.read_u32()?,
            header_timestamp: reader.read_u32()?,
            header_nonce: reader.read_u32()?,
            coinbase_tx: reader.read_b064k()?,
        })
    }
}
