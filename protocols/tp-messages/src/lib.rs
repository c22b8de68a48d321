//! # Stratum v2 messages for the Template Provider
//!
//! `tp_messages` implements the sv2 frame header and the typed messages the
//! Template Provider subprotocol exchanges: connection setup from the common
//! protocol plus the template-distribution messages. All integers are
//! little-endian; variable-length fields carry `u8`/`u16`/`u24` length
//! prefixes per the sv2 binary encoding.
//!
//! Messages own their data and convert to and from payload bytes through
//! the [`Sv2Message`] trait; [`Sv2NetMsg`] pairs a decoded payload with its
//! [`Sv2NetHeader`].

mod common;
mod error;
mod header;
mod parser;
mod template_distribution;

pub use common::{SetupConnection, SetupConnectionError, SetupConnectionSuccess};
pub use error::{Error, Result};
pub use header::{
    Sv2NetHeader, EXTENSION_TYPE_NO_EXTENSION, SV2_HEADER_ENCRYPTED_SIZE, SV2_HEADER_PLAIN_SIZE,
};
pub use parser::Reader;
pub use template_distribution::{
    CoinbaseOutputDataSize, NewTemplate, RequestTransactionData, RequestTransactionDataError,
    RequestTransactionDataSuccess, SetNewPrevHash, SubmitSolution,
};

/// Discriminant of the Template Distribution subprotocol in
/// `SetupConnection.protocol`.
pub const TP_SUBPROTOCOL: u8 = 0x02;

// Common message types.
pub const MESSAGE_TYPE_SETUP_CONNECTION: u8 = 0x00;
pub const MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS: u8 = 0x01;
pub const MESSAGE_TYPE_SETUP_CONNECTION_ERROR: u8 = 0x02;

// Template Distribution message types.
pub const MESSAGE_TYPE_SUBMIT_SOLUTION: u8 = 0x60;
pub const MESSAGE_TYPE_COINBASE_OUTPUT_DATA_SIZE: u8 = 0x70;
pub const MESSAGE_TYPE_NEW_TEMPLATE: u8 = 0x71;
pub const MESSAGE_TYPE_SET_NEW_PREV_HASH: u8 = 0x72;
pub const MESSAGE_TYPE_REQUEST_TRANSACTION_DATA: u8 = 0x73;
pub const MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_SUCCESS: u8 = 0x74;
pub const MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_ERROR: u8 = 0x75;

/// A typed sv2 message with a fixed message-type byte and a binary payload
/// encoding.
pub trait Sv2Message: Sized {
    const MESSAGE_TYPE: u8;

    /// Appends the payload encoding to `out`.
    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes the payload. Trailing bytes are ignored, matching stream
    /// deserialization on the wire.
    fn deserialize_payload(payload: &[u8]) -> Result<Self>;
}

/// A framed sv2 message: header plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sv2NetMsg {
    pub header: Sv2NetHeader,
    pub payload: Vec<u8>,
}

impl Sv2NetMsg {
    /// Encodes a typed message into its framed form.
    pub fn from_message<M: Sv2Message>(msg: &M) -> Result<Self> {
        let mut payload = Vec::new();
        msg.serialize_payload(&mut payload)?;
        let header = Sv2NetHeader::new(M::MESSAGE_TYPE, payload.len())?;
        Ok(Self { header, payload })
    }

    /// Decodes the payload as `M`; the caller has already matched the
    /// message type.
    pub fn parse<M: Sv2Message>(&self) -> Result<M> {
        M::deserialize_payload(&self.payload)
    }
}
