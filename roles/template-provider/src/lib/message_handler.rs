//! ## Message Handler
//!
//! The per-client protocol state machine: `SetupConnection`,
//! `CoinbaseOutputDataSize`, `SubmitSolution` and `RequestTransactionData`,
//! plus the `send_work` path that assembles and pushes templates.

use bitcoin::consensus::deserialize;
use bitcoin::Transaction;
use tp_messages::{
    CoinbaseOutputDataSize, RequestTransactionData, RequestTransactionDataError,
    RequestTransactionDataSuccess, SetupConnection, SetupConnectionError, SetupConnectionSuccess,
    SubmitSolution, Sv2NetMsg, MESSAGE_TYPE_COINBASE_OUTPUT_DATA_SIZE,
    MESSAGE_TYPE_REQUEST_TRANSACTION_DATA, MESSAGE_TYPE_SETUP_CONNECTION,
    MESSAGE_TYPE_SUBMIT_SOLUTION, TP_SUBPROTOCOL,
};
use tracing::{debug, error, warn};

use crate::{
    chain::{ChainSource, MAX_BLOCK_WEIGHT},
    error::TpResult,
    work::{new_template_msg, set_new_prev_hash_msg, template_fees},
    Sv2Handler,
};

impl<C: ChainSource> Sv2Handler<C> {
    /// Dispatches one decrypted sv2 message for the client at `idx`.
    /// Protocol violations flag the client for disconnection; malformed
    /// solution or transaction-data requests are logged and dropped;
    /// unknown message types are ignored.
    pub(crate) fn process_sv2_message(&mut self, idx: usize, msg: &Sv2NetMsg) -> TpResult<()> {
        match msg.header.msg_type {
            MESSAGE_TYPE_SETUP_CONNECTION => self.handle_setup_connection(idx, msg),
            MESSAGE_TYPE_COINBASE_OUTPUT_DATA_SIZE => {
                self.handle_coinbase_output_data_size(idx, msg)
            }
            MESSAGE_TYPE_SUBMIT_SOLUTION => self.handle_submit_solution(idx, msg),
            MESSAGE_TYPE_REQUEST_TRANSACTION_DATA => self.handle_request_transaction_data(idx, msg),
            unknown => {
                warn!("Received unknown message type 0x{:02x}", unknown);
                Ok(())
            }
        }
    }

    fn handle_setup_connection(&mut self, idx: usize, msg: &Sv2NetMsg) -> TpResult<()> {
        debug!("Received 0x00 SetupConnection");

        if self.clients[idx].setup_connection_confirmed {
            error!("Client connection has already been confirmed");
            return Ok(());
        }

        let setup_conn = match msg.parse::<SetupConnection>() {
            Ok(setup_conn) => setup_conn,
            Err(e) => {
                error!("Received invalid SetupConnection message: {}", e);
                self.clients[idx].disconnect_flag = true;
                return Ok(());
            }
        };

        // Disconnect a client that connects on the wrong subprotocol.
        if setup_conn.protocol != TP_SUBPROTOCOL {
            debug!("Send 0x02 SetupConnection.Error");
            let setup_conn_err = SetupConnectionError {
                flags: setup_conn.flags,
                error_code: "unsupported-protocol".into(),
            };
            if let Err(e) = self.clients[idx].send_message(&setup_conn_err) {
                error!("Failed to send SetupConnection.Error message: {}", e);
            }
            self.clients[idx].disconnect_flag = true;
            return Ok(());
        }

        // Disconnect a client that is not running a compatible protocol
        // version.
        if self.protocol_version < setup_conn.min_version
            || self.protocol_version > setup_conn.max_version
        {
            debug!("Send 0x02 SetupConnection.Error");
            let setup_conn_err = SetupConnectionError {
                flags: setup_conn.flags,
                error_code: "protocol-version-mismatch".into(),
            };
            if let Err(e) = self.clients[idx].send_message(&setup_conn_err) {
                error!("Failed to send SetupConnection.Error message: {}", e);
            }
            error!(
                "Received a connection with incompatible protocol versions: min_version: {}, max_version: {}",
                setup_conn.min_version, setup_conn.max_version
            );
            self.clients[idx].disconnect_flag = true;
            return Ok(());
        }

        debug!("Send 0x01 SetupConnection.Success");
        let setup_success = SetupConnectionSuccess {
            used_version: self.protocol_version,
            flags: self.optional_features,
        };
        if let Err(e) = self.clients[idx].send_message(&setup_success) {
            error!("Failed to send SetupConnection.Success message: {}", e);
            self.clients[idx].disconnect_flag = true;
            return Ok(());
        }

        self.clients[idx].setup_connection_confirmed = true;
        Ok(())
    }

    fn handle_coinbase_output_data_size(&mut self, idx: usize, msg: &Sv2NetMsg) -> TpResult<()> {
        debug!("Received 0x70 CoinbaseOutputDataSize");

        if !self.clients[idx].setup_connection_confirmed {
            self.clients[idx].disconnect_flag = true;
            return Ok(());
        }

        let coinbase_output_data_size = match msg.parse::<CoinbaseOutputDataSize>() {
            Ok(m) => m,
            Err(e) => {
                error!("Received invalid CoinbaseOutputDataSize message: {}", e);
                self.clients[idx].disconnect_flag = true;
                return Ok(());
            }
        };
        self.clients[idx].coinbase_output_data_size_recv = true;

        let max_additional_size = coinbase_output_data_size.coinbase_output_max_additional_size;
        debug!("coinbase_output_max_additional_size={} bytes", max_additional_size);

        if max_additional_size as u64 > MAX_BLOCK_WEIGHT {
            error!(
                "Received impossible CoinbaseOutputDataSize: {}",
                max_additional_size
            );
            self.clients[idx].disconnect_flag = true;
            return Ok(());
        }

        self.clients[idx].coinbase_tx_outputs_size = max_additional_size;

        // Send the new template and prev hash.
        if let Err(e) = self.send_work(idx, /* send_new_prevhash= */ true) {
            error!("Failed to send work to new client: {}", e);
            self.clients[idx].disconnect_flag = true;
        }
        Ok(())
    }

    fn handle_submit_solution(&mut self, idx: usize, msg: &Sv2NetMsg) -> TpResult<()> {
        debug!("Received 0x60 SubmitSolution");

        if !self.clients[idx].is_fully_connected() {
            self.clients[idx].disconnect_flag = true;
            return Ok(());
        }

        let submit_solution = match msg.parse::<SubmitSolution>() {
            Ok(m) => m,
            Err(e) => {
                error!("Received invalid SubmitSolution message: {}", e);
                return Ok(());
            }
        };

        // A missing template is not an error: it may simply have expired
        // with a block found elsewhere in the meantime.
        let cached = match self.block_cache.get(&submit_solution.template_id) {
            Some(cached) => cached,
            None => return Ok(()),
        };

        let coinbase_tx: Transaction = match deserialize(&submit_solution.coinbase_tx) {
            Ok(tx) => tx,
            Err(e) => {
                error!("Received SubmitSolution with invalid coinbase: {}", e);
                return Ok(());
            }
        };

        let mut block = cached.block.clone();
        if block.txdata.is_empty() {
            block.txdata.push(coinbase_tx);
        } else {
            block.txdata[0] = coinbase_tx;
        }
        block.header.version = bitcoin::block::Version::from_consensus(submit_solution.version as i32);
        block.header.time = submit_solution.header_timestamp;
        block.header.nonce = submit_solution.header_nonce;
        match block.compute_merkle_root() {
            Some(merkle_root) => block.header.merkle_root = merkle_root,
            None => {
                error!("Received SubmitSolution for a template with no transactions");
                return Ok(());
            }
        }

        debug!(
            "Submitting solved block for template id {}",
            submit_solution.template_id
        );
        self.chain.submit_block(block);
        Ok(())
    }

    fn handle_request_transaction_data(&mut self, idx: usize, msg: &Sv2NetMsg) -> TpResult<()> {
        debug!("Received 0x73 RequestTransactionData");

        let request_tx_data = match msg.parse::<RequestTransactionData>() {
            Ok(m) => m,
            Err(e) => {
                error!("Received invalid RequestTransactionData message: {}", e);
                return Ok(());
            }
        };

        match self.block_cache.get(&request_tx_data.template_id) {
            Some(cached) => {
                let block = &cached.block;
                let witness_reserve_value = block
                    .txdata
                    .first()
                    .and_then(|coinbase| coinbase.input.first())
                    .and_then(|input| input.witness.nth(0))
                    .map(|value| value.to_vec())
                    .unwrap_or_default();
                let transaction_list = block
                    .txdata
                    .iter()
                    .skip(1)
                    .map(bitcoin::consensus::serialize)
                    .collect();

                let request_tx_data_success = RequestTransactionDataSuccess {
                    template_id: request_tx_data.template_id,
                    excess_data: witness_reserve_value,
                    transaction_list,
                };
                debug!("Send 0x74 RequestTransactionData.Success");
                if let Err(e) = self.clients[idx].send_message(&request_tx_data_success) {
                    error!("Error sending RequestTransactionData.Success message: {}", e);
                    self.clients[idx].disconnect_flag = true;
                }
            }
            None => {
                let request_tx_data_error = RequestTransactionDataError {
                    template_id: request_tx_data.template_id,
                    error_code: "template-id-not-found".into(),
                };
                debug!("Send 0x75 RequestTransactionData.Error");
                if let Err(e) = self.clients[idx].send_message(&request_tx_data_error) {
                    error!("Error sending RequestTransactionData.Error message: {}", e);
                    self.clients[idx].disconnect_flag = true;
                }
            }
        }
        Ok(())
    }

    /// Assembles a fresh template for the client at `idx` and pushes it as
    /// `NewTemplate`, followed by `SetNewPrevHash` when the template is
    /// tied to a new previous block. Intra-block updates whose fee gain is
    /// below the configured delta are suppressed.
    pub(crate) fn send_work(&mut self, idx: usize, send_new_prevhash: bool) -> TpResult<()> {
        self.template_id += 1;
        let max_additional_size = self.clients[idx].coinbase_tx_outputs_size as u64;
        let template = self
            .chain
            .create_template(MAX_BLOCK_WEIGHT - max_additional_size)?;

        // Do not push a new template when the fee increase is insufficient.
        let fees = template_fees(&template);
        if !send_new_prevhash
            && self.clients[idx].latest_submitted_template_fees + self.minimum_fee_delta > fees
        {
            return Ok(());
        }

        let new_template =
            new_template_msg(&template.block, self.template_id, send_new_prevhash)?;
        let prev_hash_msg = set_new_prev_hash_msg(&template.block, self.template_id);
        self.block_cache.insert(self.template_id, template);
        self.publish_cache_size();

        debug!("Send 0x71 NewTemplate (id {})", self.template_id);
        self.clients[idx].send_message(&new_template)?;

        if send_new_prevhash {
            debug!("Send 0x72 SetNewPrevHash");
            self.clients[idx].send_message(&prev_hash_msg)?;
        }

        self.clients[idx].latest_submitted_template_fees = fees;
        Ok(())
    }
}
