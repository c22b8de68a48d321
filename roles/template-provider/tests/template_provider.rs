//! End-to-end tests: a real Template Provider on localhost driven by a
//! Noise initiator peer over TCP, with a mock chain source behind it.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{
    absolute::LockTime, consensus::serialize, transaction::Version as TxVersion, Amount, OutPoint,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use template_provider::{
    chain::mock::MockChain, config::TemplateProviderConfig, TemplateProvider,
};
use tp_messages::{
    CoinbaseOutputDataSize, NewTemplate, RequestTransactionData, RequestTransactionDataError,
    RequestTransactionDataSuccess, SetNewPrevHash, SetupConnection, SetupConnectionError,
    SetupConnectionSuccess, SubmitSolution, Sv2Message, Sv2NetHeader, Sv2NetMsg,
    MESSAGE_TYPE_NEW_TEMPLATE, MESSAGE_TYPE_SETUP_CONNECTION,
    MESSAGE_TYPE_SETUP_CONNECTION_ERROR, MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS,
    MESSAGE_TYPE_SET_NEW_PREV_HASH, SV2_HEADER_ENCRYPTED_SIZE,
};
use tp_noise::{
    generate_key, NoiseSession, INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE,
    RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE,
};

const COIN: u64 = 100_000_000;
const POLL_DEADLINE: Duration = Duration::from_secs(5);

struct TpTester {
    chain: Arc<MockChain>,
    tp: TemplateProvider,
    port: u16,
}

impl TpTester {
    fn start(port: u16) -> Self {
        let config = TemplateProviderConfig {
            port,
            // Refresh on every scheduler pass so mempool-driven updates are
            // observable without waiting out the production interval.
            template_interval_secs: 0,
            ..Default::default()
        };
        let chain = Arc::new(MockChain::new());
        let tp = TemplateProvider::start(config, chain.clone()).expect("start template provider");
        Self { chain, tp, port }
    }

    /// Connects a peer and runs the two-step handshake.
    fn handshake(&self) -> Peer {
        let stream = connect_with_retry(self.port).expect("connect to template provider");
        stream
            .set_read_timeout(Some(POLL_DEADLINE))
            .expect("set read timeout");
        stream.set_nodelay(true).expect("set nodelay");

        let mut session = NoiseSession::new_initiator(
            generate_key().secret_key(),
            self.tp.authority_public_key(),
        );

        let mut peer = Peer { stream, session: None };

        let mut msg_e = [0u8; RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
        session.process_maybe_handshake(&mut msg_e, true).unwrap();
        peer.stream.write_all(&msg_e).unwrap();

        let mut msg_es = [0u8; INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
        peer.stream.read_exact(&mut msg_es).unwrap();
        session.process_maybe_handshake(&mut msg_es, false).unwrap();
        assert!(session.handshake_complete());

        peer.session = Some(session);
        peer
    }

    /// Handshake plus `SetupConnection` and `CoinbaseOutputDataSize{max}`,
    /// consuming the first template pair.
    fn fully_connect(&self, max_additional_size: u32) -> (Peer, NewTemplate) {
        let mut peer = self.handshake();
        peer.send_message(&setup_connection_msg());
        let reply = peer.read_frame();
        assert_eq!(reply.header.msg_type, MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS);

        peer.send_message(&CoinbaseOutputDataSize {
            coinbase_output_max_additional_size: max_additional_size,
        });
        let new_template = peer.read_frame();
        assert_eq!(new_template.header.msg_type, MESSAGE_TYPE_NEW_TEMPLATE);
        let prev_hash = peer.read_frame();
        assert_eq!(prev_hash.header.msg_type, MESSAGE_TYPE_SET_NEW_PREV_HASH);
        (peer, new_template.parse::<NewTemplate>().unwrap())
    }

    fn wait_for_cached_templates(&self, expected: usize) {
        let deadline = Instant::now() + POLL_DEADLINE;
        while self.tp.cached_templates() != expected {
            assert!(
                Instant::now() < deadline,
                "cache never reached {} templates (currently {})",
                expected,
                self.tp.cached_templates()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_for_connected_clients(&self, expected: usize) {
        let deadline = Instant::now() + POLL_DEADLINE;
        while self.tp.connected_clients() != expected {
            assert!(
                Instant::now() < deadline,
                "connected clients never reached {}",
                expected
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

struct Peer {
    stream: TcpStream,
    session: Option<NoiseSession>,
}

impl Peer {
    fn send_message<M: Sv2Message>(&mut self, msg: &M) {
        let net_msg = Sv2NetMsg::from_message(msg).unwrap();
        self.send_net_msg(&net_msg);
    }

    fn send_net_msg(&mut self, net_msg: &Sv2NetMsg) {
        let session = self.session.as_mut().expect("handshake complete");
        let mut buffer = Vec::new();
        session
            .encrypt_message(&net_msg.header.serialize(), &mut buffer)
            .unwrap();
        session.encrypt_message(&net_msg.payload, &mut buffer).unwrap();
        self.stream.write_all(&buffer).unwrap();
    }

    /// Reads and decrypts one framed message.
    fn read_frame(&mut self) -> Sv2NetMsg {
        let mut encrypted_header = vec![0u8; SV2_HEADER_ENCRYPTED_SIZE];
        self.stream.read_exact(&mut encrypted_header).unwrap();
        let session = self.session.as_mut().expect("handshake complete");
        session.decrypt_message(&mut encrypted_header).unwrap();
        let header = Sv2NetHeader::from_bytes(&encrypted_header).unwrap();

        let expanded = NoiseSession::encrypted_message_size(header.msg_length as usize);
        let mut payload = vec![0u8; expanded];
        self.stream.read_exact(&mut payload).unwrap();
        session.decrypt_message(&mut payload).unwrap();
        Sv2NetMsg { header, payload }
    }

    /// Asserts nothing arrives for a short while.
    fn expect_silence(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => panic!("peer disconnected while expecting silence"),
            Ok(_) => panic!("unexpected bytes while expecting silence"),
            Err(e) => assert!(
                e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut,
                "unexpected error: {}",
                e
            ),
        }
        self.stream.set_read_timeout(Some(POLL_DEADLINE)).unwrap();
    }

    /// Asserts the provider closed the connection.
    fn expect_disconnect(&mut self) {
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + POLL_DEADLINE;
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e)
                    if e.kind() == ErrorKind::ConnectionReset
                        || e.kind() == ErrorKind::BrokenPipe =>
                {
                    return;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    assert!(Instant::now() < deadline, "peer was never disconnected");
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }
}

fn connect_with_retry(port: u16) -> std::io::Result<TcpStream> {
    let deadline = Instant::now() + POLL_DEADLINE;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

fn setup_connection_msg() -> SetupConnection {
    SetupConnection {
        protocol: 0x02,
        min_version: 2,
        max_version: 2,
        flags: 1,
        endpoint_host: "0.0.0.0".into(),
        endpoint_port: 8545,
        vendor: "Bitmain".into(),
        hardware_version: "S9i 13.5".into(),
        firmware: "braiins-os-2018-09-22-1-hash".into(),
        device_id: "some-device-uuid".into(),
    }
}

fn solution_coinbase() -> Transaction {
    Transaction {
        version: TxVersion(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x01, 0x65, 0x00, 0xaa]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50 * COIN),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

#[test]
fn handshake_and_setup_connection() {
    let tester = TpTester::start(18447);
    let mut peer = tester.handshake();
    tester.wait_for_connected_clients(1);
    assert_eq!(tester.tp.fully_connected_clients(), 0);

    // The 58-byte SetupConnection gets a 6-byte SetupConnection.Success:
    // one 44-byte frame on the wire.
    let msg = setup_connection_msg();
    let mut payload = Vec::new();
    msg.serialize_payload(&mut payload).unwrap();
    assert_eq!(payload.len(), 58);
    peer.send_message(&msg);

    let reply = peer.read_frame();
    assert_eq!(reply.header.msg_type, MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS);
    assert_eq!(reply.payload.len(), 6);
    assert_eq!(
        SV2_HEADER_ENCRYPTED_SIZE + NoiseSession::encrypted_message_size(reply.payload.len()),
        44
    );
    let success = reply.parse::<SetupConnectionSuccess>().unwrap();
    assert_eq!(success.used_version, 2);

    // No templates are assembled before a CoinbaseOutputDataSize arrives.
    assert_eq!(tester.tp.cached_templates(), 0);
}

#[test]
fn empty_setup_connection_disconnects() {
    let tester = TpTester::start(18448);
    let mut peer = tester.handshake();
    tester.wait_for_connected_clients(1);

    let net_msg = Sv2NetMsg {
        header: Sv2NetHeader::new(MESSAGE_TYPE_SETUP_CONNECTION, 0).unwrap(),
        payload: Vec::new(),
    };
    peer.send_net_msg(&net_msg);
    peer.expect_disconnect();
    tester.wait_for_connected_clients(0);
}

#[test]
fn wrong_subprotocol_is_rejected() {
    let tester = TpTester::start(18449);
    let mut peer = tester.handshake();

    let mut msg = setup_connection_msg();
    msg.protocol = 0x00;
    peer.send_message(&msg);

    let reply = peer.read_frame();
    assert_eq!(reply.header.msg_type, MESSAGE_TYPE_SETUP_CONNECTION_ERROR);
    let err = reply.parse::<SetupConnectionError>().unwrap();
    assert_eq!(err.error_code, "unsupported-protocol");
    peer.expect_disconnect();
}

#[test]
fn incompatible_versions_are_rejected() {
    let tester = TpTester::start(18450);
    let mut peer = tester.handshake();

    let mut msg = setup_connection_msg();
    msg.min_version = 3;
    msg.max_version = 4;
    peer.send_message(&msg);

    let reply = peer.read_frame();
    let err = reply.parse::<SetupConnectionError>().unwrap();
    assert_eq!(err.error_code, "protocol-version-mismatch");
    peer.expect_disconnect();
}

#[test]
fn first_template_pair_after_coinbase_output_data_size() {
    let tester = TpTester::start(18451);
    let (_peer, new_template) = tester.fully_connect(1);

    // A fresh mock template: 91-byte NewTemplate payload, future flag set.
    let net = Sv2NetMsg::from_message(&new_template).unwrap();
    assert_eq!(net.payload.len(), 91);
    assert!(new_template.future_template);
    assert!(new_template.merkle_path.is_empty());

    tester.wait_for_cached_templates(1);
    assert_eq!(tester.tp.fully_connected_clients(), 1);
}

#[test]
fn oversized_coinbase_output_data_size_disconnects() {
    let tester = TpTester::start(18452);
    let mut peer = tester.handshake();
    peer.send_message(&setup_connection_msg());
    let _ = peer.read_frame();

    peer.send_message(&CoinbaseOutputDataSize {
        coinbase_output_max_additional_size: 4_000_001,
    });
    peer.expect_disconnect();
}

#[test]
fn mempool_update_emits_single_new_template() {
    let tester = TpTester::start(18453);
    let (mut peer, first) = tester.fully_connect(1);
    tester.wait_for_cached_templates(1);

    // A transaction whose fee clears the delta produces one NewTemplate
    // with one extra merkle-path entry, and no SetNewPrevHash.
    tester
        .chain
        .add_transaction(MockChain::sample_transaction(1), 5000);

    let update = peer.read_frame();
    assert_eq!(update.header.msg_type, MESSAGE_TYPE_NEW_TEMPLATE);
    assert_eq!(update.payload.len(), 91 + 32);
    let update = update.parse::<NewTemplate>().unwrap();
    assert!(!update.future_template);
    assert!(update.template_id > first.template_id);
    assert_eq!(update.merkle_path.len(), 1);

    peer.expect_silence();
    tester.wait_for_cached_templates(2);
}

#[test]
fn fee_increase_below_delta_is_suppressed() {
    let tester = TpTester::start(18454);
    let (mut peer, _) = tester.fully_connect(1);
    tester.wait_for_cached_templates(1);

    // Default minimum_fee_delta is 1000 sats.
    tester
        .chain
        .add_transaction(MockChain::sample_transaction(1), 500);

    peer.expect_silence();
    assert_eq!(tester.tp.cached_templates(), 1);
}

#[test]
fn replaced_transaction_keeps_old_template_servable() {
    let tester = TpTester::start(18455);
    let (mut peer, _) = tester.fully_connect(1);
    tester.wait_for_cached_templates(1);

    let original_tx = MockChain::sample_transaction(1);
    tester.chain.add_transaction(original_tx.clone(), 5000);
    let second = peer.read_frame().parse::<NewTemplate>().unwrap();
    tester.wait_for_cached_templates(2);

    // Fee-bump the transaction past the delta; another template goes out.
    let replacement_tx = MockChain::sample_transaction(2);
    tester.chain.replace_transaction(0, replacement_tx, 7000);
    let third = peer.read_frame().parse::<NewTemplate>().unwrap();
    assert!(third.template_id > second.template_id);
    tester.wait_for_cached_templates(3);

    // The previous template still serves its original transaction.
    peer.send_message(&RequestTransactionData {
        template_id: second.template_id,
    });
    let reply = peer.read_frame();
    let success = reply.parse::<RequestTransactionDataSuccess>().unwrap();
    assert_eq!(success.template_id, second.template_id);
    assert_eq!(success.excess_data.len(), 32);
    assert_eq!(success.transaction_list, vec![serialize(&original_tx)]);

    // template_id + (2 + 32) excess_data + (2 + 3 + tx) transaction list.
    let tx_size = serialize(&original_tx).len();
    assert_eq!(reply.payload.len(), 8 + 2 + 32 + 2 + 3 + tx_size);
}

#[test]
fn unknown_template_id_gets_an_error_reply() {
    let tester = TpTester::start(18456);
    let (mut peer, _) = tester.fully_connect(1);

    peer.send_message(&RequestTransactionData { template_id: 9999 });
    let reply = peer.read_frame();
    let err = reply.parse::<RequestTransactionDataError>().unwrap();
    assert_eq!(err.template_id, 9999);
    assert_eq!(err.error_code, "template-id-not-found");

    // The connection survives the miss.
    peer.send_message(&RequestTransactionData { template_id: 9999 });
    let reply = peer.read_frame();
    assert!(reply.parse::<RequestTransactionDataError>().is_ok());
}

#[test]
fn submit_solution_substitutes_coinbase_and_submits() {
    let tester = TpTester::start(18457);
    let (mut peer, template) = tester.fully_connect(1);

    let coinbase = solution_coinbase();
    peer.send_message(&SubmitSolution {
        template_id: template.template_id,
        version: 0x2000_0000,
        header_timestamp: 1_600_000_777,
        header_nonce: 99,
        coinbase_tx: serialize(&coinbase),
    });

    let deadline = Instant::now() + POLL_DEADLINE;
    while tester.chain.submitted_blocks().is_empty() {
        assert!(Instant::now() < deadline, "no block was submitted");
        std::thread::sleep(Duration::from_millis(10));
    }
    let submitted = tester.chain.submitted_blocks();
    assert_eq!(submitted.len(), 1);
    let block = &submitted[0];
    assert_eq!(block.txdata[0], coinbase);
    assert_eq!(block.header.nonce, 99);
    assert_eq!(block.header.time, 1_600_000_777);
    // The merkle root was recomputed over the substituted coinbase.
    assert_eq!(
        block.compute_merkle_root(),
        Some(block.header.merkle_root)
    );
}

#[test]
fn stale_submit_solution_is_silently_dropped() {
    let tester = TpTester::start(18458);
    let (mut peer, template) = tester.fully_connect(1);

    peer.send_message(&SubmitSolution {
        template_id: 424_242,
        version: 0x2000_0000,
        header_timestamp: 1_600_000_777,
        header_nonce: 1,
        coinbase_tx: serialize(&solution_coinbase()),
    });

    peer.expect_silence();
    assert!(tester.chain.submitted_blocks().is_empty());

    // Still connected and serviceable.
    peer.send_message(&RequestTransactionData {
        template_id: template.template_id,
    });
    let reply = peer.read_frame();
    assert!(reply.parse::<RequestTransactionDataSuccess>().is_ok());
}

#[test]
fn new_block_resets_the_template_cache() {
    let tester = TpTester::start(18459);
    let (mut peer, first) = tester.fully_connect(1);
    tester.wait_for_cached_templates(1);

    tester
        .chain
        .add_transaction(MockChain::sample_transaction(1), 5000);
    let _ = peer.read_frame();
    tester.wait_for_cached_templates(2);

    // A new best block invalidates everything: the next wire traffic is a
    // future NewTemplate immediately followed by SetNewPrevHash for the
    // same id, and the cache collapses to the single fresh template.
    tester.chain.advance_best_block();

    let new_template = peer.read_frame();
    assert_eq!(new_template.header.msg_type, MESSAGE_TYPE_NEW_TEMPLATE);
    let new_template = new_template.parse::<NewTemplate>().unwrap();
    assert!(new_template.future_template);
    assert!(new_template.template_id > first.template_id);

    let prev_hash = peer.read_frame();
    assert_eq!(prev_hash.header.msg_type, MESSAGE_TYPE_SET_NEW_PREV_HASH);
    assert_eq!(prev_hash.payload.len(), 80);
    let prev_hash = prev_hash.parse::<SetNewPrevHash>().unwrap();
    assert_eq!(prev_hash.template_id, new_template.template_id);

    tester.wait_for_cached_templates(1);
}

#[test]
fn unknown_message_type_is_ignored() {
    let tester = TpTester::start(18460);
    let (mut peer, template) = tester.fully_connect(1);

    let net_msg = Sv2NetMsg {
        header: Sv2NetHeader::new(0xff, 3).unwrap(),
        payload: vec![1, 2, 3],
    };
    peer.send_net_msg(&net_msg);
    peer.expect_silence();

    // The connection keeps working.
    peer.send_message(&RequestTransactionData {
        template_id: template.template_id,
    });
    let reply = peer.read_frame();
    assert!(reply.parse::<RequestTransactionDataSuccess>().is_ok());
}

#[test]
fn listening_starts_only_after_initial_block_download() {
    let chain = Arc::new(MockChain::new());
    chain.set_initial_block_download(true);
    let config = TemplateProviderConfig {
        port: 18461,
        template_interval_secs: 0,
        ..Default::default()
    };
    let _tp = TemplateProvider::start(config, chain.clone()).expect("start template provider");

    // While in IBD the port stays closed.
    std::thread::sleep(Duration::from_millis(300));
    assert!(TcpStream::connect(("127.0.0.1", 18461)).is_err());

    chain.set_initial_block_download(false);
    assert!(connect_with_retry(18461).is_ok());
}
