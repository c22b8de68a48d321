//! # Stratum v2 Template Provider
//!
//! Serves block templates to mining clients over Noise-encrypted sv2
//! connections. A single dedicated handler thread owns the listening
//! socket, the connected clients, the block cache and the template-id
//! counter; it polls the [`chain::ChainSource`] for best-block changes and
//! mempool updates, and pushes `NewTemplate` / `SetNewPrevHash` messages to
//! every ready client.
//!
//! Embed it by implementing [`chain::ChainSource`] for the node's
//! blockchain/mempool engine and calling [`TemplateProvider::start`].

pub mod chain;
pub mod config;
mod downstream;
pub mod error;
mod message_handler;
pub mod work;

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::TcpListener;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bitcoin::{hashes::Hash, BlockHash};
use secp256k1::{Keypair, SecretKey, XOnlyPublicKey};
use tp_noise::{NoiseSession, SignatureNoiseMessage, INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE};
use tracing::{debug, error, info, trace};

use chain::{BlockTemplate, ChainSource};
use config::TemplateProviderConfig;
use downstream::Sv2Client;
use error::TpResult;

// Certificate format version signed at startup.
const CERTIFICATE_VERSION: u16 = 0;

// How long the handler sleeps between IBD checks.
const IBD_POLL: Duration = Duration::from_millis(100);

// How long each loop iteration waits on the best-block condition.
const BEST_BLOCK_WAIT: Duration = Duration::from_millis(50);

/// Handle to a running Template Provider. Dropping it interrupts the
/// handler thread, disconnects all clients and joins the thread.
pub struct TemplateProvider {
    thread: Option<JoinHandle<()>>,
    interrupt: Arc<AtomicBool>,
    status: Arc<TpStatus>,
    authority_pubkey: XOnlyPublicKey,
    static_pubkey: XOnlyPublicKey,
}

// Counters published by the handler thread, the sole writer.
struct TpStatus {
    connected_clients: AtomicUsize,
    fully_connected_clients: AtomicUsize,
    cached_templates: AtomicUsize,
}

impl TemplateProvider {
    /// Verifies the configured port is bindable, then spawns the sv2
    /// handler thread. The probe socket is dropped here and the port is
    /// re-bound by the thread once the chain source has left IBD; failing
    /// to bind now lets the embedding process refuse to start with a port
    /// already in use.
    pub fn start<C: ChainSource + 'static>(
        config: TemplateProviderConfig,
        chain: Arc<C>,
    ) -> TpResult<Self> {
        let static_key = config.static_key()?;
        let authority = config.authority_keypair()?;
        let certificate = sign_certificate(&static_key, &authority, config.cert_validity_secs);
        let static_pubkey = Keypair::from_secret_key(&secp256k1::Secp256k1::new(), &static_key)
            .x_only_public_key()
            .0;

        {
            let probe = TcpListener::bind(("0.0.0.0", config.port)).map_err(|e| {
                error!(
                    "Template Provider failed to bind to port {}: {}",
                    config.port, e
                );
                e
            })?;
            drop(probe);
        }

        let interrupt = Arc::new(AtomicBool::new(false));
        let status = Arc::new(TpStatus {
            connected_clients: AtomicUsize::new(0),
            fully_connected_clients: AtomicUsize::new(0),
            cached_templates: AtomicUsize::new(0),
        });

        let mut handler = Sv2Handler {
            port: config.port,
            protocol_version: config.protocol_version,
            optional_features: config.optional_features,
            minimum_fee_delta: config.minimum_fee_delta,
            chain,
            interrupt: interrupt.clone(),
            status: status.clone(),
            static_key,
            certificate,
            listener: None,
            clients: Vec::new(),
            block_cache: HashMap::new(),
            template_id: 0,
            best_prev_hash: BlockHash::all_zeros(),
            timer: Timer::new(Duration::from_secs(config.template_interval_secs)),
            template_last_update: 0,
        };

        let thread = std::thread::Builder::new()
            .name("sv2".into())
            .spawn(move || handler.run())?;

        Ok(Self {
            thread: Some(thread),
            interrupt,
            status,
            authority_pubkey: authority.x_only_public_key().0,
            static_pubkey,
        })
    }

    /// Asks the handler thread to exit before its next poll.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// The key clients must pin to verify this provider's certificate.
    pub fn authority_public_key(&self) -> XOnlyPublicKey {
        self.authority_pubkey
    }

    /// The static key the certificate vouches for.
    pub fn static_public_key(&self) -> XOnlyPublicKey {
        self.static_pubkey
    }

    /// Clients that completed the Noise handshake.
    pub fn connected_clients(&self) -> usize {
        self.status.connected_clients.load(Ordering::SeqCst)
    }

    /// Clients that also completed connection setup and announced their
    /// coinbase output size.
    pub fn fully_connected_clients(&self) -> usize {
        self.status.fully_connected_clients.load(Ordering::SeqCst)
    }

    /// Number of templates currently held in the block cache.
    pub fn cached_templates(&self) -> usize {
        self.status.cached_templates.load(Ordering::SeqCst)
    }
}

impl Drop for TemplateProvider {
    fn drop(&mut self) {
        self.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn sign_certificate(
    static_key: &SecretKey,
    authority: &Keypair,
    validity_secs: u64,
) -> SignatureNoiseMessage {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let valid_from = now as u32;
    let valid_to = now.saturating_add(validity_secs).min(u32::MAX as u64) as u32;
    let static_pubkey = Keypair::from_secret_key(&secp256k1::Secp256k1::new(), static_key)
        .x_only_public_key()
        .0;
    SignatureNoiseMessage::sign(
        CERTIFICATE_VERSION,
        valid_from,
        valid_to,
        &static_pubkey,
        authority,
        &mut rand::thread_rng(),
    )
}

// Template refresh pacing. The first call to trigger() fires immediately.
struct Timer {
    interval: Duration,
    last_triggered: Option<Instant>,
}

impl Timer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_triggered: None,
        }
    }

    fn trigger(&mut self) -> bool {
        let now = Instant::now();
        match self.last_triggered {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_triggered = Some(now);
                true
            }
        }
    }
}

// State owned by the sv2 handler thread.
struct Sv2Handler<C: ChainSource> {
    port: u16,
    protocol_version: u16,
    optional_features: u32,
    minimum_fee_delta: i64,
    chain: Arc<C>,
    interrupt: Arc<AtomicBool>,
    status: Arc<TpStatus>,
    static_key: SecretKey,
    certificate: SignatureNoiseMessage,
    listener: Option<TcpListener>,
    clients: Vec<Sv2Client>,
    block_cache: HashMap<u64, BlockTemplate>,
    template_id: u64,
    best_prev_hash: BlockHash,
    timer: Timer,
    template_last_update: u64,
}

impl<C: ChainSource> Sv2Handler<C> {
    fn run(&mut self) {
        while !self.interrupt.load(Ordering::SeqCst) {
            if self.chain.is_initial_block_download() {
                std::thread::sleep(IBD_POLL);
                continue;
            }

            // Once out of IBD, create the listening socket for new sv2
            // connections.
            if self.listener.is_none() {
                match bind_listener(self.port) {
                    Ok(listener) => {
                        info!("Template Provider listening on port: {}", self.port);
                        self.listener = Some(listener);
                    }
                    Err(e) => {
                        error!("sv2 thread shutting down, failed to bind: {}", e);
                        self.interrupt.store(true, Ordering::SeqCst);
                        continue;
                    }
                }
            }

            self.disconnect_flagged();

            let best_hash = self.chain.wait_best_block(BEST_BLOCK_WAIT);
            let best_block_changed = if best_hash != self.best_prev_hash {
                self.best_prev_hash = best_hash;
                true
            } else {
                false
            };

            let mempool_last_update = self.chain.transactions_updated();
            let mut should_make_template = false;

            if best_block_changed {
                // All previous work is invalid once the best block moves;
                // clear the cache and start fee tracking over.
                self.block_cache.clear();
                self.publish_cache_size();
                for client in self.clients.iter_mut() {
                    client.latest_submitted_template_fees = 0;
                }
                should_make_template = true;
                self.template_last_update = mempool_last_update;
            } else if self.timer.trigger() && mempool_last_update > self.template_last_update {
                should_make_template = true;
            }

            if should_make_template {
                for idx in 0..self.clients.len() {
                    // Newly connected clients get their first template when
                    // their CoinbaseOutputDataSize arrives.
                    if self.clients[idx].coinbase_tx_outputs_size == 0 {
                        continue;
                    }
                    if let Err(e) = self.send_work(idx, best_block_changed) {
                        error!("Error sending work to client: {}", e);
                        self.clients[idx].disconnect_flag = true;
                    }
                }
            }

            self.accept_pending_client();
            self.service_clients();
            self.publish_client_counts();
        }

        // Teardown: drop every client, closing its socket.
        for client in self.clients.iter_mut() {
            client.disconnect_flag = true;
        }
        self.disconnect_flagged();
        self.publish_client_counts();
    }

    fn disconnect_flagged(&mut self) {
        self.clients.retain(|client| !client.disconnect_flag);
    }

    fn accept_pending_client(&mut self) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    error!("Failed to make client socket non-blocking: {}", e);
                    return;
                }
                debug!("New client connection from {}", addr);
                let session = NoiseSession::new_responder(self.static_key, self.certificate.clone());
                self.clients.push(Sv2Client::new(stream, addr, session));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => error!("Failed to accept client connection: {}", e),
        }
    }

    fn service_clients(&mut self) {
        for idx in 0..self.clients.len() {
            let mut buf = [0u8; 0x10000];
            let read = self.clients[idx].stream.read(&mut buf);
            match read {
                Ok(0) => self.clients[idx].disconnect_flag = true,
                Ok(received) => {
                    trace!("Num bytes received: {}", received);
                    self.clients[idx].inbound.extend_from_slice(&buf[..received]);
                    if let Err(e) = self.process_client_bytes(idx) {
                        error!("Received error when processing client message: {}", e);
                        self.clients[idx].disconnect_flag = true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                }
                Err(e) => {
                    debug!("Client read error: {}", e);
                    self.clients[idx].disconnect_flag = true;
                }
            }
        }
    }

    fn process_client_bytes(&mut self, idx: usize) -> TpResult<()> {
        let msgs = {
            let client = &mut self.clients[idx];

            if !client.session.handshake_complete() {
                if client.inbound.len() < tp_noise::RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE {
                    return Ok(());
                }
                let mut msg_e: Vec<u8> = client
                    .inbound
                    .drain(..tp_noise::RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE)
                    .collect();
                client.session.process_maybe_handshake(&mut msg_e, false)?;

                trace!("Send noise handshake reply: ES");
                let mut msg_es = vec![0u8; INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
                client.session.process_maybe_handshake(&mut msg_es, true)?;
                client.send_buf(&msg_es)?;
            }

            if client.session.handshake_complete() {
                client.read_frames()?
            } else {
                Vec::new()
            }
        };

        for msg in &msgs {
            if self.clients[idx].disconnect_flag {
                break;
            }
            self.process_sv2_message(idx, msg)?;
        }
        Ok(())
    }

    fn publish_cache_size(&self) {
        self.status
            .cached_templates
            .store(self.block_cache.len(), Ordering::SeqCst);
    }

    fn publish_client_counts(&self) {
        let connected = self
            .clients
            .iter()
            .filter(|client| client.session.handshake_complete())
            .count();
        let fully_connected = self
            .clients
            .iter()
            .filter(|client| client.is_fully_connected())
            .count();
        self.status
            .connected_clients
            .store(connected, Ordering::SeqCst);
        self.status
            .fully_connected_clients
            .store(fully_connected, Ordering::SeqCst);
    }
}

fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
