//! ## Downstream Client
//!
//! Per-connection state: the socket, the Noise responder session, the
//! inbound byte buffer and the protocol flags the message handler drives.
//! Also implements the framed encrypted send and receive paths: every sv2
//! message on the wire is a 22-byte encrypted header followed by the
//! chunk-encrypted payload.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tp_messages::{Sv2Message, Sv2NetHeader, Sv2NetMsg, SV2_HEADER_ENCRYPTED_SIZE};
use tp_noise::NoiseSession;
use tracing::trace;

use crate::error::TpResult;

/// A connected sv2 client.
pub struct Sv2Client {
    pub(crate) stream: TcpStream,
    pub(crate) addr: SocketAddr,
    pub(crate) session: NoiseSession,
    // Bytes received but not yet consumed by the handshake or frame decoder.
    pub(crate) inbound: Vec<u8>,
    // Header already decrypted while its payload is still in flight. The
    // decrypt of a header consumes a nonce, so it must not be retried.
    pub(crate) pending_header: Option<Sv2NetHeader>,
    pub(crate) setup_connection_confirmed: bool,
    pub(crate) coinbase_output_data_size_recv: bool,
    pub(crate) coinbase_tx_outputs_size: u32,
    pub(crate) latest_submitted_template_fees: i64,
    pub(crate) disconnect_flag: bool,
}

impl Sv2Client {
    pub(crate) fn new(stream: TcpStream, addr: SocketAddr, session: NoiseSession) -> Self {
        Self {
            stream,
            addr,
            session,
            inbound: Vec::new(),
            pending_header: None,
            setup_connection_confirmed: false,
            coinbase_output_data_size_recv: false,
            coinbase_tx_outputs_size: 0,
            latest_submitted_template_fees: 0,
            disconnect_flag: false,
        }
    }

    pub(crate) fn is_fully_connected(&self) -> bool {
        self.setup_connection_confirmed && self.coinbase_output_data_size_recv
    }

    /// Encrypts and sends a typed message as a header frame plus a payload
    /// frame.
    pub(crate) fn send_message<M: Sv2Message>(&mut self, msg: &M) -> TpResult<()> {
        let net_msg = Sv2NetMsg::from_message(msg)?;
        let mut buffer = Vec::with_capacity(
            SV2_HEADER_ENCRYPTED_SIZE
                + NoiseSession::encrypted_message_size(net_msg.payload.len()),
        );
        self.session
            .encrypt_message(&net_msg.header.serialize(), &mut buffer)?;
        self.session.encrypt_message(&net_msg.payload, &mut buffer)?;
        self.send_buf(&buffer)
    }

    /// Writes the whole buffer, sleeping briefly when the socket is not
    /// ready; a hard I/O error is returned to the caller, which flags the
    /// client for disconnection.
    pub(crate) fn send_buf(&mut self, buf: &[u8]) -> TpResult<()> {
        trace!("Send {} bytes to {}", buf.len(), self.addr);
        let mut total_sent = 0;
        while total_sent < buf.len() {
            match self.stream.write(&buf[total_sent..]) {
                Ok(0) => std::thread::sleep(Duration::from_millis(10)),
                Ok(sent) => total_sent += sent,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Decodes as many complete frames as the inbound buffer holds. Each
    /// frame costs two decrypts (header, then payload); a partially
    /// received frame keeps its decrypted header parked until the payload
    /// arrives.
    pub(crate) fn read_frames(&mut self) -> TpResult<Vec<Sv2NetMsg>> {
        let mut msgs = Vec::new();
        loop {
            let header = match self.pending_header {
                Some(header) => header,
                None => {
                    if self.inbound.len() < SV2_HEADER_ENCRYPTED_SIZE {
                        break;
                    }
                    let mut encrypted: Vec<u8> =
                        self.inbound.drain(..SV2_HEADER_ENCRYPTED_SIZE).collect();
                    self.session.decrypt_message(&mut encrypted)?;
                    let header = Sv2NetHeader::from_bytes(&encrypted)?;
                    self.pending_header = Some(header);
                    header
                }
            };

            let expanded_size = NoiseSession::encrypted_message_size(header.msg_length as usize);
            if self.inbound.len() < expanded_size {
                break;
            }
            let mut payload: Vec<u8> = self.inbound.drain(..expanded_size).collect();
            self.session.decrypt_message(&mut payload)?;
            self.pending_header = None;
            msgs.push(Sv2NetMsg { header, payload });
        }
        Ok(msgs)
    }
}

impl std::fmt::Debug for Sv2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sv2Client")
            .field("addr", &self.addr)
            .field("setup_connection_confirmed", &self.setup_connection_confirmed)
            .field(
                "coinbase_output_data_size_recv",
                &self.coinbase_output_data_size_recv,
            )
            .field("disconnect_flag", &self.disconnect_flag)
            .finish()
    }
}
