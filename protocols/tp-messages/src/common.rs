use crate::{
    error::Result,
    parser::{put_str0255, put_u16, put_u32, Reader},
    Sv2Message, MESSAGE_TYPE_SETUP_CONNECTION, MESSAGE_TYPE_SETUP_CONNECTION_ERROR,
    MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS,
};

/// First message sent by a client on a freshly established connection,
/// after the Noise handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnection {
    /// Subprotocol the client wants to speak; the Template Provider only
    /// accepts [`crate::TP_SUBPROTOCOL`].
    pub protocol: u8,
    /// The minimum protocol version supported.
    pub min_version: u16,
    /// The maximum protocol version supported.
    pub max_version: u16,
    /// Flags indicating optional protocol features the client supports.
    pub flags: u32,
    /// ASCII hostname or IP the client used to reach this endpoint.
    pub endpoint_host: String,
    pub endpoint_port: u16,
    /// Device vendor name.
    pub vendor: String,
    /// Device hardware version.
    pub hardware_version: String,
    /// Device firmware version.
    pub firmware: String,
    /// Device identifier; empty when the client withholds telemetry.
    pub device_id: String,
}

impl Sv2Message for SetupConnection {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_SETUP_CONNECTION;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.protocol);
        put_u16(out, self.min_version);
        put_u16(out, self.max_version);
        put_u32(out, self.flags);
        put_str0255(out, &self.endpoint_host)?;
        put_u16(out, self.endpoint_port);
        put_str0255(out, &self.vendor)?;
        put_str0255(out, &self.hardware_version)?;
        put_str0255(out, &self.firmware)?;
        put_str0255(out, &self.device_id)?;
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            protocol: reader.read_u8()?,
            min_version: reader.read_u16()?,
            max_version: reader.read_u16()?,
            flags: reader.read_u32()?,
            endpoint_host: reader.read_str0255()?,
            endpoint_port: reader.read_u16()?,
            vendor: reader.read_str0255()?,
            hardware_version: reader.read_str0255()?,
            firmware: reader.read_str0255()?,
            device_id: reader.read_str0255()?,
        })
    }
}

/// Accepts a [`SetupConnection`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupConnectionSuccess {
    /// Protocol version the server settled on.
    pub used_version: u16,
    /// Optional feature flags the server enables.
    pub flags: u32,
}

impl Sv2Message for SetupConnectionSuccess {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u16(out, self.used_version);
        put_u32(out, self.flags);
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            used_version: reader.read_u16()?,
            flags: reader.read_u32()?,
        })
    }
}

/// Rejects a [`SetupConnection`] request; the connection is closed after
/// sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnectionError {
    /// Flags the server could not satisfy.
    pub flags: u32,
    /// Machine-readable reason, e.g. `unsupported-protocol` or
    /// `protocol-version-mismatch`.
    pub error_code: String,
}

impl Sv2Message for SetupConnectionError {
    const MESSAGE_TYPE: u8 = MESSAGE_TYPE_SETUP_CONNECTION_ERROR;

    fn serialize_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        put_u32(out, self.flags);
        put_str0255(out, &self.error_code)?;
        Ok(())
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        Ok(Self {
            flags: reader.read_u32()?,
            error_code: reader.read_str0255()?,
        })
    }
}
