// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameter codec.
//!
//! Parameters travel inside a TLS extension as a sequence of
//! `id (varint) | length (varint) | value` entries. The TLS collaborator
//! hands the raw extension bytes to the transport, which parses and
//! validates them here.

use crate::{
    cid::{ConnectionId, StatelessResetToken, STATELESS_RESET_TOKEN_LEN},
    transport::error::TransportError,
};
use bytes::Bytes;
use skein_codec::Buffer;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
mod id {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const PREFERRED_ADDRESS: u64 = 0x0d;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
    pub const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
    // RFC 9221
    pub const MAX_DATAGRAM_FRAME_SIZE: u64 = 0x20;
}

pub const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;
pub const DEFAULT_MAX_ACK_DELAY_MS: u64 = 25;
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds; 0 disables the peer's idle timeout.
    pub max_idle_timeout: Option<u64>,
    pub stateless_reset_token: Option<StatelessResetToken>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    /// Milliseconds.
    pub max_ack_delay: Option<u64>,
    pub disable_active_migration: bool,
    /// Stored opaquely; the core does not use preferred addresses.
    pub preferred_address: Option<Bytes>,
    pub active_connection_id_limit: Option<u64>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    pub max_datagram_frame_size: Option<u64>,
}

impl TransportParameters {
    pub fn ack_delay_exponent(&self) -> u64 {
        self.ack_delay_exponent.unwrap_or(DEFAULT_ACK_DELAY_EXPONENT)
    }

    pub fn max_ack_delay_ms(&self) -> u64 {
        self.max_ack_delay.unwrap_or(DEFAULT_MAX_ACK_DELAY_MS)
    }

    /// Serializes the parameters. Entries with `None` values are omitted.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Buffer::new(512);

        let put_varint_param = |buf: &mut Buffer, id: u64, value: u64| {
            buf.put_var(id).unwrap();
            buf.put_var(skein_codec::size_varint(value) as u64).unwrap();
            buf.put_var(value).unwrap();
        };
        let put_bytes_param = |buf: &mut Buffer, id: u64, value: &[u8]| {
            buf.put_var(id).unwrap();
            buf.put_var_bytes(value).unwrap();
        };

        if let Some(cid) = &self.original_destination_connection_id {
            put_bytes_param(&mut buf, id::ORIGINAL_DESTINATION_CONNECTION_ID, cid.as_ref());
        }
        if let Some(value) = self.max_idle_timeout {
            put_varint_param(&mut buf, id::MAX_IDLE_TIMEOUT, value);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_bytes_param(&mut buf, id::STATELESS_RESET_TOKEN, token);
        }
        if let Some(value) = self.max_udp_payload_size {
            put_varint_param(&mut buf, id::MAX_UDP_PAYLOAD_SIZE, value);
        }
        if let Some(value) = self.initial_max_data {
            put_varint_param(&mut buf, id::INITIAL_MAX_DATA, value);
        }
        if let Some(value) = self.initial_max_stream_data_bidi_local {
            put_varint_param(&mut buf, id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, value);
        }
        if let Some(value) = self.initial_max_stream_data_bidi_remote {
            put_varint_param(&mut buf, id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, value);
        }
        if let Some(value) = self.initial_max_stream_data_uni {
            put_varint_param(&mut buf, id::INITIAL_MAX_STREAM_DATA_UNI, value);
        }
        if let Some(value) = self.initial_max_streams_bidi {
            put_varint_param(&mut buf, id::INITIAL_MAX_STREAMS_BIDI, value);
        }
        if let Some(value) = self.initial_max_streams_uni {
            put_varint_param(&mut buf, id::INITIAL_MAX_STREAMS_UNI, value);
        }
        if let Some(value) = self.ack_delay_exponent {
            put_varint_param(&mut buf, id::ACK_DELAY_EXPONENT, value);
        }
        if let Some(value) = self.max_ack_delay {
            put_varint_param(&mut buf, id::MAX_ACK_DELAY, value);
        }
        if self.disable_active_migration {
            buf.put_var(id::DISABLE_ACTIVE_MIGRATION).unwrap();
            buf.put_var(0).unwrap();
        }
        if let Some(value) = &self.preferred_address {
            put_bytes_param(&mut buf, id::PREFERRED_ADDRESS, value);
        }
        if let Some(value) = self.active_connection_id_limit {
            put_varint_param(&mut buf, id::ACTIVE_CONNECTION_ID_LIMIT, value);
        }
        if let Some(cid) = &self.initial_source_connection_id {
            put_bytes_param(&mut buf, id::INITIAL_SOURCE_CONNECTION_ID, cid.as_ref());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_bytes_param(&mut buf, id::RETRY_SOURCE_CONNECTION_ID, cid.as_ref());
        }
        if let Some(value) = self.max_datagram_frame_size {
            put_varint_param(&mut buf, id::MAX_DATAGRAM_FRAME_SIZE, value);
        }

        buf.data().to_vec()
    }

    /// Parses and validates a transport parameter extension.
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        const ERROR: TransportError = TransportError::TRANSPORT_PARAMETER_ERROR;

        let mut buf = Buffer::from_slice(data);
        let mut params = Self::default();
        let mut seen = Vec::new();

        while !buf.is_at_end() {
            let param_id = buf.get_var().map_err(|_| ERROR)?;
            let value = buf.get_var_bytes().map_err(|_| ERROR)?.to_vec();

            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
            //# An endpoint SHOULD treat receipt of duplicate transport
            //# parameters as a connection error of type
            //# TRANSPORT_PARAMETER_ERROR.
            if seen.contains(&param_id) {
                return Err(ERROR.with_reason("duplicate transport parameter"));
            }
            seen.push(param_id);

            fn varint_value(value: &[u8]) -> Result<u64, TransportError> {
                const ERROR: TransportError = TransportError::TRANSPORT_PARAMETER_ERROR;
                let mut value_buf = Buffer::from_slice(value);
                let decoded = value_buf.get_var().map_err(|_| ERROR)?;
                if !value_buf.is_at_end() {
                    return Err(ERROR.with_reason("trailing bytes in transport parameter"));
                }
                Ok(decoded)
            }
            fn cid_value(value: &[u8]) -> Result<ConnectionId, TransportError> {
                ConnectionId::try_from_slice(value).map_err(|_| {
                    TransportError::TRANSPORT_PARAMETER_ERROR.with_reason("oversized connection id")
                })
            }

            match param_id {
                id::ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(cid_value(&value)?);
                }
                id::MAX_IDLE_TIMEOUT => params.max_idle_timeout = Some(varint_value(&value)?),
                id::STATELESS_RESET_TOKEN => {
                    let token: StatelessResetToken = value
                        .as_slice()
                        .try_into()
                        .map_err(|_| ERROR.with_reason("malformed stateless reset token"))?;
                    debug_assert_eq!(token.len(), STATELESS_RESET_TOKEN_LEN);
                    params.stateless_reset_token = Some(token);
                }
                id::MAX_UDP_PAYLOAD_SIZE => {
                    let value = varint_value(&value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values below 1200 are invalid.
                    if value < 1200 {
                        return Err(ERROR.with_reason("max_udp_payload_size below 1200"));
                    }
                    params.max_udp_payload_size = Some(value);
                }
                id::INITIAL_MAX_DATA => params.initial_max_data = Some(varint_value(&value)?),
                id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = Some(varint_value(&value)?);
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = Some(varint_value(&value)?);
                }
                id::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = Some(varint_value(&value)?);
                }
                id::INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = Some(varint_value(&value)?);
                }
                id::INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = Some(varint_value(&value)?);
                }
                id::ACK_DELAY_EXPONENT => {
                    let value = varint_value(&value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values above 20 are invalid.
                    if value > 20 {
                        return Err(ERROR.with_reason("ack_delay_exponent above 20"));
                    }
                    params.ack_delay_exponent = Some(value);
                }
                id::MAX_ACK_DELAY => {
                    let value = varint_value(&value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values of 2^14 or greater are invalid.
                    if value >= 1 << 14 {
                        return Err(ERROR.with_reason("max_ack_delay out of range"));
                    }
                    params.max_ack_delay = Some(value);
                }
                id::DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(ERROR.with_reason("disable_active_migration carries a value"));
                    }
                    params.disable_active_migration = true;
                }
                id::PREFERRED_ADDRESS => {
                    params.preferred_address = Some(Bytes::from(value));
                }
                id::ACTIVE_CONNECTION_ID_LIMIT => {
                    let value = varint_value(&value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# The value of the active_connection_id_limit parameter MUST
                    //# be at least 2.
                    if value < 2 {
                        return Err(ERROR.with_reason("active_connection_id_limit below 2"));
                    }
                    params.active_connection_id_limit = Some(value);
                }
                id::INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(cid_value(&value)?);
                }
                id::RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(cid_value(&value)?);
                }
                id::MAX_DATAGRAM_FRAME_SIZE => {
                    params.max_datagram_frame_size = Some(varint_value(&value)?);
                }
                //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                //# An endpoint MUST ignore transport parameters that it does
                //# not support.
                _ => {}
            }
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let params = TransportParameters {
            original_destination_connection_id: Some(
                ConnectionId::try_from_slice(&[1, 2, 3, 4]).unwrap(),
            ),
            max_idle_timeout: Some(60_000),
            max_udp_payload_size: Some(1452),
            initial_max_data: Some(1 << 20),
            initial_max_stream_data_bidi_local: Some(1 << 20),
            initial_max_stream_data_bidi_remote: Some(1 << 20),
            initial_max_stream_data_uni: Some(1 << 20),
            initial_max_streams_bidi: Some(128),
            initial_max_streams_uni: Some(128),
            ack_delay_exponent: Some(3),
            max_ack_delay: Some(25),
            disable_active_migration: true,
            active_connection_id_limit: Some(8),
            initial_source_connection_id: Some(ConnectionId::try_from_slice(&[9]).unwrap()),
            max_datagram_frame_size: Some(65_536),
            ..Default::default()
        };
        let encoded = params.encode();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert_eq!(params, decoded);
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        let mut buf = Buffer::new(32);
        buf.put_var(0x7f).unwrap();
        buf.put_var_bytes(b"xyz").unwrap();
        buf.put_var(super::id::INITIAL_MAX_DATA).unwrap();
        buf.put_var(1).unwrap();
        buf.put_var(42).unwrap();
        let decoded = TransportParameters::decode(buf.data()).unwrap();
        assert_eq!(decoded.initial_max_data, Some(42));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut buf = Buffer::new(32);
        for _ in 0..2 {
            buf.put_var(super::id::INITIAL_MAX_DATA).unwrap();
            buf.put_var(1).unwrap();
            buf.put_var(42).unwrap();
        }
        let error = TransportParameters::decode(buf.data()).unwrap_err();
        assert_eq!(error.code, TransportError::TRANSPORT_PARAMETER_ERROR.code);
    }

    #[test]
    fn range_validation() {
        let mut buf = Buffer::new(32);
        buf.put_var(super::id::ACK_DELAY_EXPONENT).unwrap();
        buf.put_var(1).unwrap();
        buf.put_var(21).unwrap();
        assert!(TransportParameters::decode(buf.data()).is_err());

        let mut buf = Buffer::new(32);
        buf.put_var(super::id::MAX_UDP_PAYLOAD_SIZE).unwrap();
        buf.put_var(2).unwrap();
        buf.put_var(1199).unwrap();
        assert!(TransportParameters::decode(buf.data()).is_err());
    }
}
