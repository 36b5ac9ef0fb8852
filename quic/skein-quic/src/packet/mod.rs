// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet header parsing and emission.
//!
//! Long headers carry version, connection IDs, (for Initial) a token and an
//! explicit length; short headers carry the spin bit, key phase and a
//! destination connection ID whose length is known only to the endpoint that
//! issued it. Packet numbers appear truncated on the wire and are
//! reconstructed against the largest acknowledged number in their space.

use crate::cid::{ConnectionId, MAX_CID_LEN};
use bytes::Bytes;
use skein_codec::{size_varint, Buffer, BufferError};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1, unless the
//#    packet is a Version Negotiation packet.
pub const PACKET_FIXED_BIT: u8 = 0x40;

const PACKET_LONG_HEADER: u8 = 0x80;
const PACKET_SPIN_BIT: u8 = 0x20;

/// Largest truncated packet-number encoding accepted on parse.
pub const PACKET_NUMBER_MAX_SIZE: usize = 4;
/// Emission always uses a 2-byte truncated packet number.
pub const PACKET_NUMBER_SEND_SIZE: usize = 2;
/// Emission always writes the long-header Length field as a 2-byte varint.
pub const PACKET_LENGTH_SEND_SIZE: usize = 2;

/// Retry packets end in a 16-byte integrity tag.
pub const RETRY_INTEGRITY_TAG_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    OneRtt,
}

impl PacketType {
    pub fn is_long_header(self) -> bool {
        !matches!(self, Self::OneRtt)
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Packet Type:  The next two bits (those with a mask of 0x30) of
//#    byte 0 contain a packet type.
const fn long_type_bits(packet_type: PacketType) -> u8 {
    match packet_type {
        PacketType::Initial => 0,
        PacketType::ZeroRtt => 1,
        PacketType::Handshake => 2,
        PacketType::Retry => 3,
        // not long header types
        PacketType::VersionNegotiation | PacketType::OneRtt => 0,
    }
}

fn long_type_from_bits(bits: u8) -> PacketType {
    match bits & 0b11 {
        0 => PacketType::Initial,
        1 => PacketType::ZeroRtt,
        2 => PacketType::Handshake,
        _ => PacketType::Retry,
    }
}

/// Builds the first byte of a long header.
///
/// `pn_size_bits` is the encoded packet-number length minus one.
pub const fn encode_long_header_first_byte(packet_type: PacketType, pn_size_bits: u8) -> u8 {
    PACKET_LONG_HEADER | PACKET_FIXED_BIT | (long_type_bits(packet_type) << 4) | pn_size_bits
}

/// Errors local to header parsing; the datagram is dropped, never surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderError {
    Truncated,
    FixedBitZero,
    CidTooLong,
}

impl From<BufferError> for HeaderError {
    fn from(_: BufferError) -> Self {
        Self::Truncated
    }
}

/// A parsed header, up to but excluding the protected packet-number field.
#[derive(Clone, Debug)]
pub struct Header {
    pub packet_type: PacketType,
    /// Zero for short-header packets.
    pub version: u32,
    pub destination_cid: ConnectionId,
    pub source_cid: ConnectionId,
    /// Initial only.
    pub token: Bytes,
    /// Retry only.
    pub integrity_tag: [u8; RETRY_INTEGRITY_TAG_SIZE],
    /// Version Negotiation only.
    pub supported_versions: Vec<u32>,
    /// Offset of the first protected byte (the truncated packet number).
    pub pn_offset: usize,
    /// Number of bytes covered by this packet starting at `pn_offset`
    /// (truncated packet number, payload and AEAD tag).
    pub rest_length: usize,
}

impl Header {
    pub fn is_long_header(&self) -> bool {
        self.packet_type.is_long_header()
    }
}

fn pull_cid(buf: &mut Buffer) -> Result<ConnectionId, HeaderError> {
    let len = buf.get_u8()? as usize;
    if len > MAX_CID_LEN {
        return Err(HeaderError::CidTooLong);
    }
    let bytes = buf.get_bytes(len)?;
    ConnectionId::try_from_slice(bytes).map_err(|_| HeaderError::CidTooLong)
}

/// Parses the next packet header from `buf`.
///
/// `host_cid_length` is the length of connection IDs this endpoint issues;
/// it bounds the destination CID of short-header packets. On return the
/// cursor sits at `pn_offset` for protected packets, or at the end of the
/// packet for Retry and Version Negotiation.
pub fn pull_header(buf: &mut Buffer, host_cid_length: usize) -> Result<Header, HeaderError> {
    let first_byte = buf.get_u8()?;

    if first_byte & PACKET_LONG_HEADER != 0 {
        let version = buf.get_u32()?;
        let destination_cid = pull_cid(buf)?;
        let source_cid = pull_cid(buf)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
        //# A Version Negotiation packet is inherently not version specific.
        //# Upon receipt by a client, it will be identified as a Version
        //# Negotiation packet based on the Version field having a value of 0.
        if version == 0 {
            let mut supported_versions = Vec::new();
            while !buf.is_at_end() {
                supported_versions.push(buf.get_u32()?);
            }
            return Ok(Header {
                packet_type: PacketType::VersionNegotiation,
                version,
                destination_cid,
                source_cid,
                token: Bytes::new(),
                integrity_tag: [0; RETRY_INTEGRITY_TAG_SIZE],
                supported_versions,
                pn_offset: buf.tell(),
                rest_length: 0,
            });
        }

        if first_byte & PACKET_FIXED_BIT == 0 {
            return Err(HeaderError::FixedBitZero);
        }

        let packet_type = long_type_from_bits(first_byte >> 4);

        match packet_type {
            PacketType::Retry => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5
                //# A Retry packet carries a token and an integrity tag; it has
                //# no packet number and is not encrypted.
                let token_length = buf
                    .remaining()
                    .checked_sub(RETRY_INTEGRITY_TAG_SIZE)
                    .ok_or(HeaderError::Truncated)?;
                let token = Bytes::copy_from_slice(buf.get_bytes(token_length)?);
                let mut integrity_tag = [0; RETRY_INTEGRITY_TAG_SIZE];
                integrity_tag.copy_from_slice(buf.get_bytes(RETRY_INTEGRITY_TAG_SIZE)?);
                Ok(Header {
                    packet_type,
                    version,
                    destination_cid,
                    source_cid,
                    token,
                    integrity_tag,
                    supported_versions: Vec::new(),
                    pn_offset: buf.tell(),
                    rest_length: 0,
                })
            }
            _ => {
                let token = if matches!(packet_type, PacketType::Initial) {
                    Bytes::copy_from_slice(buf.get_var_bytes()?)
                } else {
                    Bytes::new()
                };
                let rest_length = buf.get_var()? as usize;
                if rest_length > buf.remaining() {
                    return Err(HeaderError::Truncated);
                }
                Ok(Header {
                    packet_type,
                    version,
                    destination_cid,
                    source_cid,
                    token,
                    integrity_tag: [0; RETRY_INTEGRITY_TAG_SIZE],
                    supported_versions: Vec::new(),
                    pn_offset: buf.tell(),
                    rest_length,
                })
            }
        }
    } else {
        if first_byte & PACKET_FIXED_BIT == 0 {
            return Err(HeaderError::FixedBitZero);
        }
        let destination_cid = ConnectionId::try_from_slice(buf.get_bytes(host_cid_length)?)
            .map_err(|_| HeaderError::CidTooLong)?;
        Ok(Header {
            packet_type: PacketType::OneRtt,
            version: 0,
            destination_cid,
            source_cid: ConnectionId::EMPTY,
            token: Bytes::new(),
            integrity_tag: [0; RETRY_INTEGRITY_TAG_SIZE],
            supported_versions: Vec::new(),
            pn_offset: buf.tell(),
            rest_length: buf.remaining(),
        })
    }
}

/// Reads the spin bit of a short-header first byte.
pub fn spin_bit(first_byte: u8) -> bool {
    first_byte & PACKET_SPIN_BIT != 0
}

//= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
//# DecodePacketNumber(largest_pn, truncated_pn, pn_nbits):
//#    expected_pn  = largest_pn + 1
//#    pn_win       = 1 << pn_nbits
//#    pn_hwin      = pn_win / 2
//#    pn_mask      = pn_win - 1
/// Reconstructs a full packet number from its truncated encoding.
///
/// `expected` is one more than the largest packet number processed so far in
/// the same space.
pub fn decode_packet_number(truncated: u64, pn_size: usize, expected: u64) -> u64 {
    debug_assert!((1..=PACKET_NUMBER_MAX_SIZE).contains(&pn_size));
    let pn_nbits = (pn_size * 8) as u32;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //# if candidate_pn <= expected_pn - pn_hwin and
    //#    candidate_pn < (1 << 62) - pn_win:
    //#    return candidate_pn + pn_win
    //# if candidate_pn > expected_pn + pn_hwin and
    //#    candidate_pn >= pn_win:
    //#    return candidate_pn - pn_win
    //# return candidate_pn
    let candidate = (expected & !pn_mask) | truncated;
    if candidate <= expected.wrapping_sub(pn_hwin)
        && expected >= pn_hwin
        && candidate < (1u64 << 62) - pn_win
    {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

/// Size of a long header for the given connection IDs and token, using the
/// fixed 2-byte length and packet-number encodings.
pub fn long_header_size(
    packet_type: PacketType,
    destination_cid: &ConnectionId,
    source_cid: &ConnectionId,
    token: &[u8],
) -> usize {
    // first byte + version + 2 CID length bytes + length + packet number
    let mut size = 11 + destination_cid.len() + source_cid.len();
    if matches!(packet_type, PacketType::Initial) {
        size += size_varint(token.len() as u64) + token.len();
    }
    size
}

/// Size of a short header: first byte + DCID + packet number.
pub fn short_header_size(destination_cid: &ConnectionId) -> usize {
    3 + destination_cid.len()
}

/// Composes a Version Negotiation packet. Sent by servers in response to a
/// datagram carrying an unsupported version.
pub fn encode_version_negotiation(
    destination_cid: &ConnectionId,
    source_cid: &ConnectionId,
    supported_versions: &[u32],
    random_first_byte: u8,
) -> Vec<u8> {
    let mut buf = Buffer::new(
        7 + destination_cid.len() + source_cid.len() + 4 * supported_versions.len(),
    );
    // the fixed bit is unset and the remaining bits are unused; randomizing
    // them resists ossification
    let first = PACKET_LONG_HEADER | (random_first_byte & !PACKET_FIXED_BIT);
    buf.put_u8(first).unwrap();
    buf.put_u32(0).unwrap();
    buf.put_u8(destination_cid.len() as u8).unwrap();
    buf.put_bytes(destination_cid.as_ref()).unwrap();
    buf.put_u8(source_cid.len() as u8).unwrap();
    buf.put_bytes(source_cid.as_ref()).unwrap();
    for version in supported_versions {
        buf.put_u32(*version).unwrap();
    }
    buf.data().to_vec()
}

/// Composes a Retry packet body. The integrity tag is produced by the
/// caller's crypto collaborator over the pseudo-packet
/// ([`retry_pseudo_packet`]) and appended here.
pub fn encode_retry(
    version: u32,
    destination_cid: &ConnectionId,
    source_cid: &ConnectionId,
    token: &[u8],
    integrity_tag: &[u8; RETRY_INTEGRITY_TAG_SIZE],
) -> Vec<u8> {
    let mut buf = Buffer::new(
        7 + destination_cid.len() + source_cid.len() + token.len() + RETRY_INTEGRITY_TAG_SIZE,
    );
    buf.put_u8(encode_long_header_first_byte(PacketType::Retry, 0))
        .unwrap();
    buf.put_u32(version).unwrap();
    buf.put_u8(destination_cid.len() as u8).unwrap();
    buf.put_bytes(destination_cid.as_ref()).unwrap();
    buf.put_u8(source_cid.len() as u8).unwrap();
    buf.put_bytes(source_cid.as_ref()).unwrap();
    buf.put_bytes(token).unwrap();
    buf.put_bytes(integrity_tag).unwrap();
    buf.data().to_vec()
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The Retry Pseudo-Packet is computed by taking the transmitted Retry
//# packet, removing the Retry Integrity Tag, and prepending the two
//# following fields: ODCID Length, Original Destination Connection ID.
pub fn retry_pseudo_packet(
    original_destination_cid: &ConnectionId,
    retry_packet_without_tag: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + original_destination_cid.len() + retry_packet_without_tag.len());
    out.push(original_destination_cid.len() as u8);
    out.extend_from_slice(original_destination_cid.as_ref());
    out.extend_from_slice(retry_packet_without_tag);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_slice(bytes).unwrap()
    }

    #[test]
    fn long_header_round_trip() {
        // compose an Initial header by hand the way the builder does
        let dcid = cid(&[0xaa; 8]);
        let scid = cid(&[0xbb; 5]);
        let token = b"tok";
        let mut buf = Buffer::new(64);
        buf.put_u8(encode_long_header_first_byte(
            PacketType::Initial,
            (PACKET_NUMBER_SEND_SIZE - 1) as u8,
        ))
        .unwrap();
        buf.put_u32(1).unwrap();
        buf.put_u8(8).unwrap();
        buf.put_bytes(dcid.as_ref()).unwrap();
        buf.put_u8(5).unwrap();
        buf.put_bytes(scid.as_ref()).unwrap();
        buf.put_var_bytes(token).unwrap();
        buf.put_u16(20 | 0x4000).unwrap();
        buf.put_u16(0x0001).unwrap();
        buf.put_zeroes(18).unwrap();
        let written = buf.data().to_vec();

        let mut parse = Buffer::from_slice(&written);
        let header = pull_header(&mut parse, 8).unwrap();
        assert_eq!(header.packet_type, PacketType::Initial);
        assert_eq!(header.version, 1);
        assert_eq!(header.destination_cid, dcid);
        assert_eq!(header.source_cid, scid);
        assert_eq!(&header.token[..], token);
        assert_eq!(header.rest_length, 20);
        assert_eq!(header.pn_offset, written.len() - 20);

        assert_eq!(
            long_header_size(PacketType::Initial, &dcid, &scid, token),
            header.pn_offset
        );
    }

    #[test]
    fn short_header_round_trip() {
        let dcid = cid(&[0xcc; 8]);
        let mut buf = Buffer::new(32);
        buf.put_u8(PACKET_FIXED_BIT | (PACKET_NUMBER_SEND_SIZE - 1) as u8)
            .unwrap();
        buf.put_bytes(dcid.as_ref()).unwrap();
        buf.put_u16(0x1234).unwrap();
        buf.put_zeroes(10).unwrap();
        let written = buf.data().to_vec();

        let mut parse = Buffer::from_slice(&written);
        let header = pull_header(&mut parse, 8).unwrap();
        assert_eq!(header.packet_type, PacketType::OneRtt);
        assert_eq!(header.destination_cid, dcid);
        assert_eq!(header.pn_offset, 9);
        assert_eq!(header.rest_length, 12);
        assert_eq!(short_header_size(&dcid), 11);
    }

    #[test]
    fn fixed_bit_must_be_set() {
        let mut parse = Buffer::from_slice(&[0x00u8; 11]);
        assert!(matches!(
            pull_header(&mut parse, 8),
            Err(HeaderError::FixedBitZero)
        ));
    }

    #[test]
    fn version_negotiation_parse() {
        let packet = encode_version_negotiation(&cid(&[1, 2]), &cid(&[3, 4]), &[0x1a2a_3a4a, 1], 0x5f);
        let mut parse = Buffer::from_slice(&packet);
        let header = pull_header(&mut parse, 8).unwrap();
        assert_eq!(header.packet_type, PacketType::VersionNegotiation);
        assert_eq!(header.supported_versions, vec![0x1a2a_3a4a, 1]);
    }

    #[test]
    fn retry_parse() {
        let tag = [7u8; RETRY_INTEGRITY_TAG_SIZE];
        let packet = encode_retry(1, &cid(&[1, 2]), &cid(&[9, 9, 9]), b"new-token", &tag);
        let mut parse = Buffer::from_slice(&packet);
        let header = pull_header(&mut parse, 8).unwrap();
        assert_eq!(header.packet_type, PacketType::Retry);
        assert_eq!(&header.token[..], b"new-token");
        assert_eq!(header.integrity_tag, tag);
        assert_eq!(header.source_cid, cid(&[9, 9, 9]));
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# For example, if the highest successfully authenticated packet had a
    //# packet number of 0xa82f30ea, then a packet containing a 16-bit value
    //# of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn packet_number_decoding() {
        assert_eq!(
            decode_packet_number(0x9b32, 2, 0xa82f_30ea + 1),
            0xa82f_9b32
        );
        // wrap upward across the truncation window
        assert_eq!(decode_packet_number(0x0000, 2, 0xffff), 0x1_0000);
        // small numbers decode as themselves
        assert_eq!(decode_packet_number(0x05, 1, 0), 0x05);
        assert_eq!(decode_packet_number(0x05, 1, 6), 0x05);
    }
}
