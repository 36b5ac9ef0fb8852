// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet protection plumbing.
//!
//! AEAD and header-protection primitives live outside this crate, behind the
//! [`PacketKey`] and [`HeaderKey`] traits; the TLS collaborator supplies
//! implementations as secrets become available. [`CryptoPair`] holds the
//! send/recv contexts for one epoch and implements packet sealing/opening,
//! header protection and the 1-RTT key-update rotation.

use crate::packet::{decode_packet_number, PACKET_NUMBER_MAX_SIZE};
use core::fmt;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// The three encryption epochs. Each owns a packet number space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial = 0,
    Handshake = 1,
    OneRtt = 2,
}

impl Epoch {
    pub const COUNT: usize = 3;

    pub fn iter() -> impl DoubleEndedIterator<Item = Epoch> {
        [Epoch::Initial, Epoch::Handshake, Epoch::OneRtt].into_iter()
    }
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# The output of this algorithm is a 5-byte mask that is applied to the
//# protected header fields using exclusive OR.
pub const HEADER_PROTECTION_MASK_LEN: usize = 5;
pub type HeaderProtectionMask = [u8; HEADER_PROTECTION_MASK_LEN];

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
//# in sampling packet ciphertext for header protection, the Packet Number
//# field is assumed to be 4 bytes long
pub const HEADER_PROTECTION_SAMPLE_LEN: usize = 16;

const LONG_HEADER_BIT: u8 = 0x80;
const LONG_HEADER_MASK: u8 = 0x0f;
const SHORT_HEADER_MASK: u8 = 0x1f;
const KEY_PHASE_BIT: u8 = 0x04;

/// Failure to authenticate or decrypt a packet. Deliberately opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoError;

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "packet decryption failed")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CryptoError {}

/// An AEAD context for one direction of one epoch.
pub trait PacketKey: Send {
    /// Seals `payload` with `header` as associated data. Returns ciphertext
    /// with the authentication tag appended.
    fn seal(&self, packet_number: u64, header: &[u8], payload: &[u8]) -> Vec<u8>;

    /// Opens `payload` (ciphertext plus tag) with `header` as associated
    /// data.
    fn open(&self, packet_number: u64, header: &[u8], payload: &[u8])
        -> Result<Vec<u8>, CryptoError>;

    fn tag_len(&self) -> usize;

    /// Derives the key for the next key phase. Only meaningful for 1-RTT
    /// keys.
    fn next_key(&self) -> Box<dyn PacketKey>;
}

/// A header-protection context for one direction of one epoch.
pub trait HeaderKey: Send {
    fn protection_mask(&self, ciphertext_sample: &[u8]) -> HeaderProtectionMask;
}

/// The keys for one direction: packet protection plus header protection.
pub struct DirectionalKeys {
    pub packet: Box<dyn PacketKey>,
    pub header: Box<dyn HeaderKey>,
}

/// Both directions of an epoch's keys, as handed over by the TLS
/// collaborator.
pub struct KeySet {
    pub send: DirectionalKeys,
    pub recv: DirectionalKeys,
}

/// A successfully opened packet.
pub struct PlainPacket {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub packet_number: u64,
    /// Set when the packet was protected under the next key phase,
    /// signalling a peer-initiated key update.
    pub key_update_detected: bool,
}

/// Send/recv crypto contexts for one epoch.
///
/// For 1-RTT, [`CryptoPair::update_key`] rotates both directions to the next
/// phase while retaining the previous receive key so that reordered packets
/// from the old phase still open. The old key is dropped once the connection
/// observes an acknowledgment for a packet sent under the new phase.
pub struct CryptoPair {
    send: DirectionalKeys,
    recv: DirectionalKeys,
    key_phase: u8,
    prev_recv_packet: Option<Box<dyn PacketKey>>,
}

impl CryptoPair {
    pub fn new(keys: KeySet) -> Self {
        Self {
            send: keys.send,
            recv: keys.recv,
            key_phase: 0,
            prev_recv_packet: None,
        }
    }

    #[inline]
    pub fn aead_tag_size(&self) -> usize {
        self.send.packet.tag_len()
    }

    #[inline]
    pub fn key_phase(&self) -> u8 {
        self.key_phase
    }

    #[inline]
    pub fn has_retained_key(&self) -> bool {
        self.prev_recv_packet.is_some()
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-6.1
    //# An endpoint MUST NOT initiate a subsequent key update unless it has
    //# received an acknowledgment for a packet that was sent protected with
    //# keys from the current key phase.
    /// Rotates both directions to the next key phase.
    pub fn update_key(&mut self) {
        let next_send = self.send.packet.next_key();
        let next_recv = self.recv.packet.next_key();
        self.prev_recv_packet = Some(core::mem::replace(&mut self.recv.packet, next_recv));
        self.send.packet = next_send;
        self.key_phase ^= 1;
    }

    /// Drops the receive key retained from the previous phase.
    pub fn discard_previous_key(&mut self) {
        self.prev_recv_packet = None;
    }

    /// Seals a packet and applies header protection.
    ///
    /// `plain_header` must end with the truncated packet number; the caller
    /// guarantees the payload is long enough to produce a full
    /// header-protection sample ([`PACKET_NUMBER_MAX_SIZE`] minus the
    /// truncated size).
    pub fn encrypt_packet(
        &self,
        plain_header: &[u8],
        plain_payload: &[u8],
        packet_number: u64,
        pn_size: usize,
    ) -> Vec<u8> {
        let protected_payload = self
            .send
            .packet
            .seal(packet_number, plain_header, plain_payload);

        let mut packet = Vec::with_capacity(plain_header.len() + protected_payload.len());
        packet.extend_from_slice(plain_header);
        packet.extend_from_slice(&protected_payload);

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
        //# the sample of ciphertext is taken starting from an offset of 4
        //# bytes after the start of the Packet Number field
        let pn_offset = plain_header.len() - pn_size;
        let sample_start = pn_offset + PACKET_NUMBER_MAX_SIZE;
        let mask = self
            .send
            .header
            .protection_mask(&packet[sample_start..sample_start + HEADER_PROTECTION_SAMPLE_LEN]);

        if packet[0] & LONG_HEADER_BIT != 0 {
            packet[0] ^= mask[0] & LONG_HEADER_MASK;
        } else {
            packet[0] ^= mask[0] & SHORT_HEADER_MASK;
        }
        for i in 0..pn_size {
            packet[pn_offset + i] ^= mask[1 + i];
        }

        packet
    }

    /// Removes header protection and opens one packet.
    ///
    /// `packet` spans exactly one packet (header through AEAD tag);
    /// `pn_offset` is where the protected packet number begins, and
    /// `expected_pn` is one more than the largest packet number received so
    /// far in this space.
    pub fn decrypt_packet(
        &self,
        packet: &[u8],
        pn_offset: usize,
        expected_pn: u64,
    ) -> Result<PlainPacket, CryptoError> {
        let sample_start = pn_offset + PACKET_NUMBER_MAX_SIZE;
        let sample = packet
            .get(sample_start..sample_start + HEADER_PROTECTION_SAMPLE_LEN)
            .ok_or(CryptoError)?;
        let mask = self.recv.header.protection_mask(sample);

        let is_long = packet[0] & LONG_HEADER_BIT != 0;
        let first = if is_long {
            packet[0] ^ (mask[0] & LONG_HEADER_MASK)
        } else {
            packet[0] ^ (mask[0] & SHORT_HEADER_MASK)
        };
        let pn_size = (first & 0x03) as usize + 1;
        if packet.len() < pn_offset + pn_size {
            return Err(CryptoError);
        }

        let mut header = packet[..pn_offset + pn_size].to_vec();
        header[0] = first;
        let mut truncated: u64 = 0;
        for i in 0..pn_size {
            header[pn_offset + i] ^= mask[1 + i];
            truncated = (truncated << 8) | header[pn_offset + i] as u64;
        }
        let packet_number = decode_packet_number(truncated, pn_size, expected_pn);

        let payload = &packet[pn_offset + pn_size..];

        //= https://www.rfc-editor.org/rfc/rfc9001#section-6.3
        //# An endpoint that receives a packet with a key phase that does not
        //# match the phase of the keys it is currently using responds by
        //# trying to decrypt the packet with the next set of keys.
        let mut key_update_detected = false;
        let plain = if !is_long && (first & KEY_PHASE_BIT != 0) != (self.key_phase == 1) {
            // phase mismatch: reordered old-phase packet or peer-initiated
            // update
            if let Some(prev) = &self.prev_recv_packet {
                if let Ok(plain) = prev.open(packet_number, &header, payload) {
                    plain
                } else {
                    let next = self.recv.packet.next_key();
                    let plain = next.open(packet_number, &header, payload)?;
                    key_update_detected = true;
                    plain
                }
            } else {
                let next = self.recv.packet.next_key();
                let plain = next.open(packet_number, &header, payload)?;
                key_update_detected = true;
                plain
            }
        } else {
            self.recv.packet.open(packet_number, &header, payload)?
        };

        Ok(PlainPacket {
            header,
            payload: plain,
            packet_number,
            key_update_detected,
        })
    }
}

impl fmt::Debug for CryptoPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CryptoPair")
            .field("key_phase", &self.key_phase)
            .field("retained_previous", &self.prev_recv_packet.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::null_key_set, *};
    use crate::packet::{encode_long_header_first_byte, PacketType, PACKET_NUMBER_SEND_SIZE};

    fn long_header(pn: u16) -> Vec<u8> {
        let mut header = vec![encode_long_header_first_byte(
            PacketType::Initial,
            (PACKET_NUMBER_SEND_SIZE - 1) as u8,
        )];
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&[0, 0]); // empty CIDs
        header.extend_from_slice(&[0]); // empty token
        header.extend_from_slice(&(0x4000u16 | 40).to_be_bytes());
        header.extend_from_slice(&pn.to_be_bytes());
        header
    }

    #[test]
    fn seal_open_round_trip() {
        let pair = CryptoPair::new(null_key_set(b"test", Epoch::Initial));
        let header = long_header(7);
        let payload = b"hello quic hello quic";
        let packet = pair.encrypt_packet(&header, payload, 7, PACKET_NUMBER_SEND_SIZE);

        let plain = pair
            .decrypt_packet(&packet, header.len() - PACKET_NUMBER_SEND_SIZE, 7)
            .unwrap();
        assert_eq!(plain.payload, payload);
        assert_eq!(plain.packet_number, 7);
        assert_eq!(plain.header, header);
        assert!(!plain.key_update_detected);
    }

    #[test]
    fn mismatched_keys_fail_to_open() {
        let sealer = CryptoPair::new(null_key_set(b"a", Epoch::Initial));
        let opener = CryptoPair::new(null_key_set(b"b", Epoch::Initial));
        let header = long_header(1);
        let packet = sealer.encrypt_packet(&header, b"payload payload payload", 1, 2);
        assert!(opener
            .decrypt_packet(&packet, header.len() - 2, 1)
            .is_err());
    }

    #[test]
    fn key_update_rotates_phase_and_retains_old_key() {
        // the opener keeps decrypting old-phase packets until the retained
        // key is dropped; new-phase packets flag a detected update
        let mut sealer = CryptoPair::new(null_key_set(b"k", Epoch::OneRtt));
        let mut opener = CryptoPair::new(null_key_set(b"k", Epoch::OneRtt));

        let mut header = vec![0x40 | (PACKET_NUMBER_SEND_SIZE - 1) as u8];
        header.extend_from_slice(&1u16.to_be_bytes());
        let old_packet = sealer.encrypt_packet(&header, b"old phase packet", 1, 2);

        sealer.update_key();
        assert_eq!(sealer.key_phase(), 1);
        let mut new_header = vec![0x40 | KEY_PHASE_BIT | (PACKET_NUMBER_SEND_SIZE - 1) as u8];
        new_header.extend_from_slice(&2u16.to_be_bytes());
        let new_packet = sealer.encrypt_packet(&new_header, b"new phase packet", 2, 2);

        let plain = opener.decrypt_packet(&new_packet, 1, 2).unwrap();
        assert_eq!(plain.payload, b"new phase packet");
        assert!(plain.key_update_detected);

        // the connection rotates on detection, then still opens the
        // reordered old-phase packet via the retained key
        opener.update_key();
        let plain = opener.decrypt_packet(&old_packet, 1, 1).unwrap();
        assert_eq!(plain.payload, b"old phase packet");
        assert!(!plain.key_update_detected);

        opener.discard_previous_key();
        assert!(opener.decrypt_packet(&old_packet, 1, 1).is_err());
    }
}
