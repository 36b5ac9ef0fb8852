// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Null packet protection for tests and simulations.
//!
//! The "AEAD" appends a tag derived from the key's label and generation, and
//! the header "protection" mask is all zeroes, so packets stay readable in
//! captures while key mismatches are still detected.

use crate::crypto::{
    CryptoError, DirectionalKeys, Epoch, HeaderKey, HeaderProtectionMask, KeySet, PacketKey,
};

pub const NULL_TAG_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct NullPacketKey {
    label: u64,
    generation: u64,
}

impl NullPacketKey {
    pub fn new(label: &[u8], epoch: Epoch) -> Self {
        // cheap stable fold of the label bytes
        let mut folded: u64 = epoch as u64;
        for &byte in label {
            folded = folded.wrapping_mul(31).wrapping_add(byte as u64);
        }
        Self {
            label: folded,
            generation: 0,
        }
    }

    fn tag(&self) -> [u8; NULL_TAG_LEN] {
        let mut tag = [0; NULL_TAG_LEN];
        tag[..8].copy_from_slice(&self.label.to_be_bytes());
        tag[8..].copy_from_slice(&self.generation.to_be_bytes());
        tag
    }
}

impl PacketKey for NullPacketKey {
    fn seal(&self, _packet_number: u64, _header: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + NULL_TAG_LEN);
        out.extend_from_slice(payload);
        out.extend_from_slice(&self.tag());
        out
    }

    fn open(
        &self,
        _packet_number: u64,
        _header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let split = payload
            .len()
            .checked_sub(NULL_TAG_LEN)
            .ok_or(CryptoError)?;
        let (plain, tag) = payload.split_at(split);
        if tag != self.tag() {
            return Err(CryptoError);
        }
        Ok(plain.to_vec())
    }

    fn tag_len(&self) -> usize {
        NULL_TAG_LEN
    }

    fn next_key(&self) -> Box<dyn PacketKey> {
        Box::new(Self {
            label: self.label,
            generation: self.generation + 1,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullHeaderKey;

impl HeaderKey for NullHeaderKey {
    fn protection_mask(&self, _ciphertext_sample: &[u8]) -> HeaderProtectionMask {
        [0; 5]
    }
}

/// Builds a key set where both directions share the same null key material.
pub fn null_key_set(label: &[u8], epoch: Epoch) -> KeySet {
    KeySet {
        send: DirectionalKeys {
            packet: Box::new(NullPacketKey::new(label, epoch)),
            header: Box::new(NullHeaderKey),
        },
        recv: DirectionalKeys {
            packet: Box::new(NullPacketKey::new(label, epoch)),
            header: Box::new(NullHeaderKey),
        },
    }
}
