// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded byte cursor and variable-length integer codec used by `skein-quic`.
//!
//! All packet and frame serialization in the transport core goes through
//! [`Buffer`]: a forward-only cursor over a fixed-capacity byte region that
//! fails cleanly instead of writing or reading partial data.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod buffer;
mod varint;

pub use buffer::{Buffer, BufferError, Result};
pub use varint::{size_varint, MAX_VARINT_VALUE};
