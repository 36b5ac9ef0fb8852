// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use skein_codec::BufferError;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A QUIC transport-level error.
///
/// Carries the error code placed in a CONNECTION_CLOSE frame, the frame type
/// that triggered the error (when known), and a static reason phrase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportError {
    pub code: u64,
    pub frame_type: Option<u64>,
    pub reason: &'static str,
}

impl TransportError {
    pub const fn new(code: u64, reason: &'static str) -> Self {
        Self {
            code,
            frame_type: None,
            reason,
        }
    }

    pub const fn with_frame_type(mut self, frame_type: u64) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.8
    //# A TLS alert is converted into a QUIC connection error.  Alert
    //# descriptions are "hidden" in the QUIC error code space by adding
    //# 0x0100 to the value of the alert description.
    pub const fn crypto_error(alert: u8) -> Self {
        Self::new(0x100 + alert as u64, "TLS alert")
    }

    /// True for codes in the CRYPTO_ERROR range reserved for TLS alerts.
    pub const fn is_crypto_error(&self) -> bool {
        self.code >= 0x100 && self.code < 0x200
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({:#x})", self.code)
        } else {
            write!(f, "{} ({:#x})", self.reason, self.code)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransportError {}

/// A truncated or malformed encoding observed while parsing a frame is a
/// FRAME_ENCODING_ERROR at the connection level.
impl From<BufferError> for TransportError {
    fn from(_: BufferError) -> Self {
        Self::FRAME_ENCODING_ERROR.with_reason("malformed encoding")
    }
}

macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl TransportError {
            #[doc = $doc]
            pub const $name: Self = Self::new($code, stringify!($name));
        }
    };
}

def_error!(
    "Used with CONNECTION_CLOSE to signal closure in the absence of any error.",
    NO_ERROR,
    0x0
);
def_error!(
    "The endpoint encountered an internal error and cannot continue.",
    INTERNAL_ERROR,
    0x1
);
def_error!(
    "The server refused to accept a new connection.",
    CONNECTION_REFUSED,
    0x2
);
def_error!(
    "More data was received than permitted by advertised data limits.",
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    "A frame was received for a stream identifier exceeding the advertised stream limit.",
    STREAM_LIMIT_ERROR,
    0x4
);
def_error!(
    "A frame was received for a stream that was not in a state permitting it.",
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    "A STREAM or RESET_STREAM frame contradicted an established final size.",
    FINAL_SIZE_ERROR,
    0x6
);
def_error!("A badly formatted frame was received.", FRAME_ENCODING_ERROR, 0x7);
def_error!(
    "A transport parameter was malformed, absent when mandatory, or otherwise in error.",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    "More connection IDs were provided than the advertised active_connection_id_limit.",
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);
def_error!(
    "A general protocol violation was detected.",
    PROTOCOL_VIOLATION,
    0xA
);
def_error!("An invalid Retry or NEW_TOKEN token was received.", INVALID_TOKEN, 0xB);
def_error!(
    "The application or application protocol caused the connection to be closed.",
    APPLICATION_ERROR,
    0xC
);
def_error!(
    "More data was received in CRYPTO frames than can be buffered.",
    CRYPTO_BUFFER_EXCEEDED,
    0xD
);
def_error!(
    "A key update error was detected.",
    KEY_UPDATE_ERROR,
    0xE
);
def_error!(
    "The confidentiality or integrity limit of the AEAD was reached.",
    AEAD_LIMIT_REACHED,
    0xF
);
def_error!(
    "No viable network path exists.",
    NO_VIABLE_PATH,
    0x10
);
