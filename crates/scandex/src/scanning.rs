//! 🔬 Scanning: the wire types and the Decoder.
//!
//! 🎬 *[two schemas walk into a topic. one speaks base64. one speaks plain text.]*
//! *[the indexer only speaks one language. someone has to translate.]*
//!
//! 📦 Scan results arrive in two coexisting dialects, told apart by `data_version`:
//! - V1 carries `data.response_bytes_utf8`, a base64 string of UTF-8 bytes.
//! - V2 (and any other version number) carries `data.response_str`, already plain text.
//!
//! The Decoder reads the envelope first, then parses the payload shape the tag points at.
//! Everything downstream only ever sees a [`NormalizedRecord`]. No versions. No drama. 🦆

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::trace;

/// 🏷️ The wire value of `data_version` that selects the base64 payload.
pub const DATA_VERSION_V1: i64 = 1;
/// 🏷️ The wire value of `data_version` for the plain-text payload.
pub const DATA_VERSION_V2: i64 = 2;

/// 🏷️ Which payload shape an envelope carries.
///
/// Only `1` means V1. Every other number is read as V2, because that is what the
/// producers have always done and we are not about to start a schema war at 3am.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVersion {
    V1,
    V2,
}

impl From<i64> for DataVersion {
    fn from(wire_value: i64) -> Self {
        if wire_value == DATA_VERSION_V1 {
            DataVersion::V1
        } else {
            DataVersion::V2
        }
    }
}

/// 📦 The outer envelope, read in step one. `data` stays raw until we know what it is.
#[derive(Debug, Deserialize)]
struct ScanEnvelope<'a> {
    ip: String,
    port: u32,
    service: String,
    timestamp: i64,
    data_version: i64,
    #[serde(borrow)]
    data: &'a RawValue,
}

/// 🔤 V1 payload: base64 of the raw service response.
#[derive(Debug, Serialize, Deserialize)]
pub struct V1Data {
    pub response_bytes_utf8: String,
}

/// 📝 V2 payload: the service response, already decoded.
#[derive(Debug, Serialize, Deserialize)]
pub struct V2Data {
    pub response_str: String,
}

/// 🎯 The canonical record that lands in the index.
///
/// Field order here is the field order on the wire. Consumers don't rely on it,
/// but the tests like it predictable, and so do humans reading Kibana at 3am.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub ip: String,
    pub port: u32,
    pub service: String,
    pub timestamp: i64,
    pub response: String,
}

/// 💀 Everything that can go wrong while decoding one message.
///
/// One error type, many flavors. The consumer doesn't care which flavor: it nacks all of them.
/// The cause is kept as `source` so the logs can be as specific as the failure was.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("💀 scan message is not a valid envelope (malformed JSON or a missing/ill-typed field)")]
    Envelope(#[source] serde_json::Error),
    #[error("💀 scan message payload does not match the shape declared by data_version {data_version}")]
    Payload {
        data_version: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("💀 V1 response_bytes_utf8 is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("💀 normalized record refused to serialize")]
    Serialize(#[source] serde_json::Error),
}

/// 🔬 Parse one raw message into a [`NormalizedRecord`].
///
/// Two-step parse: envelope first (tag + raw payload), then the payload shape for that tag.
/// Pure. No I/O, no shared state, safe to call from as many callbacks as the transport likes.
pub fn decode_record(raw: &[u8]) -> Result<NormalizedRecord, DecodeError> {
    let envelope: ScanEnvelope<'_> = serde_json::from_slice(raw).map_err(DecodeError::Envelope)?;
    let payload_error = |source| DecodeError::Payload {
        data_version: envelope.data_version,
        source,
    };

    let response = match DataVersion::from(envelope.data_version) {
        DataVersion::V1 => {
            let v1: V1Data = serde_json::from_str(envelope.data.get()).map_err(payload_error)?;
            let decoded_bytes = STANDARD.decode(v1.response_bytes_utf8.as_bytes())?;
            // -- banners are whatever the service sent; bytes that aren't UTF-8 become U+FFFD instead of a nack loop
            String::from_utf8_lossy(&decoded_bytes).into_owned()
        }
        DataVersion::V2 => {
            let v2: V2Data = serde_json::from_str(envelope.data.get()).map_err(payload_error)?;
            v2.response_str
        }
    };

    Ok(NormalizedRecord {
        ip: envelope.ip,
        port: envelope.port,
        service: envelope.service,
        timestamp: envelope.timestamp,
        response,
    })
}

/// 📦 Decode and re-serialize into the canonical wire form, ready for the hand-off.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let record = decode_record(raw)?;
    trace!(ip = %record.ip, port = record.port, service = %record.service, "🔬 decoded scan message");
    serde_json::to_vec(&record).map_err(DecodeError::Serialize)
}
