//! Canonical CBOR encoding of rows.

use crate::error::{CodecError, CodecResult};
use crate::row::Row;

/// Encodes a row to canonical CBOR bytes.
///
/// Determinism guarantees:
/// - Struct fields are serialized in declaration order
/// - The field map is key-sorted (`BTreeMap`)
/// - Integers use the shortest CBOR encoding
///
/// Two rows compare equal if and only if their encodings are identical,
/// which is what makes these bytes usable as dirty-detection snapshots.
pub fn encode_row(row: &Row) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(row, &mut bytes)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a row from CBOR bytes.
pub fn decode_row(bytes: &[u8]) -> CodecResult<Row> {
    ciborium::from_reader(bytes).map_err(|e: ciborium::de::Error<std::io::Error>| {
        CodecError::decoding_failed(e.to_string())
    })
}
