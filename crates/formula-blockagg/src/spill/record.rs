#![forbid(unsafe_code)]

use crate::error::{AggError, AggResult};
use crate::value::{MaterializedRow, Value};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct SpillRecordRef<'a> {
    key: &'a [Value],
    accumulators: &'a [Value],
}

#[derive(Deserialize)]
struct SpillRecord {
    key: MaterializedRow,
    accumulators: MaterializedRow,
}

/// Canonical byte form of a group-by key; equal keys encode to equal bytes.
pub fn encode_key(key: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 9);
    for value in key {
        value.write_key_bytes(&mut out);
    }
    out
}

pub fn encode_record(key: &[Value], accumulators: &[Value]) -> AggResult<Vec<u8>> {
    Ok(serde_json::to_vec(&SpillRecordRef { key, accumulators })?)
}

/// Decode a spilled (key, accumulator-state) pair.
///
/// Panics if the key width differs from `key_width`: the log only ever holds records written
/// by an operator with the same group-by shape.
pub fn decode_record(
    data: &[u8],
    key_width: usize,
) -> AggResult<(MaterializedRow, MaterializedRow)> {
    let record: SpillRecord = serde_json::from_slice(data)
        .map_err(|err| AggError::CorruptSpillRecord(err.to_string()))?;
    assert_eq!(
        record.key.len(),
        key_width,
        "spilled key has the wrong number of components"
    );
    Ok((record.key, record.accumulators))
}
