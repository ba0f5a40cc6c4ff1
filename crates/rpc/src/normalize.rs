//! Contract call response normalization.
//!
//! The execution engine serializes everything as strings: hex buffers,
//! decimal gas counters, hex storage words. Callers get typed values; any
//! malformed field fails the whole normalization so a half-decoded response
//! never escapes.

use bytes::Bytes;
use opnet_types::{CallResult, NetEvent, RawCallResult, U256};
use std::collections::HashMap;

/// Normalize a raw engine response.
pub fn normalize_call_result(raw: RawCallResult) -> Result<CallResult, String> {
    let result = decode_hex_field("result", &raw.result)?;
    let gas_used = parse_gas("gasUsed", &raw.gas_used)?;

    let mut changed_storage = HashMap::with_capacity(raw.changed_storage.len());
    for (contract, slots) in raw.changed_storage {
        let mut decoded = HashMap::with_capacity(slots.len());
        for (key, value) in slots {
            let key = U256::from_hex(&key)
                .ok_or_else(|| format!("bad storage key {key} for {contract}"))?;
            let value = U256::from_hex(&value)
                .ok_or_else(|| format!("bad storage value for {contract}"))?;
            decoded.insert(key, value);
        }
        changed_storage.insert(contract, decoded);
    }

    let mut events = HashMap::with_capacity(raw.events.len());
    for (contract, raw_events) in raw.events {
        let mut decoded = Vec::with_capacity(raw_events.len());
        for event in raw_events {
            decoded.push(NetEvent {
                event_type: event.event_type,
                data: decode_hex_field("event data", &event.data)?,
            });
        }
        events.insert(contract, decoded);
    }

    Ok(CallResult { result, gas_used, changed_storage, events, revert: raw.revert })
}

fn decode_hex_field(field: &str, value: &str) -> Result<Bytes, String> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    if value.is_empty() {
        return Ok(Bytes::new());
    }
    hex::decode(value).map(Bytes::from).map_err(|e| format!("bad hex in {field}: {e}"))
}

/// Gas counters arrive decimal, or hex with an `0x` prefix.
fn parse_gas(field: &str, value: &str) -> Result<u128, String> {
    if value.is_empty() {
        return Ok(0);
    }
    let parsed = match value.strip_prefix("0x") {
        Some(hex_digits) => u128::from_str_radix(hex_digits, 16),
        None => value.parse::<u128>(),
    };
    parsed.map_err(|e| format!("bad gas counter in {field}: {e}"))
}
