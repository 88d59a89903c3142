use serde::Serialize;
use std::mem::size_of;

/// Size of one kernel `input_event` record on this host.
pub const RECORD_SIZE: usize = size_of::<libc::input_event>();

// type/code/value follow the timestamp in the kernel layout
const TYPE_OFFSET: usize = size_of::<libc::timeval>();
const CODE_OFFSET: usize = TYPE_OFFSET + 2;
const VALUE_OFFSET: usize = CODE_OFFSET + 2;

/// Structural fields of one input event, exactly as the kernel reported them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn new(kind: u16, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }

    /// Decode a single record. Returns `None` unless `bytes` holds at least
    /// one full record.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record = bytes.get(..RECORD_SIZE)?;
        let kind = u16::from_ne_bytes([record[TYPE_OFFSET], record[TYPE_OFFSET + 1]]);
        let code = u16::from_ne_bytes([record[CODE_OFFSET], record[CODE_OFFSET + 1]]);
        let value = i32::from_ne_bytes([
            record[VALUE_OFFSET],
            record[VALUE_OFFSET + 1],
            record[VALUE_OFFSET + 2],
            record[VALUE_OFFSET + 3],
        ]);
        Some(Self { kind, code, value })
    }

    /// Encode into the host record layout with a zero timestamp.
    #[cfg(test)]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        record[TYPE_OFFSET..CODE_OFFSET].copy_from_slice(&self.kind.to_ne_bytes());
        record[CODE_OFFSET..VALUE_OFFSET].copy_from_slice(&self.code.to_ne_bytes());
        record[VALUE_OFFSET..VALUE_OFFSET + 4].copy_from_slice(&self.value.to_ne_bytes());
        record
    }
}

/// Decode every complete record in a read buffer, in order. A trailing
/// partial record is dropped.
pub fn decode_batch(bytes: &[u8]) -> impl Iterator<Item = RawEvent> + '_ {
    bytes.chunks_exact(RECORD_SIZE).filter_map(RawEvent::decode)
}
