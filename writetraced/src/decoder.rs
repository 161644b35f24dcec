//! Turns raw ring-buffer records into [`WriteEvent`] values. Bound checks
//! only; never panics on truncated or malformed input.

use writetrace_common::{WriteEvent, WRITE_EVENT_WIRE_SIZE};

use crate::error::DecodeError;

/// Decodes one ring record. Fails unless the record is exactly
/// [`WRITE_EVENT_WIRE_SIZE`] bytes — the kernel side never submits anything
/// else, so any other length means the wire layout itself has drifted.
pub fn decode(bytes: &[u8]) -> Result<WriteEvent, DecodeError> {
    if bytes.len() != WRITE_EVENT_WIRE_SIZE {
        return Err(DecodeError(format!(
            "record has {} bytes, expected exactly {WRITE_EVENT_WIRE_SIZE}",
            bytes.len()
        )));
    }
    bytemuck::try_pod_read_unaligned(bytes)
        .map_err(|e| DecodeError(format!("malformed record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_record() {
        let bytes = vec![0u8; 10];
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decodes_well_formed_record() {
        let ev = WriteEvent::zeroed();
        let bytes = bytemuck::bytes_of(&ev);
        let decoded = decode(bytes).unwrap();
        assert_eq!(decoded.count, 0);
    }

    #[test]
    fn rejects_oversized_record() {
        let ev = WriteEvent::zeroed();
        let mut bytes = bytemuck::bytes_of(&ev).to_vec();
        bytes.extend_from_slice(&[0xAA; 8]);
        assert!(decode(&bytes).is_err());
    }
}
