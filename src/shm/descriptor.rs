use serde::{Deserialize, Serialize};

use crate::error::SegmentError;

/// Width of the NUL padded mapping name in the fixed-width encoding.
pub const MAPPING_NAME_LEN: usize = 256;
/// Total length of [`SegmentDescriptor::to_bytes`].
pub const DESCRIPTOR_LEN: usize = MAPPING_NAME_LEN + 3 * 8;

/// Reopenable handle to a shared memory segment.
///
/// The descriptor only names the mapping; it owns nothing. Dropping it has no
/// effect on the segment, and a host may reopen the mapping as long as the
/// supervisor keeps the segment allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDescriptor {
    /// Path of the backing mapping file.
    pub mapping_name: String,
    /// Usable ring capacity in bytes (excludes the header).
    pub capacity: u64,
    /// Offset of the segment header inside the mapping.
    pub offset: u64,
    /// Length of the mapped region (header plus ring).
    pub size: u64,
}

impl SegmentDescriptor {
    pub fn to_bytes(&self) -> Result<[u8; DESCRIPTOR_LEN], SegmentError> {
        let name = self.mapping_name.as_bytes();
        if name.len() >= MAPPING_NAME_LEN {
            return Err(SegmentError::InvalidHeader(format!(
                "mapping name is {} bytes, limit is {}",
                name.len(),
                MAPPING_NAME_LEN - 1
            )));
        }

        let mut out = [0u8; DESCRIPTOR_LEN];
        out[..name.len()].copy_from_slice(name);
        let mut cursor = MAPPING_NAME_LEN;
        for value in [self.capacity, self.offset, self.size] {
            out[cursor..cursor + 8].copy_from_slice(&value.to_le_bytes());
            cursor += 8;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() != DESCRIPTOR_LEN {
            return Err(SegmentError::InvalidHeader(format!(
                "descriptor must be {} bytes, got {}",
                DESCRIPTOR_LEN,
                bytes.len()
            )));
        }

        let name_end = bytes[..MAPPING_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAPPING_NAME_LEN);
        let mapping_name = std::str::from_utf8(&bytes[..name_end])
            .map_err(|e| SegmentError::InvalidHeader(format!("mapping name: {e}")))?
            .to_string();

        let read_u64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        Ok(Self {
            mapping_name,
            capacity: read_u64(MAPPING_NAME_LEN),
            offset: read_u64(MAPPING_NAME_LEN + 8),
            size: read_u64(MAPPING_NAME_LEN + 16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_layout_is_stable() {
        let descriptor = SegmentDescriptor {
            mapping_name: "/dev/shm/seg-a.shm".to_string(),
            capacity: 4096,
            offset: 0,
            size: 4224,
        };

        let bytes = descriptor.to_bytes().unwrap();
        assert_eq!(bytes.len(), DESCRIPTOR_LEN);
        assert_eq!(&bytes[..18], b"/dev/shm/seg-a.shm");
        assert!(bytes[18..MAPPING_NAME_LEN].iter().all(|&b| b == 0));
        assert_eq!(&bytes[MAPPING_NAME_LEN..MAPPING_NAME_LEN + 8], &4096u64.to_le_bytes());
        assert_eq!(&bytes[MAPPING_NAME_LEN + 16..], &4224u64.to_le_bytes());

        assert_eq!(SegmentDescriptor::from_bytes(&bytes).unwrap(), descriptor);
    }

    #[test]
    fn rejects_oversized_names_and_short_buffers() {
        let descriptor = SegmentDescriptor {
            mapping_name: "x".repeat(MAPPING_NAME_LEN),
            capacity: 1,
            offset: 0,
            size: 1,
        };
        assert!(descriptor.to_bytes().is_err());
        assert!(SegmentDescriptor::from_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn json_uses_camel_case() {
        let descriptor = SegmentDescriptor {
            mapping_name: "m".to_string(),
            capacity: 8,
            offset: 0,
            size: 136,
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["mappingName"], "m");
        assert_eq!(json["capacity"], 8);
    }
}
