//! Checkpoint state serialization.

use serde::{Deserialize, Serialize};

use crate::sink::UploadedSegment;

/// Progress marker for the daily run.
///
/// Serialised as `{"batch_offset": n}`: the number of leading batches of the
/// plan that have already been processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub batch_offset: u64,
}

impl CheckpointState {
    pub fn at(batch_offset: u64) -> Self {
        Self { batch_offset }
    }

    /// Offset as a plan index.
    pub fn offset(&self) -> usize {
        usize::try_from(self.batch_offset).unwrap_or(usize::MAX)
    }
}

/// Segments the unfinished run has already put into staging.
///
/// Every record of the first `covered_offset` batches is in `segments`.
/// Records of later batches were still in the open segment when the
/// manifest was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub covered_offset: u64,
    pub segments: Vec<UploadedSegment>,
}

impl SegmentManifest {
    pub fn covered(&self) -> usize {
        usize::try_from(self.covered_offset).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&CheckpointState::at(42)).unwrap();
        assert_eq!(json, r#"{"batch_offset":42}"#);

        let state: CheckpointState = serde_json::from_str(r#"{"batch_offset": 7}"#).unwrap();
        assert_eq!(state.offset(), 7);
    }

    #[test]
    fn test_manifest_wire_format() {
        let manifest = SegmentManifest {
            covered_offset: 3,
            segments: vec![UploadedSegment {
                uri: "gs://staging/price_data/2025-03-14/a.parquet".to_string(),
                path: "price_data/2025-03-14/a.parquet".to_string(),
                size: 2048,
                record_count: 40,
            }],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["covered_offset"], 3);
        assert_eq!(json["segments"][0]["path"], "price_data/2025-03-14/a.parquet");
        assert_eq!(json["segments"][0]["record_count"], 40);

        let back: SegmentManifest = serde_json::from_value(json).unwrap();
        assert_eq!(back.covered(), 3);
    }

    #[test]
    fn test_missing_offset_is_rejected() {
        assert!(serde_json::from_str::<CheckpointState>("{}").is_err());
        assert!(serde_json::from_str::<CheckpointState>(r#"{"batch_offset": -1}"#).is_err());
    }
}
