//! Checkpoint byte encoding.
//!
//! - **Default (JSON)**: human-readable.
//! - **Binary (MessagePack)**: compact, enabled via the `binary-codec` feature.
//!
//! Decoding sniffs the first non-whitespace byte, so a reader can always
//! load checkpoints written in JSON whichever format it writes itself.

use crate::persistence::CheckpointError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Encoding used when writing checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    #[default]
    Json,
    #[cfg(feature = "binary-codec")]
    MessagePack,
}

impl CheckpointFormat {
    /// MessagePack when the `binary-codec` feature is enabled, JSON otherwise.
    pub fn active() -> Self {
        #[cfg(feature = "binary-codec")]
        {
            CheckpointFormat::MessagePack
        }
        #[cfg(not(feature = "binary-codec"))]
        {
            CheckpointFormat::Json
        }
    }
}

pub fn encode<T: Serialize>(value: &T, format: CheckpointFormat) -> Result<Vec<u8>, CheckpointError> {
    match format {
        CheckpointFormat::Json => serde_json::to_vec(value).map_err(|e| CheckpointError::Corrupt(e.to_string())),
        #[cfg(feature = "binary-codec")]
        CheckpointFormat::MessagePack => {
            rmp_serde::to_vec_named(value).map_err(|e| CheckpointError::Corrupt(e.to_string()))
        }
    }
}

/// Decodes checkpoint bytes, detecting the format.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CheckpointError> {
    if data.is_empty() {
        return Err(CheckpointError::Corrupt("empty checkpoint data".to_string()));
    }
    if is_json(data) {
        return serde_json::from_slice(data).map_err(|e| CheckpointError::Corrupt(e.to_string()));
    }
    #[cfg(feature = "binary-codec")]
    {
        rmp_serde::from_slice(data).map_err(|e| CheckpointError::Corrupt(e.to_string()))
    }
    #[cfg(not(feature = "binary-codec"))]
    {
        Err(CheckpointError::Corrupt(
            "binary checkpoint requires the binary-codec feature".to_string(),
        ))
    }
}

fn is_json(data: &[u8]) -> bool {
    data.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'{' || b == b'[')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PipelineCheckpoint, QueryCheckpoint, SourceCheckpoint, CHECKPOINT_VERSION};

    fn sample() -> QueryCheckpoint {
        QueryCheckpoint::new(
            vec![SourceCheckpoint {
                name: "readings".into(),
                state: serde_json::json!({"low": 10}),
                pipelines: vec![PipelineCheckpoint {
                    output: None,
                    state: serde_json::Value::Null,
                }],
            }],
            vec![SourceCheckpoint {
                name: "union#0".into(),
                state: serde_json::json!({"left": []}),
                pipelines: vec![PipelineCheckpoint {
                    output: Some(0),
                    state: serde_json::Value::Null,
                }],
            }],
        )
    }

    #[test]
    fn test_json_roundtrip() {
        let data = encode(&sample(), CheckpointFormat::Json).unwrap();
        assert!(is_json(&data));
        let back: QueryCheckpoint = decode(&data).unwrap();
        assert_eq!(back, sample());
        assert_eq!(back.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_empty_data_is_corrupt() {
        let err = decode::<QueryCheckpoint>(&[]).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = decode::<QueryCheckpoint>(b"{not json").unwrap_err();
        assert!(err.is_recoverable());
    }

    #[cfg(feature = "binary-codec")]
    #[test]
    fn test_msgpack_roundtrip() {
        let data = encode(&sample(), CheckpointFormat::MessagePack).unwrap();
        assert!(!is_json(&data));
        let back: QueryCheckpoint = decode(&data).unwrap();
        assert_eq!(back, sample());
    }
}
