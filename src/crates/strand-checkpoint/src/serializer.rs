//! Serialization protocol for checkpoint backends

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Blob encoding for channel values, metadata and pending writes
///
/// Backends that store opaque blobs (see [`SqliteCheckpointSaver`](crate::SqliteCheckpointSaver))
/// go through this trait; changing it makes existing databases unreadable.
pub trait SerializerProtocol: Send + Sync {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decoding failures surface as [`CheckpointError::Serialization`](crate::CheckpointError::Serialization)
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// Plain JSON encoding, readable with any SQLite client
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMetadata, CheckpointSource};
    use serde_json::json;

    #[test]
    fn test_json_serializer_metadata() {
        let serializer = JsonSerializer::new();
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Loop)
            .with_step(2)
            .with_extra("user", json!("bob"));

        let bytes = serializer.dumps(&metadata).unwrap();
        let restored: CheckpointMetadata = serializer.loads(&bytes).unwrap();

        assert_eq!(metadata, restored);
    }

    #[test]
    fn test_loads_rejects_garbage() {
        let serializer = JsonSerializer::new();
        let result: Result<CheckpointMetadata> = serializer.loads(b"not json");
        assert!(result.is_err());
    }
}
