/// Failures while decoding or encoding relay frames.
///
/// None of these are surfaced to the peer; the connection task logs them
/// and keeps reading.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(serde_json::Error),
    #[error("binary frames are not part of the protocol")]
    Binary,
    #[error("failed to encode event: {0}")]
    Encode(serde_json::Error),
}

impl ProtocolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Binary => "binary",
            Self::Encode(_) => "encode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_strings() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ProtocolError::Malformed(bad).error_kind(), "malformed");
        assert_eq!(ProtocolError::Binary.error_kind(), "binary");
    }

    #[test]
    fn display_includes_cause() {
        let bad = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let msg = ProtocolError::Malformed(bad).to_string();
        assert!(msg.starts_with("malformed message:"), "got: {msg}");
    }
}
