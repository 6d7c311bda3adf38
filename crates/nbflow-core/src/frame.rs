use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Serializes `value` as one JSON document without a trailing delimiter.
pub fn encode_json<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let encoded = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Newline-delimited variant of [`encode_json`], for stream transports.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded = encode_json(value, max_frame_bytes)?;
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Checks that `bytes` is a single JSON object within the size limit, without
/// interpreting its fields.
pub fn validate_json_object(bytes: &[u8], max_frame_bytes: usize) -> Result<(), FrameError> {
    let value: serde_json::Value = decode_frame(bytes, max_frame_bytes)?;
    if !value.is_object() {
        return Err(FrameError::Decode("payload is not a JSON object".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn frame_is_newline_terminated_and_decodes_with_crlf() {
        let sample = Sample {
            name: "cell".to_string(),
            count: 3,
        };
        let frame = encode_frame(&sample, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));

        let mut crlf = encode_json(&sample, DEFAULT_MAX_FRAME_BYTES).expect("encode json");
        crlf.extend_from_slice(b"\r\n");
        let decoded: Sample = decode_frame(&crlf, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, sample);
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let sample = Sample {
            name: "x".repeat(128),
            count: 1,
        };
        let result = encode_json(&sample, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn decoder_rejects_oversized_and_malformed_input() {
        let oversized = format!("{{\"blob\":\"{}\"}}", "x".repeat(2_000));
        let result: Result<serde_json::Value, _> = decode_frame(oversized.as_bytes(), 1_024);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));

        let malformed: Result<Sample, _> = decode_frame(b"{\"name\":", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(malformed, Err(FrameError::Decode(_))));
    }

    #[test]
    fn object_validation_rejects_scalars_and_arrays() {
        assert!(validate_json_object(br#"{"type":"cell_update"}"#, 1_024).is_ok());
        assert!(validate_json_object(b"[1,2,3]", 1_024).is_err());
        assert!(validate_json_object(b"42", 1_024).is_err());
        assert!(validate_json_object(b"not json", 1_024).is_err());
    }
}
