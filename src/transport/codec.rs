//! JSON frame codec.
//!
//! Every message crosses the boundary as a JSON frame. Frames above the
//! configured limit are rejected on both encode and decode.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BridgeResult, TransportError, ValidationError};

/// Default maximum frame size.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1 MiB

/// Serialize `value` into a frame of at most `max` bytes.
pub fn encode<T: Serialize>(value: &T, max: usize) -> BridgeResult<Vec<u8>> {
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::SerializationFailed {
        message: e.to_string(),
    })?;
    check_size(bytes.len(), max)?;
    Ok(bytes)
}

/// Deserialize a frame of at most `max` bytes.
pub fn decode<T: DeserializeOwned>(frame: &[u8], max: usize) -> BridgeResult<T> {
    check_size(frame.len(), max)?;
    serde_json::from_slice(frame).map_err(|e| {
        TransportError::DeserializationFailed {
            message: format!("invalid frame: {e}"),
        }
        .into()
    })
}

fn check_size(actual: usize, max: usize) -> BridgeResult<()> {
    if actual > max {
        return Err(ValidationError::FrameTooLarge { actual, max }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::query::QueryId;
    use crate::transport::message::ChannelEvent;

    #[test]
    fn oversized_frames_are_rejected() {
        let event = ChannelEvent::Data {
            query_id: QueryId::new(1),
            payload: "x".repeat(64),
        };
        let err = encode(&event, 16).unwrap_err();
        assert!(err.is_validation());

        let frame = encode(&event, MAX_FRAME_BYTES).unwrap();
        assert!(decode::<ChannelEvent>(&frame, 16).unwrap_err().is_validation());
        assert_eq!(decode::<ChannelEvent>(&frame, MAX_FRAME_BYTES).unwrap(), event);
    }

    #[test]
    fn garbage_frame_is_a_transport_error() {
        let err = decode::<ChannelEvent>(b"{\"type\":\"nope\"}", MAX_FRAME_BYTES).unwrap_err();
        assert!(err.is_transport());
    }
}
