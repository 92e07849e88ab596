//! Line-oriented JSON encoding and decoding for frames.
//!
//! The transport delivers one JSON object per message. Decoding validates the
//! envelope before handing the frame to the session so that malformed frames
//! can be rejected with a precise warning instead of a generic serde error.

use thiserror::Error;

use crate::frames::Frame;

/// Errors produced while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
	/// The text was not a JSON object or did not match the frame shape.
	#[error("malformed frame: {0}")]
	Json(#[from] serde_json::Error),
	/// A required envelope field was absent or had the wrong type.
	#[error("frame missing envelope field `{0}`")]
	MissingEnvelope(&'static str),
}

/// Encode a frame as a single JSON line (no trailing newline).
pub fn encode_frame(frame: &Frame) -> Result<String, FrameError> {
	Ok(serde_json::to_string(frame)?)
}

/// Decode a frame, validating the envelope first.
pub fn decode_frame(text: &str) -> Result<Frame, FrameError> {
	let value: serde_json::Value = serde_json::from_str(text)?;

	if !value.get("type").is_some_and(serde_json::Value::is_string) {
		return Err(FrameError::MissingEnvelope("type"));
	}
	if !value
		.get("messageId")
		.is_some_and(serde_json::Value::is_string)
	{
		return Err(FrameError::MissingEnvelope("messageId"));
	}
	if !value
		.get("timestamp")
		.is_some_and(serde_json::Value::is_number)
	{
		return Err(FrameError::MissingEnvelope("timestamp"));
	}
	if !value
		.get("clientId")
		.is_some_and(serde_json::Value::is_string)
	{
		return Err(FrameError::MissingEnvelope("clientId"));
	}

	Ok(serde_json::from_value(value)?)
}
