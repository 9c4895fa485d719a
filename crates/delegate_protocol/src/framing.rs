#![forbid(unsafe_code)]

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame is not a JSON object")]
	NotAnObject,

	#[error("frame carries no \"command\" tag")]
	MissingCommand,

	#[error("json decode error: {0}")]
	Decode(#[from] serde_json::Error),
}

/// Encode a JSON value into a newline-terminated frame.
pub fn encode_frame(value: &Value, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut out = serde_json::to_vec(value)?;
	if out.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: out.len(),
			max: max_frame_size,
		});
	}

	out.push(b'\n');
	Ok(out)
}

/// Try to split one newline-terminated frame off the front of `buf`.
///
/// Returns `Ok(None)` when no complete frame has arrived yet. The returned
/// payload excludes the terminator and is not yet parsed; parse failures are
/// reported per-frame so one bad frame does not poison the buffer.
pub fn try_split_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Vec<u8>>, FramingError> {
	match buf.iter().position(|b| *b == b'\n') {
		Some(pos) => {
			if pos > max_frame_size {
				return Err(FramingError::FrameTooLarge {
					len: pos,
					max: max_frame_size,
				});
			}

			let frame = buf.split_to(pos + 1);
			Ok(Some(frame[..pos].to_vec()))
		}
		None => {
			if buf.len() > max_frame_size {
				return Err(FramingError::FrameTooLarge {
					len: buf.len(),
					max: max_frame_size,
				});
			}
			Ok(None)
		}
	}
}

/// Decode a complete frame payload into a JSON value.
pub fn decode_frame(payload: &[u8]) -> Result<Value, FramingError> {
	Ok(serde_json::from_slice(payload)?)
}
