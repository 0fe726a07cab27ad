#![forbid(unsafe_code)]

use bytes::{Buf, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	/// The peer closed the stream on a frame boundary.
	#[error("connection closed")]
	Closed,

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl FramingError {
	/// True for an orderly close rather than a broken frame.
	pub fn is_closed(&self) -> bool {
		matches!(self, FramingError::Closed)
	}
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(PREFIX_LEN + payload_len);
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a single frame from the start of `src`.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < PREFIX_LEN {
		return Err(FramingError::InsufficientData {
			need: PREFIX_LEN,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer.
///
/// Returns `None` until a whole frame is buffered; the frame's bytes are
/// consumed only when it decodes.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	match decode_frame::<M>(&buf[..], max_frame_size) {
		Ok((msg, consumed)) => {
			buf.advance(consumed);
			Ok(Some(msg))
		}
		Err(FramingError::InsufficientData { .. }) => Ok(None),
		Err(e) => Err(e),
	}
}

/// Read exactly one frame from `reader`.
///
/// Not cancel safe: dropping the future part-way loses the bytes already
/// read. Callers that race reads against a timer should buffer with
/// [`try_decode_frame_from_buffer`] instead.
///
/// Waits until the prefix and the full declared payload have arrived. EOF before
/// the first prefix byte is `Closed`; EOF anywhere later is `InsufficientData`.
pub async fn read_frame<M, R>(reader: &mut R, max_frame_size: usize) -> Result<M, FramingError>
where
	M: Message + Default,
	R: AsyncRead + Unpin + ?Sized,
{
	let mut prefix = [0u8; PREFIX_LEN];
	let have = read_full(reader, &mut prefix).await?;
	if have == 0 {
		return Err(FramingError::Closed);
	}
	if have < PREFIX_LEN {
		return Err(FramingError::InsufficientData { need: PREFIX_LEN, have });
	}

	let len = u32::from_be_bytes(prefix) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let mut payload = vec![0u8; len];
	let have = read_full(reader, &mut payload).await?;
	if have < len {
		return Err(FramingError::InsufficientData { need: len, have });
	}

	Ok(M::decode(payload.as_slice())?)
}

/// Encode `msg` and write the whole frame to `writer`, returning the bytes written.
pub async fn write_frame<M, W>(writer: &mut W, msg: &M, max_frame_size: usize) -> Result<usize, FramingError>
where
	M: Message,
	W: AsyncWrite + Unpin + ?Sized,
{
	let frame = encode_frame(msg, max_frame_size)?;
	writer.write_all(&frame).await?;
	writer.flush().await?;
	Ok(frame.len())
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
	R: AsyncRead + Unpin + ?Sized,
{
	let mut filled = 0;
	while filled < buf.len() {
		let n = reader.read(&mut buf[filled..]).await?;
		if n == 0 {
			break;
		}
		filled += n;
	}
	Ok(filled)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	#[test]
	fn encode_decode_roundtrip_slice() {
		let msg = TestMsg {
			s: "hello".to_string(),
			n: 42,
		};

		let frame = encode_frame_default(&msg).expect("encode");
		let (decoded, consumed) = decode_frame::<TestMsg>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(consumed, frame.len());
		assert_eq!(decoded, msg);
	}

	#[test]
	fn prefix_is_big_endian_payload_len() {
		let msg = TestMsg {
			s: "abc".to_string(),
			n: 0,
		};
		let frame = encode_frame_default(&msg).expect("encode");
		let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
		assert_eq!(declared, frame.len() - 4);
		assert_eq!(declared, msg.encoded_len());
	}

	#[test]
	fn decode_requires_full_frame() {
		let msg = TestMsg { s: "x".repeat(10), n: 7 };
		let frame = encode_frame_default(&msg).expect("encode");

		let err = decode_frame::<TestMsg>(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert!(need > have);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn buffer_decode_waits_for_whole_frame() {
		let first = TestMsg {
			s: "hello".to_string(),
			n: 99,
		};
		let second = TestMsg { s: String::new(), n: 3 };
		let mut wire = encode_frame_default(&first).expect("encode");
		wire.extend(encode_frame_default(&second).expect("encode"));

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&wire[..2]);
		assert!(try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok").is_none());

		buf.extend_from_slice(&wire[2..8]);
		assert!(try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok").is_none());
		assert_eq!(buf.len(), 8, "partial frame stays buffered");

		buf.extend_from_slice(&wire[8..]);
		let got = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok");
		assert_eq!(got, Some(first));
		let got = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok");
		assert_eq!(got, Some(second));
		assert!(buf.is_empty());
	}

	#[test]
	fn buffer_decode_rejects_oversized_prefix() {
		let mut buf = BytesMut::from(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes()[..]);
		let err = try_decode_frame_from_buffer::<TestMsg>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { .. }));
	}

	#[test]
	fn encode_rejects_too_large() {
		let msg = TestMsg {
			s: "a".repeat(10_000),
			n: 1,
		};

		let err = encode_frame(&msg, 32).unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn read_frame_reports_clean_close() {
		let mut empty: &[u8] = &[];
		let err = read_frame::<TestMsg, _>(&mut empty, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
		assert!(err.is_closed());
	}

	#[tokio::test]
	async fn read_frame_rejects_short_prefix() {
		let mut short: &[u8] = &[0, 0];
		let err = read_frame::<TestMsg, _>(&mut short, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
		match err {
			FramingError::InsufficientData { need: 4, have: 2 } => {}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn read_frame_rejects_too_large_prefix() {
		let prefix = (DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
		let mut src: &[u8] = &prefix;
		let err = read_frame::<TestMsg, _>(&mut src, DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { .. }));
	}
}
