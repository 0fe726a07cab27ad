#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, read_frame,
	try_decode_frame_from_buffer, write_frame,
};
