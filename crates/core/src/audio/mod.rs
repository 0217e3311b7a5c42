//! Audio stream types: formats, sample codecs and packets

pub mod format;
pub mod packet;

pub use format::{ByteOrder, Codec, StreamProperties, MAX_CHANNELS};
pub use packet::RtpPacketData;
