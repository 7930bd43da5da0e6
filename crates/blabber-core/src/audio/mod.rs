//! Audio stream handling: payload decoding, packetizing and the playback source

mod decoder;
mod packetizer;
mod source;

pub use decoder::{ExtractRule, FrameDecoder};
pub use packetizer::{OggPacketizer, Packetizer, RawPacketizer};
pub use source::{AudioSource, SourceState};
