//! Media codecs
//!
//! Still-image encoding for outbound frames and audio decoding for inbound
//! commentary fragments.

pub mod audio;
pub mod jpeg;

pub use self::audio::{decode_base64, DecodedAudio, FragmentDecoder, SymphoniaDecoder};
pub use self::jpeg::{EncodedImage, SnapshotEncoder};
