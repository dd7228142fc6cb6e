//! Inbound audio payloads.
//!
//! Clients send base64-encoded PCM16 little-endian mono at the session's
//! configured sample rate. `pcm` decodes that into a `PcmChunk` and splits it
//! into fixed-size frames for the ensemble.

pub mod pcm;

pub use pcm::{normalized_rms, PcmChunk};
