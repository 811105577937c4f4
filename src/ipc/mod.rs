//! Host transport codec and wire protocol: length-prefixed JSON framing.

pub mod codec;
pub mod protocol;
