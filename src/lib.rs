//! Facade over the subcapture engine.

pub use dxcap_subcapture::*;
