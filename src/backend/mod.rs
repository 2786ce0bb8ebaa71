//! [`Device`](crate::device::Device) implementations.
//!
//! [`software`] runs everywhere and is what the tests composite with;
//! [`gl`] drives a real OpenGL context through glow.

#[cfg(feature = "glow")]
pub mod gl;
pub mod software;
