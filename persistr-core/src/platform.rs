//! Provides platform-specific functionality.
//!
//! This module contains the real implementations of the collaborator traits
//! in [`crate::system`], which shell out to the operating system's disk
//! tooling. Provisioning a persistence partition only makes sense on the
//! Linux live-boot stack, so only a Linux backend exists.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
