//! Compile-time configuration constants.
//!
//! Values here are defaults; most of them can be overridden at runtime
//! by the crates that consume them (see `cross_call::CrossCallConfig`).

#![no_std]

pub mod smp;
