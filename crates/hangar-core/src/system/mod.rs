//! Host system probes.

pub mod gpu;
