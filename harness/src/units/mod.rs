//! Compiled test units, grouped by the controller suite they exercise.

pub mod cpu;
pub mod cpuset;
