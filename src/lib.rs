//! Capture-side plumbing for the flowprobe agent: flow identification and
//! TCP reassembly feeding the [`dissect`] engine.

pub mod assemble;
