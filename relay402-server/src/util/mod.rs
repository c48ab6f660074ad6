//! Process-level helpers for the binary.

mod sig_down;

pub use sig_down::SigDown;
