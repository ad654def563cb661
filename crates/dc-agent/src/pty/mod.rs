//! Pseudo-terminal processes for remote shells

mod process;

pub use process::{PtyOutput, PtyProcess, TerminalSize};
