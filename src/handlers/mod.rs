pub mod transcribe;

pub use transcribe::*;
