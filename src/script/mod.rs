//! Dialogue script parsing.

mod parser;

pub use parser::{ScriptFormat, ScriptParser};
