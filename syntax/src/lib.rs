//! Parser for `.sos` workflow scripts.
//!
//! A script is a list of `global { .. }` blocks and `step` blocks. Step headers
//! declare inputs (`<`), outputs (`>`), depends (`^`) and options (`::`);
//! the step body is shell code, scanned for the variables it references.

#[macro_use]
mod macros;
mod parse;
pub use parse::{parse, Error};
pub mod ast;
mod bash;

type Hasher = std::hash::BuildHasherDefault<rustc_hash::FxHasher>;
type HashSet<T> = std::collections::HashSet<T, Hasher>;
