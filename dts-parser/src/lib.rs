//! Devicetree source (DTS) parsing.
//!
//! [`Tree::from_file`] reads a DTS file, follows its `/include/`s and produces
//! the merged raw tree: nodes with their labels and properties as byte
//! payloads, with every `&ref` resolved. Printing a [`Tree`] gives canonical
//! DTS text.

use std::path::Path;

pub mod ast;
mod emit;
pub mod error;
mod parser;
pub mod property;
pub mod tree;

pub use error::{Error, Location, Result};
pub use property::{Marker, MarkerKind, Property, PropertyType};
pub use tree::{MemReserve, Node, NodeId, ParseOptions, Tree};

/// Parses DTS text into its syntax tree, without applying it.
pub fn from_str(s: &str) -> Result<ast::Dts<'_>> {
    parser::parse(s, Path::new("<string>"))
}
