//! Extended devicetree.
//!
//! [`Edt::new`] parses a DTS file with [`dts_parser`] and types every node
//! with the YAML binding that matches its `compatible`: properties become
//! [`PropertyValue`]s, `reg`/`ranges` are translated, interrupts and
//! phandle-arrays are routed to their controllers, and the nodes get a
//! dependency order.

use std::{collections::BTreeMap, fs, path::Path};

mod addr;
pub mod binding;
pub mod edt;
pub mod graph;
pub mod node;
pub mod options;
pub mod registry;

pub use binding::{bindings_from_paths, Binding, PropType, PropertySpec};
pub use dts_parser::{Error, Result};
pub use edt::Edt;
pub use graph::Graph;
pub use node::{ControllerAndData, Node, NodeIndex, PinCtrl, Property, PropertyValue, Range, Register};
pub use options::{EdtOptions, LogReporter, Reporter};
pub use registry::BindingRegistry;

/// Turns `s` into an identifier by replacing every character that is not
/// alphanumeric or `_` with `_`.
pub fn str_as_token(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Reads a `vendor-prefixes.txt` file: one `prefix<TAB>vendor` per line,
/// with blank lines and `#` comments.
pub fn load_vendor_prefixes_txt(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| Error::in_file(path, format!("could not read vendor prefixes: {}", e)))?;

    let mut prefixes = BTreeMap::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((prefix, vendor)) = line.split_once('\t') else {
            return Err(Error::at(
                path,
                i as u32 + 1,
                format!("expected '<prefix>\\t<vendor>', got '{}'", line),
            ));
        };
        prefixes.insert(prefix.to_string(), vendor.to_string());
    }

    Ok(prefixes)
}
