//! Canonical DTS text for a [`Tree`].
//!
//! The output parses back to an equivalent tree: same nodes, property values
//! and labels. Source formatting, comments and expressions are not kept.

use std::fmt::{self, Write};

use crate::{
    property::{be_int, MarkerKind, Property},
    tree::{NodeId, Tree},
};

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/dts-v1/;\n\n")?;

        if !self.memreserves().is_empty() {
            for reserve in self.memreserves() {
                for label in &reserve.labels {
                    write!(f, "{}: ", label)?;
                }
                writeln!(
                    f,
                    "/memreserve/ {:#018x} {:#018x};",
                    reserve.address, reserve.size
                )?;
            }
            f.write_str("\n")?;
        }

        write_node(f, self, self.root(), 0)
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, tree: &Tree, id: NodeId, depth: usize) -> fmt::Result {
    let node = tree.node(id);
    let indent = "\t".repeat(depth);

    f.write_str(&indent)?;
    for label in node.labels() {
        write!(f, "{}: ", label)?;
    }
    writeln!(f, "{} {{", node.name())?;

    for prop in node.props().values() {
        writeln!(f, "{}\t{}", indent, property_to_string(prop))?;
    }
    for child in node.children().values() {
        write_node(f, tree, *child, depth + 1)?;
    }

    writeln!(f, "{}}};", indent)
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&property_to_string(self))
    }
}

/// A whole property assignment, e.g. `l: reg = < 0x1 0x2 >;`.
pub(crate) fn property_to_string(prop: &Property) -> String {
    let mut s = String::new();
    for label in prop.labels() {
        let _ = write!(s, "{}: ", label);
    }
    s.push_str(prop.name());
    s.push_str(&value_to_string(prop));
    s.push(';');
    s
}

/// The value part of a property assignment (` = ...`), or an empty string
/// for empty properties.
pub(crate) fn value_to_string(prop: &Property) -> String {
    let value = prop.value();
    let markers = prop.markers();

    if value.is_empty() {
        return String::new();
    }

    let mut s = String::from(" =");
    let mut elem_size = 4;
    let mut in_group = false;

    for (i, marker) in markers.iter().enumerate() {
        let next = markers.get(i + 1);
        let end = next.map_or(value.len(), |m| m.offset);
        let data = marker.data.as_deref().unwrap_or_default();
        let mut pos = marker.offset;

        match marker.kind {
            MarkerKind::String => {
                let text = &value[pos..end.saturating_sub(1).max(pos)];
                let _ = write!(s, " \"{}\"", escape(text));
                if end != value.len() {
                    s.push(',');
                }
                continue;
            }
            MarkerKind::Path => {
                let _ = write!(s, " &{}", data);
                if end != value.len() {
                    s.push(',');
                }
                continue;
            }
            MarkerKind::Label => {
                let _ = write!(s, " {}:", data);
            }
            MarkerKind::Phandle => {
                let _ = write!(s, " &{}", data);
                pos += 4;
            }
            kind => {
                elem_size = kind.elem_size().unwrap_or(4);
                in_group = true;
                s.push_str(match elem_size {
                    1 => " [",
                    2 => " /bits/ 16 <",
                    8 => " /bits/ 64 <",
                    _ => " <",
                });
            }
        }

        while pos < end {
            let num = be_int(&value[pos..(pos + elem_size).min(end)]).unwrap_or_default();
            let _ = if elem_size == 1 {
                write!(s, " {:02x}", num)
            } else {
                write!(s, " {:#x}", num)
            };
            pos += elem_size;
        }

        let group_continues = matches!(
            next.map(|m| m.kind),
            Some(MarkerKind::Phandle | MarkerKind::Label)
        );
        if in_group && !group_continues {
            s.push_str(if elem_size == 1 { " ]" } else { " >" });
            in_group = false;
            if pos < value.len() {
                s.push(',');
            }
        }
    }

    s
}

fn escape(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len());

    for b in bytes {
        match b {
            b'\\' => s.push_str("\\\\"),
            b'"' => s.push_str("\\\""),
            0x07 => s.push_str("\\a"),
            0x08 => s.push_str("\\b"),
            b'\t' => s.push_str("\\t"),
            b'\n' => s.push_str("\\n"),
            0x0b => s.push_str("\\v"),
            0x0c => s.push_str("\\f"),
            b'\r' => s.push_str("\\r"),
            0x20..=0x7e => s.push(*b as char),
            _ => {
                let _ = write!(s, "\\x{:02x}", b);
            }
        }
    }

    s
}

#[cfg(test)]
mod tests {
    use crate::tree::{ParseOptions, Tree};

    fn emit(source: &str) -> String {
        Tree::from_source(source, "test.dts", &ParseOptions::default())
            .unwrap()
            .to_string()
    }

    #[test]
    fn emit_properties() {
        let out = emit(
            r#"/dts-v1/;
            / {
                a: node { };
                empty;
                bytes = [de ad];
                cells = <1 2>;
                mixed = <&a 0x10>, "s\t\"q\"", &a;
                wide = /bits/ 16 <1>, /bits/ 64 <2>;
                l = x: <y: 1 z:>;
                raw = "\x01";
            };
            "#,
        );

        for line in [
            "\tempty;",
            "\tbytes = [ de ad ];",
            "\tcells = < 0x1 0x2 >;",
            "\tmixed = < &a 0x10 >, \"s\\t\\\"q\\\"\", &a;",
            "\twide = /bits/ 16 < 0x1 >, /bits/ 64 < 0x2 >;",
            "\tl = x: < y: 0x1 z: >;",
            "\traw = \"\\x01\";",
            "\ta: node {",
            "\t\tphandle = < 0x1 >;",
        ] {
            assert!(out.lines().any(|l| l == line), "missing {:?} in\n{}", line, out);
        }
    }

    #[test]
    fn display_property() {
        let tree = Tree::from_source(
            "/dts-v1/; / { n { l: p = \"a\", <1>; }; };",
            "test.dts",
            &ParseOptions::default(),
        )
        .unwrap();
        let node = tree.node(tree.get_node("/n").unwrap());

        assert_eq!(format!("{}", node.prop("p").unwrap()), "l: p = \"a\", < 0x1 >;");
    }

    #[test]
    fn emit_layout() {
        let out = emit("/dts-v1/;\n/memreserve/ 0x10 0x20;\n/ { a { b { p = <1>; }; }; };");

        assert_eq!(
            out,
            "/dts-v1/;\n\n\
             /memreserve/ 0x0000000000000010 0x0000000000000020;\n\n\
             / {\n\
             \ta {\n\
             \t\tb {\n\
             \t\t\tp = < 0x1 >;\n\
             \t\t};\n\
             \t};\n\
             };\n"
        );
    }
}
