//! Address translation and specifier mapping on the raw tree.
//!
//! `reg` addresses are translated through the `ranges` of every ancestor.
//! Interrupt and other specifiers are routed through `<prefix>-map` nexus
//! nodes until they reach a controller.

use dts_parser::{
    property::{be_int, be_u32},
    Error, NodeId, Property, Result, Tree,
};

/// Human-readable reference to a raw node, for messages.
pub(crate) fn repr(tree: &Tree, id: NodeId) -> String {
    format!(
        "<Node {} in '{}'>",
        tree.node(id).path(),
        tree.filename().display()
    )
}

fn cells_prop(tree: &Tree, id: NodeId, name: &str) -> Result<Option<u32>> {
    tree.node(id).prop(name).map(Property::to_num).transpose()
}

/// `#address-cells` of the node's parent, defaulting to 2.
pub(crate) fn address_cells(tree: &Tree, id: NodeId) -> Result<u32> {
    match tree.node(id).parent() {
        Some(parent) => Ok(cells_prop(tree, parent, "#address-cells")?.unwrap_or(2)),
        None => Ok(2),
    }
}

/// `#size-cells` of the node's parent, defaulting to 1.
pub(crate) fn size_cells(tree: &Tree, id: NodeId) -> Result<u32> {
    match tree.node(id).parent() {
        Some(parent) => Ok(cells_prop(tree, parent, "#size-cells")?.unwrap_or(1)),
        None => Ok(1),
    }
}

/// `#interrupt-cells` of the node itself, which must be present.
pub(crate) fn interrupt_cells(tree: &Tree, id: NodeId) -> Result<u32> {
    cells_prop(tree, id, "#interrupt-cells")?
        .ok_or_else(|| Error::new(format!("{} lacks #interrupt-cells", repr(tree, id))))
}

/// Decodes a big-endian number of any cell count.
pub(crate) fn to_num(bytes: &[u8]) -> Result<u128> {
    be_int(bytes).ok_or_else(|| {
        Error::new(format!(
            "{}-byte number is too large, at most 16 bytes are supported",
            bytes.len()
        ))
    })
}

/// Splits the value of `prop` into `size`-byte chunks.
pub(crate) fn slice<'p>(prop: &'p Property, size: usize, hint: &str) -> Result<Vec<&'p [u8]>> {
    let value = prop.value();

    if size == 0 {
        return if value.is_empty() {
            Ok(Vec::new())
        } else {
            Err(prop.error(format!("has length {} but the entry size (= {}) is 0", value.len(), hint)))
        };
    }

    if value.len() % size != 0 {
        return Err(prop.error(format!(
            "has length {}, which is not evenly divisible by {} (= {}). Note that #*-cells \
             properties come either from the parent node or from the controller (in the case \
             of 'interrupts').",
            value.len(),
            size,
            hint
        )));
    }

    Ok(value.chunks(size).collect())
}

/// Translates a `reg` address of `id` to the root address space.
pub(crate) fn translate(tree: &Tree, addr: u128, id: NodeId) -> Result<u128> {
    let Some(parent) = tree.node(id).parent() else {
        return Ok(addr);
    };
    let Some(ranges) = tree.node(parent).prop("ranges") else {
        return Ok(addr);
    };
    if ranges.value().is_empty() {
        return translate(tree, addr, parent);
    }

    let child_address_cells = address_cells(tree, id)? as usize;
    let parent_address_cells = address_cells(tree, parent)? as usize;
    let child_size_cells = size_cells(tree, id)? as usize;
    let entry_cells = child_address_cells + parent_address_cells + child_size_cells;

    let hint = format!(
        "4*(<#address-cells> (= {}) + <#address-cells for parent> (= {}) + <#size-cells> (= {}))",
        child_address_cells, parent_address_cells, child_size_cells
    );
    for entry in slice(ranges, 4 * entry_cells, &hint)? {
        let (child_addr, rest) = entry.split_at(4 * child_address_cells);
        let (parent_addr, child_len) = rest.split_at(4 * parent_address_cells);
        let child_addr = to_num(child_addr)?;
        let parent_addr = to_num(parent_addr)?;
        let child_len = to_num(child_len)?;

        if child_addr <= addr && addr - child_addr < child_len {
            let translated = parent_addr.checked_add(addr - child_addr).ok_or_else(|| {
                ranges.error(format!("translation of {:#x} overflows", addr))
            })?;
            return translate(tree, translated, parent);
        }
    }

    Ok(addr)
}

/// Names for `count` entries from the `<ident>-names` property, or all
/// `None` if it is missing.
pub(crate) fn names(tree: &Tree, id: NodeId, ident: &str, count: usize) -> Result<Vec<Option<String>>> {
    let full = format!("{}-names", ident);
    let Some(prop) = tree.node(id).prop(&full) else {
        return Ok(vec![None; count]);
    };

    let names = prop.to_strings()?;
    if names.len() != count {
        return Err(Error::new(format!(
            "{} property in {} in {} has {} strings, expected {} strings",
            full,
            tree.node(id).path(),
            tree.filename().display(),
            names.len(),
            count
        )));
    }

    Ok(names.into_iter().map(Some).collect())
}

/// The node's interrupt parent: the target of the closest
/// `interrupt-parent`, looking at the node and then its ancestors.
pub(crate) fn interrupt_parent(tree: &Tree, start: NodeId) -> Result<NodeId> {
    let mut node = Some(start);

    while let Some(id) = node {
        if let Some(prop) = tree.node(id).prop("interrupt-parent") {
            return prop.to_node(tree);
        }
        node = tree.node(id).parent();
    }

    Err(Error::new(format!(
        "{} has an 'interrupts' property, but neither the node nor any of its parents has an \
         'interrupt-parent' property",
        repr(tree, start)
    )))
}

/// The node's interrupts, each mapped to its controller and the specifier
/// the controller sees.
pub(crate) fn interrupts(tree: &Tree, id: NodeId) -> Result<Vec<(NodeId, Vec<u8>)>> {
    let node = tree.node(id);

    if let Some(prop) = node.prop("interrupts-extended") {
        return phandle_val_list(tree, prop, "interrupt", true)?
            .into_iter()
            .map(|entry| {
                let Some((iparent, spec)) = entry else {
                    return Err(Error::new(format!(
                        "node '{}' interrupts-extended property has an empty element",
                        node.path()
                    )));
                };
                map_interrupt(tree, id, iparent, spec)
            })
            .collect();
    }

    if let Some(prop) = node.prop("interrupts") {
        let iparent = interrupt_parent(tree, id)?;
        let cells = interrupt_cells(tree, iparent)? as usize;
        return slice(prop, 4 * cells, "4*<#interrupt-cells>")?
            .into_iter()
            .map(|spec| map_interrupt(tree, id, iparent, spec.to_vec()))
            .collect();
    }

    Ok(Vec::new())
}

/// Splits a `<&ctrl cell...>, ...` value into controller and specifier
/// pairs, using the controller's `#<cells>-cells`. Entries with a zero or
/// unknown phandle give `None`. Without `strict`, a controller lacking the
/// cells property takes no cells.
pub(crate) fn phandle_val_list(
    tree: &Tree,
    prop: &Property,
    cells: &str,
    strict: bool,
) -> Result<Vec<Option<(NodeId, Vec<u8>)>>> {
    let cells_name = format!("#{}-cells", cells);
    let mut raw = prop.value();
    let mut entries = Vec::new();

    while !raw.is_empty() {
        if raw.len() < 4 {
            return Err(prop.error("bad value, truncated phandle"));
        }
        let phandle = be_u32(raw);
        raw = &raw[4..];

        let Some(controller) = tree.phandle2node().get(&phandle).copied() else {
            entries.push(None);
            continue;
        };

        let n_cells = match cells_prop(tree, controller, &cells_name)? {
            Some(n) => n as usize,
            None if strict => {
                return Err(Error::new(format!("{} lacks {}", repr(tree, controller), cells_name)))
            }
            None => 0,
        };
        if raw.len() < 4 * n_cells {
            return Err(prop.error("missing data after phandle"));
        }

        let (spec, rest) = raw.split_at(4 * n_cells);
        entries.push(Some((controller, spec.to_vec())));
        raw = rest;
    }

    Ok(entries)
}

/// Routes an interrupt specifier from `child` through `interrupt-map`s
/// until it reaches an interrupt controller.
pub(crate) fn map_interrupt(
    tree: &Tree,
    child: NodeId,
    parent: NodeId,
    child_spec: Vec<u8>,
) -> Result<(NodeId, Vec<u8>)> {
    if tree.node(parent).prop("interrupt-controller").is_some() {
        return Ok((parent, child_spec));
    }

    let own_address_cells = |id: NodeId| -> Result<usize> {
        cells_prop(tree, id, "#address-cells")?
            .map(|n| n as usize)
            .ok_or_else(|| {
                Error::new(format!(
                    "missing #address-cells on {} (while handling interrupt-map)",
                    repr(tree, id)
                ))
            })
    };
    let spec_len = |id: NodeId| -> Result<usize> {
        Ok(own_address_cells(id)? + interrupt_cells(tree, id)? as usize)
    };

    let mut spec = raw_unit_addr(tree, child)?;
    spec.extend_from_slice(&child_spec);

    let (controller, raw_spec) = map(tree, "interrupt", child, parent, spec, &spec_len, true)?;
    let skip = 4 * own_address_cells(controller)?;
    let data = raw_spec.get(skip..).ok_or_else(|| {
        Error::new(format!(
            "mapped interrupt specifier for {} is shorter than the unit address of {}",
            repr(tree, child),
            repr(tree, controller)
        ))
    })?;

    Ok((controller, data.to_vec()))
}

/// Routes a phandle-array specifier through `<basename>-map`s.
pub(crate) fn map_phandle_array_entry(
    tree: &Tree,
    child: NodeId,
    parent: NodeId,
    child_spec: Vec<u8>,
    basename: &str,
) -> Result<(NodeId, Vec<u8>)> {
    let cells_name = format!("#{}-cells", basename);
    let spec_len = |id: NodeId| -> Result<usize> {
        cells_prop(tree, id, &cells_name)?
            .map(|n| n as usize)
            .ok_or_else(|| {
                Error::new(format!(
                    "expected '{}' property on {} (referenced by {})",
                    cells_name,
                    repr(tree, id),
                    repr(tree, child)
                ))
            })
    };

    map(tree, basename, child, parent, child_spec, &spec_len, false)
}

/// Follows `<prefix>-map` rows from `parent` until a node without a map is
/// reached. Revisiting a nexus with the same specifier is a map loop.
fn map(
    tree: &Tree,
    prefix: &str,
    mut child: NodeId,
    mut parent: NodeId,
    mut child_spec: Vec<u8>,
    spec_len: &dyn Fn(NodeId) -> Result<usize>,
    require_controller: bool,
) -> Result<(NodeId, Vec<u8>)> {
    let mut seen: Vec<(NodeId, Vec<u8>)> = Vec::new();

    loop {
        let Some(map_prop) = tree.node(parent).prop(&format!("{}-map", prefix)) else {
            let controller = format!("{}-controller", prefix);
            if require_controller && tree.node(parent).prop(&controller).is_none() {
                return Err(Error::new(format!(
                    "expected '{}' property on {} (referenced by {})",
                    controller,
                    repr(tree, parent),
                    repr(tree, child)
                )));
            }
            return Ok((parent, child_spec));
        };

        if seen.iter().any(|(id, spec)| *id == parent && *spec == child_spec) {
            let path: Vec<&str> = seen.iter().map(|(id, _)| tree.node(*id).path()).collect();
            return Err(map_prop.error(format!(
                "map loop while routing the specifier of {} ({} -> {})",
                repr(tree, child),
                path.join(" -> "),
                tree.node(parent).path()
            )));
        }
        seen.push((parent, child_spec.clone()));

        let (map_parent, parent_spec) =
            map_row(tree, prefix, child, parent, map_prop, &child_spec, spec_len)?;
        child = parent;
        parent = map_parent;
        child_spec = parent_spec;
    }
}

/// The `<prefix>-map` row of `parent` that matches `child_spec`, with the
/// pass-thru bits applied to the parent specifier.
fn map_row(
    tree: &Tree,
    prefix: &str,
    child: NodeId,
    parent: NodeId,
    map_prop: &Property,
    child_spec: &[u8],
    spec_len: &dyn Fn(NodeId) -> Result<usize>,
) -> Result<(NodeId, Vec<u8>)> {
    let masked = mask(tree, prefix, parent, child_spec);
    let mut raw = map_prop.value();

    while !raw.is_empty() {
        if raw.len() < child_spec.len() {
            return Err(map_prop.error("bad value, missing/truncated child data"));
        }
        let (entry, rest) = raw.split_at(child_spec.len());
        raw = rest;

        if raw.len() < 4 {
            return Err(map_prop.error("bad value, missing/truncated phandle"));
        }
        let phandle = be_u32(raw);
        raw = &raw[4..];

        let Some(map_parent) = tree.phandle2node().get(&phandle).copied() else {
            return Err(map_prop.error(format!("bad phandle ({})", phandle)));
        };

        let parent_len = 4 * spec_len(map_parent)?;
        if raw.len() < parent_len {
            return Err(map_prop.error("bad value, missing/truncated parent data"));
        }
        let (parent_spec, rest) = raw.split_at(parent_len);
        raw = rest;

        if entry == masked.as_slice() {
            let parent_spec = pass_thru(tree, prefix, child, parent, child_spec, parent_spec)?;
            return Ok((map_parent, parent_spec));
        }
    }

    Err(map_prop.error(format!(
        "child specifier for {} ({:02x?}) does not appear",
        repr(tree, child),
        child_spec
    )))
}

/// `child_spec` AND'ed with `<prefix>-map-mask`. A shorter mask is
/// padded with ones on the left.
fn mask(tree: &Tree, prefix: &str, parent: NodeId, child_spec: &[u8]) -> Vec<u8> {
    match tree.node(parent).prop(&format!("{}-map-mask", prefix)) {
        Some(mask) => and(child_spec, mask.value()),
        None => child_spec.to_vec(),
    }
}

/// Copies the `<prefix>-map-pass-thru` bits of `child_spec` into
/// `parent_spec`.
fn pass_thru(
    tree: &Tree,
    prefix: &str,
    child: NodeId,
    parent: NodeId,
    child_spec: &[u8],
    parent_spec: &[u8],
) -> Result<Vec<u8>> {
    let name = format!("{}-map-pass-thru", prefix);
    let Some(prop) = tree.node(parent).prop(&name) else {
        return Ok(parent_spec.to_vec());
    };

    let pass_thru = prop.value();
    if pass_thru.len() != child_spec.len() {
        return Err(Error::new(format!(
            "{}: expected '{}' in {} to be {} bytes, is {} bytes",
            repr(tree, child),
            name,
            repr(tree, parent),
            child_spec.len(),
            pass_thru.len()
        )));
    }

    let res = or(&and(child_spec, pass_thru), &and(parent_spec, &not(pass_thru)));
    Ok(res[res.len().saturating_sub(parent_spec.len())..].to_vec())
}

/// The first `#address-cells` cells of the node's `reg`, which prefix its
/// specifiers in an `interrupt-map`.
fn raw_unit_addr(tree: &Tree, id: NodeId) -> Result<Vec<u8>> {
    let len = 4 * address_cells(tree, id)? as usize;
    if len == 0 {
        return Ok(Vec::new());
    }

    let Some(reg) = tree.node(id).prop("reg") else {
        return Err(Error::new(format!(
            "{} lacks 'reg' property (needed for 'interrupt-map' unit address lookup)",
            repr(tree, id)
        )));
    };
    reg.value().get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
        Error::new(format!(
            "{} has too short 'reg' property (while doing 'interrupt-map' unit address lookup)",
            repr(tree, id)
        ))
    })
}

fn pad(b: &[u8], len: usize, fill: u8) -> Vec<u8> {
    let mut padded = vec![fill; len - b.len()];
    padded.extend_from_slice(b);
    padded
}

fn and(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    pad(a, len, 0xff)
        .iter()
        .zip(pad(b, len, 0xff))
        .map(|(x, y)| x & y)
        .collect()
}

fn or(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    pad(a, len, 0)
        .iter()
        .zip(pad(b, len, 0))
        .map(|(x, y)| x | y)
        .collect()
}

fn not(b: &[u8]) -> Vec<u8> {
    b.iter().map(|x| !x).collect()
}

#[cfg(test)]
mod tests {
    use dts_parser::ParseOptions;

    use super::*;

    fn tree(source: &str) -> Tree {
        Tree::from_source(source, "test.dts", &ParseOptions::default()).unwrap()
    }

    #[test]
    fn byte_ops_pad_on_the_left() {
        assert_eq!(and(&[0x12, 0x34], &[0x0f]), [0x12, 0x04]);
        assert_eq!(or(&[0x10], &[0x01, 0x02]), [0x01, 0x12]);
        assert_eq!(not(&[0x0f, 0xff]), [0xf0, 0x00]);
    }

    #[test]
    fn translate_through_ranges() {
        let t = tree(
            r#"/dts-v1/;
            / {
                #address-cells = <1>;
                #size-cells = <1>;
                soc {
                    #address-cells = <1>;
                    #size-cells = <1>;
                    ranges = <0x0 0x40000000 0x10000>;
                    bus {
                        #address-cells = <1>;
                        #size-cells = <1>;
                        ranges;
                        dev@100 { reg = <0x100 0x10>; };
                    };
                    out@20000 { reg = <0x20000 0x10>; };
                };
            };"#,
        );

        let dev = t.get_node("/soc/bus/dev@100").unwrap();
        assert_eq!(translate(&t, 0x100, dev).unwrap(), 0x4000_0100);

        let out = t.get_node("/soc/out@20000").unwrap();
        assert_eq!(translate(&t, 0x20000, out).unwrap(), 0x20000);
    }

    #[test]
    fn cells_defaults() {
        let t = tree("/dts-v1/; / { a { b { }; }; };");
        let b = t.get_node("/a/b").unwrap();

        assert_eq!(address_cells(&t, b).unwrap(), 2);
        assert_eq!(size_cells(&t, b).unwrap(), 1);
        assert!(interrupt_cells(&t, b)
            .unwrap_err()
            .message()
            .contains("lacks #interrupt-cells"));
    }

    #[test]
    fn interrupt_map_with_mask_and_pass_thru() {
        let t = tree(
            r#"/dts-v1/;
            / {
                #address-cells = <1>;
                #size-cells = <1>;
                intc: intc {
                    interrupt-controller;
                    #address-cells = <0>;
                    #interrupt-cells = <2>;
                };
                nexus {
                    #address-cells = <1>;
                    #size-cells = <1>;
                    #interrupt-cells = <1>;
                    interrupt-map-mask = <0xf000 0xf>;
                    interrupt-map = <0x1000 0x1 &intc 5 0>, <0x2000 0x1 &intc 6 0>;
                    interrupt-map-pass-thru = <0x0 0x0>;
                    dev@2000 {
                        reg = <0x2000 0x10>;
                        interrupt-parent = <&{/nexus}>;
                        interrupts = <0x11>;
                    };
                };
            };"#,
        );

        let dev = t.get_node("/nexus/dev@2000").unwrap();
        let intc = t.get_node("/intc").unwrap();
        assert_eq!(
            interrupts(&t, dev).unwrap(),
            [(intc, vec![0, 0, 0, 6, 0, 0, 0, 0])]
        );
    }

    #[test]
    fn unmatched_specifier_is_an_error() {
        let t = tree(
            r#"/dts-v1/;
            / {
                intc: intc { interrupt-controller; #address-cells = <0>; #interrupt-cells = <1>; };
                nexus {
                    #address-cells = <0>;
                    #interrupt-cells = <1>;
                    interrupt-map = <1 &intc 10>;
                    dev { interrupt-parent = <&{/nexus}>; interrupts = <2>; };
                };
            };"#,
        );

        let dev = t.get_node("/nexus/dev").unwrap();
        let err = interrupts(&t, dev).unwrap_err();
        assert!(err.message().contains("does not appear"), "{}", err);
    }

    #[test]
    fn map_loops_are_errors() {
        let tests = [
            (
                r#"/dts-v1/;
                / {
                    #address-cells = <1>;
                    #size-cells = <1>;
                    nexus: nexus {
                        #address-cells = <1>;
                        #size-cells = <1>;
                        #interrupt-cells = <1>;
                        interrupt-map = <0x2000 0x1 &nexus 0x2000 0x1>;
                        dev@2000 {
                            reg = <0x2000 0x10>;
                            interrupt-parent = <&nexus>;
                            interrupts = <0x1>;
                        };
                    };
                };"#,
                "/nexus/dev@2000",
                "/nexus -> /nexus",
            ),
            (
                r#"/dts-v1/;
                / {
                    a: a {
                        #address-cells = <0>;
                        #interrupt-cells = <1>;
                        interrupt-map = <1 &b 2>;
                        dev { interrupt-parent = <&a>; interrupts = <1>; };
                    };
                    b: b {
                        #address-cells = <0>;
                        #interrupt-cells = <1>;
                        interrupt-map = <2 &a 1>;
                    };
                };"#,
                "/a/dev",
                "/a -> /b -> /a",
            ),
        ];

        for (source, path, route) in tests {
            let t = tree(source);
            let dev = t.get_node(path).unwrap();
            let err = interrupts(&t, dev).unwrap_err();
            assert!(err.message().contains("map loop"), "{}", err);
            assert!(err.message().contains(route), "{}", err);
        }
    }

    #[test]
    fn phandle_lists() {
        let t = tree(
            r#"/dts-v1/;
            / {
                a: a { #gpio-cells = <2>; };
                b: b { };
                n { gpios = <&a 1 2 0 &b>; };
            };"#,
        );

        let n = t.node(t.get_node("/n").unwrap());
        let a = t.get_node("/a").unwrap();
        let b = t.get_node("/b").unwrap();
        let list = phandle_val_list(&t, n.prop("gpios").unwrap(), "gpio", false).unwrap();
        assert_eq!(
            list,
            [
                Some((a, vec![0, 0, 0, 1, 0, 0, 0, 2])),
                None,
                Some((b, vec![])),
            ]
        );

        let err = phandle_val_list(&t, n.prop("gpios").unwrap(), "gpio", true).unwrap_err();
        assert!(err.message().contains("lacks #gpio-cells"), "{}", err);
    }
}
