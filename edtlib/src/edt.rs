//! Building the extended devicetree.
//!
//! Nodes are created in two passes over the raw tree in depth-first order.
//! The first pass settles everything that only depends on a node's ancestors:
//! bus, binding, status, `reg` and `ranges`. The second pass decodes the
//! properties, which may reference any node.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use dts_parser::{
    property::be_u32, Error, NodeId, ParseOptions, Property as RawProperty,
    PropertyType as RawType, Result, Tree,
};
use indexmap::{IndexMap, IndexSet};
use serde_yaml::Value;

use crate::{
    addr::{self, repr},
    binding::{show, Binding, PropType, PropertySpec, STATUS_VALUES},
    graph::Graph,
    node::{ControllerAndData, Node, NodeIndex, PinCtrl, Property, PropertyValue, Range, Register},
    options::EdtOptions,
    registry::{display_path, BindingRegistry},
};

/// Types of the standard properties, used for nodes without a binding.
const DEFAULT_PROP_TYPES: [(&str, PropType); 10] = [
    ("compatible", PropType::StringArray),
    ("status", PropType::String),
    ("ranges", PropType::Compound),
    ("reg", PropType::Array),
    ("reg-names", PropType::StringArray),
    ("label", PropType::String),
    ("interrupts", PropType::Array),
    ("interrupts-extended", PropType::Compound),
    ("interrupt-names", PropType::StringArray),
    ("interrupt-controller", PropType::Boolean),
];

/// Properties a binding does not have to declare.
const IMPLICIT_PROPS: [&str; 7] = [
    "compatible",
    "status",
    "ranges",
    "phandle",
    "interrupt-parent",
    "interrupts-extended",
    "device_type",
];

const COMPAT_PATTERN: &str = r"^[a-zA-Z][a-zA-Z0-9,+\-._]+$";

/// A devicetree with every node typed by its binding.
#[derive(Debug, Clone)]
pub struct Edt {
    dts_path: PathBuf,
    bindings_dirs: Vec<PathBuf>,
    tree: Tree,
    registry: BindingRegistry,
    nodes: Vec<Node>,
    raw2node: HashMap<NodeId, NodeIndex>,
    graph: Graph,
    scc_order: Vec<Vec<NodeIndex>>,
    compat2nodes: IndexMap<String, Vec<NodeIndex>>,
    compat2okay: IndexMap<String, Vec<NodeIndex>>,
    compat2notokay: IndexMap<String, Vec<NodeIndex>>,
    compat2vendor: IndexMap<String, String>,
    compat2model: IndexMap<String, String>,
    label2node: IndexMap<String, NodeIndex>,
    dep_ord2node: IndexMap<usize, NodeIndex>,
    warnings: Vec<String>,
}

impl Edt {
    /// Parses the DTS file at `dts_path` and types it with the bindings
    /// found below `bindings_dirs`.
    pub fn new(
        dts_path: impl AsRef<Path>,
        bindings_dirs: &[PathBuf],
        options: &EdtOptions,
    ) -> Result<Edt> {
        let parse_options = ParseOptions {
            include_path: options.include_path.clone(),
            force: false,
        };
        let tree = Tree::from_file(dts_path, &parse_options)?;

        Edt::from_tree(tree, bindings_dirs, options)
    }

    /// Types an already parsed tree.
    pub fn from_tree(tree: Tree, bindings_dirs: &[PathBuf], options: &EdtOptions) -> Result<Edt> {
        check_tree(&tree)?;

        let compats = tree_compats(&tree)?;
        let registry = BindingRegistry::from_dirs(bindings_dirs, &compats)?;
        log::debug!(
            "{} binding files, {} bindings in use",
            registry.paths().len(),
            registry.compat2binding().len()
        );

        Builder::new(tree, registry, bindings_dirs, options).build()
    }

    pub fn dts_path(&self) -> &Path {
        &self.dts_path
    }

    pub fn bindings_dirs(&self) -> &[PathBuf] {
        &self.bindings_dirs
    }

    /// The node at `path`, which may start with an alias.
    pub fn get_node(&self, path: &str) -> Result<&Node> {
        let id = self.tree.get_node(path)?;
        Ok(self.node(self.enode(id)?))
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.get_node(path).is_ok()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0]
    }

    /// Every node, in depth-first source order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn parent(&self, index: NodeIndex) -> Option<&Node> {
        self.node(index).parent().map(|p| self.node(p))
    }

    pub fn children(&self, index: NodeIndex) -> impl Iterator<Item = &Node> {
        self.node(index).children().values().map(|c| self.node(*c))
    }

    /// The nodes named by the properties of `/chosen`. Properties that are
    /// not a path or phandle to an existing node are left out.
    pub fn chosen_nodes(&self) -> IndexMap<String, &Node> {
        let Ok(chosen) = self.tree.get_node("/chosen") else {
            return IndexMap::new();
        };

        self.tree
            .node(chosen)
            .props()
            .iter()
            .filter_map(|(name, prop)| {
                let target = prop.to_path(&self.tree).ok()?;
                let index = self.raw2node.get(&target)?;
                Some((name.clone(), self.node(*index)))
            })
            .collect()
    }

    pub fn chosen_node(&self, name: &str) -> Option<&Node> {
        self.chosen_nodes().shift_remove(name)
    }

    /// Nodes per compatible, enabled ones first.
    pub fn compat2nodes(&self) -> &IndexMap<String, Vec<NodeIndex>> {
        &self.compat2nodes
    }

    pub fn compat2okay(&self) -> &IndexMap<String, Vec<NodeIndex>> {
        &self.compat2okay
    }

    pub fn compat2notokay(&self) -> &IndexMap<String, Vec<NodeIndex>> {
        &self.compat2notokay
    }

    /// Vendor names of `vendor,model` compatibles with a known prefix.
    pub fn compat2vendor(&self) -> &IndexMap<String, String> {
        &self.compat2vendor
    }

    pub fn compat2model(&self) -> &IndexMap<String, String> {
        &self.compat2model
    }

    pub fn label2node(&self) -> &IndexMap<String, NodeIndex> {
        &self.label2node
    }

    /// First node of each dependency ordinal.
    pub fn dep_ord2node(&self) -> &IndexMap<usize, NodeIndex> {
        &self.dep_ord2node
    }

    /// Strongly connected components of the dependency graph, with every
    /// component after the ones it depends on.
    pub fn scc_order(&self) -> &[Vec<NodeIndex>] {
        &self.scc_order
    }

    pub fn depends_on(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph.depends_on(index)
    }

    pub fn required_by(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph.required_by(index)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The tree as canonical DTS, after merging and deletions.
    pub fn dts_source(&self) -> String {
        self.tree.to_string()
    }

    /// Warnings emitted while building.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    fn enode(&self, id: NodeId) -> Result<NodeIndex> {
        self.raw2node
            .get(&id)
            .copied()
            .ok_or_else(|| Error::new(format!("{} is not part of the tree", repr(&self.tree, id))))
    }
}

impl fmt::Display for Edt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EDT for '{}', binding directories '{:?}'>",
            self.dts_path.display(),
            self.bindings_dirs
        )
    }
}

/// Warnings, turned into errors under `werror`.
struct Diagnostics<'o> {
    options: &'o EdtOptions,
    warnings: Vec<String>,
}

impl Diagnostics<'_> {
    fn warn(&mut self, message: String) -> Result<()> {
        if self.options.werror {
            return Err(Error::new(message));
        }

        self.options.reporter.warn(&message);
        self.warnings.push(message);
        Ok(())
    }
}

struct Builder<'o> {
    edt: Edt,
    options: &'o EdtOptions,
}

impl<'o> Builder<'o> {
    fn new(
        tree: Tree,
        registry: BindingRegistry,
        bindings_dirs: &[PathBuf],
        options: &'o EdtOptions,
    ) -> Self {
        let edt = Edt {
            dts_path: tree.filename().to_path_buf(),
            bindings_dirs: bindings_dirs.to_vec(),
            tree,
            registry,
            nodes: Vec::new(),
            raw2node: HashMap::new(),
            graph: Graph::new(),
            scc_order: Vec::new(),
            compat2nodes: IndexMap::new(),
            compat2okay: IndexMap::new(),
            compat2notokay: IndexMap::new(),
            compat2vendor: IndexMap::new(),
            compat2model: IndexMap::new(),
            label2node: IndexMap::new(),
            dep_ord2node: IndexMap::new(),
            warnings: Vec::new(),
        };

        Self { edt, options }
    }

    fn build(mut self) -> Result<Edt> {
        let mut diag = Diagnostics {
            options: self.options,
            warnings: Vec::new(),
        };

        self.init_nodes()?;
        for i in 0..self.edt.nodes.len() {
            let index = NodeIndex(i);
            let props = self.props(index, &mut diag)?;
            self.edt.nodes[i].props = props;
            self.edt.nodes[i].interrupts = self.interrupts(index)?;
            self.edt.nodes[i].pinctrls = self.pinctrls(index)?;
            self.edt.nodes[i].gpio_hogs = self.gpio_hogs(index)?;
        }
        log::debug!("built {} nodes", self.edt.nodes.len());

        if self.options.warn_reg_unit_address_mismatch {
            self.check_unit_addrs(&mut diag)?;
        }
        self.init_graph();
        self.init_luts(&mut diag)?;
        self.check_enums(&mut diag)?;

        self.edt.warnings = diag.warnings;
        Ok(self.edt)
    }

    fn tree(&self) -> &Tree {
        &self.edt.tree
    }

    fn node(&self, index: NodeIndex) -> &Node {
        &self.edt.nodes[index.0]
    }

    fn init_nodes(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.tree().node_iter().collect();

        for id in ids {
            let index = NodeIndex(self.edt.nodes.len());
            let node = self.new_node(index, id)?;
            log::trace!("{}", node);

            if let Some(parent) = node.parent {
                self.edt.nodes[parent.0]
                    .children
                    .insert(node.name.clone(), index);
            }
            self.edt.raw2node.insert(id, index);
            self.edt.nodes.push(node);
        }

        Ok(())
    }

    /// Everything about a node that only depends on its ancestors.
    fn new_node(&self, index: NodeIndex, id: NodeId) -> Result<Node> {
        let tree = self.tree();
        let raw = tree.node(id);

        let compats = match raw.prop("compatible") {
            Some(prop) => prop.to_strings()?,
            None => Vec::new(),
        };

        let parent = match raw.parent() {
            Some(p) => Some(self.edt.enode(p)?),
            None => None,
        };
        let parent_node = parent.map(|p| self.node(p));

        let bus_node = match parent_node {
            None => None,
            Some(_)
                if self.options.support_fixed_partitions_on_any_bus
                    && compats.iter().any(|c| c == "fixed-partitions") =>
            {
                None
            }
            Some(p) if !p.buses().is_empty() => Some(p.index),
            Some(p) => p.bus_node,
        };
        let on_buses = bus_node.map_or_else(Vec::new, |b| self.node(b).buses().to_vec());

        let (binding, matching_compat) = if self.options.infer_binding_for_paths.contains(raw.path()) {
            if !compats.is_empty() {
                return Err(Error::new(format!(
                    "compatible in node with inferred binding: {}",
                    raw.path()
                )));
            }
            (Some(Arc::new(inferred_binding(tree, id)?)), None)
        } else if !compats.is_empty() {
            self.match_compats(&compats, &on_buses)
        } else {
            let binding = parent_node
                .and_then(|p| p.binding.as_ref())
                .and_then(|b| b.child_binding())
                .cloned();
            let matching_compat = binding
                .as_ref()
                .and_then(|b| b.compatible())
                .map(str::to_string);
            (binding, matching_compat)
        };

        let status = match raw.prop("status") {
            Some(prop) => prop.to_string()?,
            None => "okay".to_string(),
        };
        let status = if status == "ok" { "okay".to_string() } else { status };

        let is_pci_device = on_buses.iter().any(|b| b == "pcie");
        let unit_addr = match raw.name().split_once('@') {
            Some(_) if is_pci_device => None,
            Some((_, unit)) if unit.contains(',') => None,
            Some((_, unit)) => {
                let addr = u128::from_str_radix(unit, 16).map_err(|_| {
                    Error::new(format!("{} has non-hex unit address", repr(tree, id)))
                })?;
                Some(addr::translate(tree, addr, id)?)
            }
            None => None,
        };

        let aliases = tree
            .alias2node()
            .iter()
            .filter(|(_, target)| **target == id)
            .map(|(alias, _)| alias.clone())
            .collect();

        Ok(Node {
            index,
            raw: id,
            name: raw.name().to_string(),
            path: raw.path().to_string(),
            parent,
            children: IndexMap::new(),
            labels: raw.labels().to_vec(),
            aliases,
            compats,
            matching_compat,
            binding,
            bus_node,
            on_buses,
            unit_addr,
            status,
            read_only: raw.prop("read-only").is_some(),
            label: raw.prop("label").map(RawProperty::to_string).transpose()?,
            props: IndexMap::new(),
            regs: regs(tree, id, index, is_pci_device)?,
            ranges: ranges(tree, id, index)?,
            interrupts: Vec::new(),
            pinctrls: Vec::new(),
            gpio_hogs: Vec::new(),
            dep_ordinal: 0,
        })
    }

    /// The binding of the first compatible that has one, preferring a
    /// binding for the bus the node is on.
    fn match_compats(
        &self,
        compats: &[String],
        on_buses: &[String],
    ) -> (Option<Arc<Binding>>, Option<String>) {
        let registry = &self.edt.registry;

        for compat in compats {
            let hit = on_buses
                .iter()
                .find_map(|bus| registry.get(compat, Some(bus)))
                .or_else(|| registry.get(compat, None));

            if let Some(binding) = hit {
                return (Some(binding.clone()), Some(compat.clone()));
            }
        }

        (None, None)
    }

    fn props(&self, index: NodeIndex, diag: &mut Diagnostics) -> Result<IndexMap<String, Property>> {
        let node = self.node(index);
        let raw = self.tree().node(node.raw);
        let mut props = IndexMap::new();

        let specs = node
            .binding
            .as_ref()
            .map(|b| b.prop2specs())
            .filter(|specs| !specs.is_empty());

        if let Some(specs) = specs {
            for spec in specs.values() {
                let Some(value) = self.prop_val(node, spec, diag)? else {
                    continue;
                };
                self.check_value(node, spec, &value)?;

                let name = spec.name();
                if name.starts_with('#') || name.ends_with("-map") {
                    continue;
                }
                props.insert(
                    name.to_string(),
                    Property {
                        spec: spec.clone(),
                        value,
                        node: index,
                    },
                );
            }
            self.check_undeclared(node)?;
        } else if self.options.default_prop_types {
            for name in raw.props().keys() {
                let Some((_, type_)) = DEFAULT_PROP_TYPES.iter().find(|(n, _)| *n == name.as_str()) else {
                    continue;
                };
                let spec = Arc::new(PropertySpec::standard(name, *type_));
                if let Some(value) = self.prop_val(node, &spec, diag)? {
                    props.insert(
                        name.clone(),
                        Property {
                            spec,
                            value,
                            node: index,
                        },
                    );
                }
            }
        }

        Ok(props)
    }

    /// Decodes the property `spec` describes. `None` for an absent property
    /// without a default, and for `compound` properties.
    fn prop_val(
        &self,
        node: &Node,
        spec: &PropertySpec,
        diag: &mut Diagnostics,
    ) -> Result<Option<PropertyValue>> {
        let tree = self.tree();
        let name = spec.name();

        let Some(prop) = tree.node(node.raw).prop(name) else {
            if spec.required() && node.enabled() {
                return Err(Error::new(format!(
                    "'{}' is marked as required in 'properties:' in {}, but does not appear in {}",
                    name,
                    display_path(node.binding_path()),
                    repr(tree, node.raw)
                )));
            }
            if let Some(default) = spec.default() {
                return Ok(Some(default.clone()));
            }
            return Ok((spec.type_() == PropType::Boolean).then_some(PropertyValue::Bool(false)));
        };

        if spec.deprecated() {
            diag.warn(format!(
                "'{}' is marked as deprecated in 'properties:' in {} for node {}.",
                name,
                display_path(node.binding_path()),
                node.path
            ))?;
        }

        let value = match spec.type_() {
            PropType::Boolean => {
                if prop.type_() != RawType::Empty {
                    return Err(Error::new(format!(
                        "'{0}' in {1} is defined with 'type: boolean' in {2}, but is assigned a \
                         value ('{3}') instead of being empty ('{0};')",
                        name,
                        repr(tree, node.raw),
                        display_path(node.binding_path()),
                        prop
                    )));
                }
                PropertyValue::Bool(true)
            }
            PropType::Int => PropertyValue::Int(i64::from(prop.to_num()?)),
            PropType::Array => {
                PropertyValue::Array(prop.to_nums()?.into_iter().map(i64::from).collect())
            }
            PropType::Uint8Array => PropertyValue::Bytes(prop.to_bytes()?.to_vec()),
            PropType::String => PropertyValue::String(prop.to_string()?),
            PropType::StringArray => PropertyValue::Strings(prop.to_strings()?),
            PropType::Phandle => PropertyValue::Phandle(self.edt.enode(prop.to_node(tree)?)?),
            PropType::Phandles => PropertyValue::Phandles(
                prop.to_nodes(tree)?
                    .into_iter()
                    .map(|id| self.edt.enode(id))
                    .collect::<Result<_>>()?,
            ),
            PropType::PhandleArray => {
                if !matches!(
                    prop.type_(),
                    RawType::Phandle | RawType::Phandles | RawType::PhandlesAndNums
                ) {
                    return Err(Error::new(format!(
                        "expected property '{0}' in {1} in {2} to be assigned with \
                         '{0} = < &foo ... &bar 1 ... &baz 2 3 >' (a mix of phandles and \
                         numbers), not '{3}'",
                        name,
                        node.path,
                        tree.filename().display(),
                        prop
                    )));
                }
                PropertyValue::PhandleArray(self.phandle_array(node, prop, spec.specifier_space())?)
            }
            PropType::Path => PropertyValue::Path(self.edt.enode(prop.to_path(tree)?)?),
            PropType::Compound => return Ok(None),
        };

        Ok(Some(value))
    }

    fn check_value(&self, node: &Node, spec: &PropertySpec, value: &PropertyValue) -> Result<()> {
        let dts_path = self.edt.dts_path.display();

        if let Some(choices) = spec.enum_().filter(|c| !c.is_empty()) {
            let allowed = choices
                .iter()
                .any(|c| PropertyValue::from_yaml(spec.type_(), c).as_ref() == Some(value));
            if !allowed {
                return Err(Error::new(format!(
                    "value of property '{}' on {} in {} ({}) is not in 'enum' list in {} ({})",
                    spec.name(),
                    node.path,
                    dts_path,
                    value,
                    display_path(node.binding_path()),
                    show(&Value::Sequence(choices.to_vec()))
                )));
            }
        }

        if let Some(const_) = spec.const_() {
            if const_ != value {
                return Err(Error::new(format!(
                    "value of property '{}' on {} in {} ({}) is different from the 'const' value \
                     specified in {} ({})",
                    spec.name(),
                    node.path,
                    dts_path,
                    value,
                    display_path(node.binding_path()),
                    const_
                )));
            }
        }

        Ok(())
    }

    fn check_undeclared(&self, node: &Node) -> Result<()> {
        let Some(binding) = &node.binding else {
            return Ok(());
        };

        for name in self.tree().node(node.raw).props().keys() {
            if name.ends_with("-controller")
                || name.starts_with('#')
                || IMPLICIT_PROPS.contains(&name.as_str())
            {
                continue;
            }

            if !binding.prop2specs().contains_key(name) {
                return Err(Error::new(format!(
                    "'{}' appears in {} in {}, but is not declared in 'properties:' in {}",
                    name,
                    node.path,
                    self.edt.dts_path.display(),
                    display_path(binding.path())
                )));
            }
        }

        Ok(())
    }

    /// Decodes `<&ctrl cell...>, ...` using each controller's
    /// `#<space>-cells`, following `<space>-map`s.
    fn phandle_array(
        &self,
        node: &Node,
        prop: &RawProperty,
        specifier_space: Option<&str>,
    ) -> Result<Vec<Option<ControllerAndData>>> {
        let tree = self.tree();
        let name = prop.name();
        let space = match specifier_space {
            Some(space) => space.to_string(),
            // foo-gpios uses #gpio-cells, not #foo-gpio-cells
            None if name.ends_with("gpios") => "gpio".to_string(),
            None => name.strip_suffix('s').unwrap_or(name).to_string(),
        };

        let mut entries = Vec::new();
        for entry in addr::phandle_val_list(tree, prop, &space, false)? {
            let Some((controller, data)) = entry else {
                entries.push(None);
                continue;
            };

            let (controller, data) =
                addr::map_phandle_array_entry(tree, prop.node(), controller, data, &space)?;
            let controller = self.edt.enode(controller)?;
            entries.push(Some(ControllerAndData {
                node: node.index,
                controller,
                data: self.named_cells(node, controller, &data, &space)?,
                name: None,
                basename: Some(space.clone()),
            }));
        }

        let names = addr::names(tree, node.raw, &space, entries.len())?;
        for (entry, name) in entries.iter_mut().zip(names) {
            if let Some(entry) = entry {
                entry.name = name;
            }
        }

        Ok(entries)
    }

    /// Names the cells of a specifier after the controller binding's
    /// `<basename>-cells`. Controllers that don't name them get the cell
    /// indices.
    fn named_cells(
        &self,
        node: &Node,
        controller: NodeIndex,
        data: &[u8],
        basename: &str,
    ) -> Result<IndexMap<String, u32>> {
        let cells: Vec<u32> = data.chunks_exact(4).map(be_u32).collect();
        let controller = self.node(controller);
        let names = controller
            .binding
            .as_ref()
            .and_then(|b| b.specifier2cells().get(basename));

        let Some(names) = names else {
            return Ok(cells
                .into_iter()
                .enumerate()
                .map(|(i, cell)| (i.to_string(), cell))
                .collect());
        };

        if names.len() != cells.len() {
            return Err(Error::new(format!(
                "unexpected '{}-cells:' length in binding for {} - {} instead of {} (needed by {})",
                basename,
                repr(self.tree(), controller.raw),
                names.len(),
                cells.len(),
                node.path
            )));
        }

        Ok(names.iter().cloned().zip(cells).collect())
    }

    fn interrupts(&self, index: NodeIndex) -> Result<Vec<ControllerAndData>> {
        let node = self.node(index);
        let tree = self.tree();

        let mut interrupts = Vec::new();
        for (controller, data) in addr::interrupts(tree, node.raw)? {
            let controller = self.edt.enode(controller)?;
            interrupts.push(ControllerAndData {
                node: index,
                controller,
                data: self.named_cells(node, controller, &data, "interrupt")?,
                name: None,
                basename: None,
            });
        }

        let names = addr::names(tree, node.raw, "interrupt", interrupts.len())?;
        for (interrupt, name) in interrupts.iter_mut().zip(names) {
            interrupt.name = name;
        }

        Ok(interrupts)
    }

    fn pinctrls(&self, index: NodeIndex) -> Result<Vec<PinCtrl>> {
        let node = self.node(index);
        let tree = self.tree();
        let raw = tree.node(node.raw);

        let mut props: Vec<(usize, &RawProperty)> = raw
            .props()
            .iter()
            .filter_map(|(name, prop)| {
                let suffix = name.strip_prefix("pinctrl-")?;
                if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some((suffix.parse().ok()?, prop))
            })
            .collect();
        props.sort_by_key(|(i, _)| *i);

        let mut pinctrls = Vec::new();
        for (i, (_, prop)) in props.into_iter().enumerate() {
            if prop.name() != format!("pinctrl-{}", i) {
                return Err(Error::new(format!(
                    "missing 'pinctrl-{}' property on {} - indices should be contiguous and \
                     start from zero",
                    i,
                    repr(tree, node.raw)
                )));
            }

            pinctrls.push(PinCtrl {
                node: index,
                name: None,
                conf_nodes: prop
                    .to_nodes(tree)?
                    .into_iter()
                    .map(|id| self.edt.enode(id))
                    .collect::<Result<_>>()?,
            });
        }

        let names = addr::names(tree, node.raw, "pinctrl", pinctrls.len())?;
        for (pinctrl, name) in pinctrls.iter_mut().zip(names) {
            pinctrl.name = name;
        }

        Ok(pinctrls)
    }

    fn gpio_hogs(&self, index: NodeIndex) -> Result<Vec<ControllerAndData>> {
        let node = self.node(index);
        let tree = self.tree();
        let raw = tree.node(node.raw);

        if raw.prop("gpio-hog").is_none() {
            return Ok(Vec::new());
        }

        let Some(parent) = node
            .parent
            .filter(|p| tree.node(self.node(*p).raw).prop("gpio-controller").is_some())
        else {
            return Err(Error::new(format!(
                "GPIO hog {} lacks parent GPIO controller node",
                repr(tree, node.raw)
            )));
        };
        let Some(cells) = tree.node(self.node(parent).raw).prop("#gpio-cells") else {
            return Err(Error::new(format!(
                "GPIO hog {} parent node lacks #gpio-cells",
                repr(tree, node.raw)
            )));
        };
        let n_cells = cells.to_num()? as usize;

        let Some(gpios) = raw.prop("gpios") else {
            return Err(Error::new(format!(
                "GPIO hog {} lacks 'gpios' property",
                repr(tree, node.raw)
            )));
        };

        let hint = format!("4*(<#gpio-cells> (= {}))", n_cells);
        addr::slice(gpios, 4 * n_cells, &hint)?
            .into_iter()
            .map(|spec| -> Result<ControllerAndData> {
                Ok(ControllerAndData {
                    node: index,
                    controller: parent,
                    data: self.named_cells(node, parent, spec, "gpio")?,
                    name: None,
                    basename: Some("gpio".to_string()),
                })
            })
            .collect()
    }

    fn check_unit_addrs(&self, diag: &mut Diagnostics) -> Result<()> {
        for node in &self.edt.nodes {
            let Some(first) = node.regs.first() else {
                continue;
            };
            let dev_func = node
                .name
                .split_once('@')
                .is_some_and(|(_, unit)| unit.contains(','));
            if node.is_pci_device() || dev_func || first.addr == node.unit_addr {
                continue;
            }

            let addr = first
                .addr
                .map_or_else(|| "None".to_string(), |a| format!("{:#x}", a));
            diag.warn(format!(
                "unit address and first address in 'reg' ({}) don't match for {}",
                addr, node.path
            ))?;
        }

        Ok(())
    }

    fn init_graph(&mut self) {
        let mut graph = Graph::new();

        for node in &self.edt.nodes {
            graph.add_node(node.index);
        }
        for node in &self.edt.nodes {
            for child in node.children.values() {
                graph.add_edge(*child, node.index);
            }
            self.add_prop_edges(&mut graph, node.index, node);
        }

        let scc_order = graph.scc_order();
        for (ordinal, component) in scc_order.iter().enumerate() {
            for index in component {
                self.edt.nodes[index.0].dep_ordinal = ordinal;
            }
            self.edt.dep_ord2node.insert(ordinal, component[0]);
        }

        self.edt.graph = graph;
        self.edt.scc_order = scc_order;
    }

    /// Adds edges from `root` to everything `node` references. Children
    /// described by the node's child binding count as part of it.
    fn add_prop_edges(&self, graph: &mut Graph, root: NodeIndex, node: &Node) {
        for prop in node.props.values() {
            match &prop.value {
                PropertyValue::Phandle(target) => graph.add_edge(root, *target),
                PropertyValue::Phandles(targets) => {
                    for target in targets {
                        graph.add_edge(root, *target);
                    }
                }
                PropertyValue::PhandleArray(entries) => {
                    for entry in entries.iter().flatten() {
                        graph.add_edge(root, entry.controller);
                    }
                }
                _ => {}
            }
        }

        for interrupt in &node.interrupts {
            graph.add_edge(root, interrupt.controller);
        }

        if node.has_child_binding() {
            for child in node.children.values() {
                let child = self.node(*child);
                if child.compats.is_empty() {
                    self.add_prop_edges(graph, root, child);
                }
            }
        }
    }

    fn init_luts(&mut self, diag: &mut Diagnostics) -> Result<()> {
        let mut checked = HashSet::new();

        for node in &self.edt.nodes {
            for label in &node.labels {
                self.edt.label2node.insert(label.clone(), node.index);
            }

            for compat in &node.compats {
                self.edt
                    .compat2nodes
                    .entry(compat.clone())
                    .or_default()
                    .push(node.index);
                let by_status = if node.enabled() {
                    &mut self.edt.compat2okay
                } else {
                    &mut self.edt.compat2notokay
                };
                by_status
                    .entry(compat.clone())
                    .or_default()
                    .push(node.index);

                if !checked.insert(compat.as_str()) {
                    continue;
                }

                if !valid_compat(compat) {
                    return Err(Error::new(format!(
                        "node '{}' compatible '{}' must match this regular expression: '{}'",
                        node.path, compat, COMPAT_PATTERN
                    )));
                }

                let vendor_prefixes = &self.options.vendor_prefixes;
                let Some((vendor, model)) = compat.split_once(',') else {
                    continue;
                };
                if vendor_prefixes.is_empty() {
                    continue;
                }

                match vendor_prefixes.get(vendor) {
                    Some(name) => {
                        self.edt.compat2vendor.insert(compat.clone(), name.clone());
                        self.edt.compat2model.insert(compat.clone(), model.to_string());
                    }
                    // The root node may use any compatible.
                    None if node.path == "/" => {}
                    None => diag.warn(format!(
                        "node '{}' compatible '{}' has unknown vendor prefix '{}'",
                        node.path, compat, vendor
                    ))?,
                }
            }
        }

        let nodes = &self.edt.nodes;
        for list in self.edt.compat2nodes.values_mut() {
            list.sort_by_key(|n| !nodes[n.0].enabled());
        }

        Ok(())
    }

    fn check_enums(&self, diag: &mut Diagnostics) -> Result<()> {
        for binding in self.edt.registry.bindings() {
            for spec in binding.prop2specs().values() {
                if spec.type_() != PropType::String {
                    continue;
                }
                let Some(choices) = spec.enum_().filter(|c| !c.is_empty()) else {
                    continue;
                };

                let choices: Vec<String> = choices
                    .iter()
                    .map(|c| format!("'{}'", show(c)))
                    .collect();
                let what = if !spec.enum_tokenizable() {
                    "non-tokenizable enum"
                } else if !spec.enum_upper_tokenizable() {
                    "enum that is only tokenizable in lowercase"
                } else {
                    continue;
                };

                diag.warn(format!(
                    "compatible '{}' in binding '{}' has {} for property '{}': {}",
                    binding.compatible().unwrap_or("None"),
                    display_path(binding.path()),
                    what,
                    spec.name(),
                    choices.join(", ")
                ))?;
            }
        }

        Ok(())
    }
}

/// Checks that hold for any tree, whatever the bindings.
fn check_tree(tree: &Tree) -> Result<()> {
    for id in tree.node_iter() {
        let node = tree.node(id);

        if let Some(status) = node.prop("status") {
            let value = status.to_string()?;
            if !STATUS_VALUES.contains(&value.as_str()) {
                return Err(Error::new(format!(
                    "unknown 'status' value \"{}\" in {} in {}, expected one of {} (see the \
                     devicetree specification)",
                    value,
                    node.path(),
                    tree.filename().display(),
                    STATUS_VALUES.join(", ")
                )));
            }
        }

        if let Some(ranges) = node.prop("ranges") {
            if !matches!(ranges.type_(), RawType::Empty | RawType::Num | RawType::Nums) {
                return Err(Error::new(format!(
                    "expected 'ranges = < ... >;' in {} in {}, not '{}' (see the devicetree \
                     specification)",
                    node.path(),
                    tree.filename().display(),
                    ranges
                )));
            }
        }
    }

    Ok(())
}

/// Every compatible string in the tree.
fn tree_compats(tree: &Tree) -> Result<IndexSet<String>> {
    let mut compats = IndexSet::new();

    for id in tree.node_iter() {
        if let Some(prop) = tree.node(id).prop("compatible") {
            compats.extend(prop.to_strings()?);
        }
    }

    Ok(compats)
}

fn valid_compat(compat: &str) -> bool {
    let mut chars = compat.chars();
    let first = chars.next().is_some_and(|c| c.is_ascii_alphabetic());

    first
        && compat.len() > 1
        && chars.all(|c| c.is_ascii_alphanumeric() || ",+-._".contains(c))
}

/// Binding that types each property of the node by the shape of its value.
fn inferred_binding(tree: &Tree, id: NodeId) -> Result<Binding> {
    let props = tree
        .node(id)
        .props()
        .iter()
        .map(|(name, prop)| {
            let type_ = match prop.type_() {
                RawType::Empty => PropType::Boolean,
                RawType::Bytes => PropType::Uint8Array,
                RawType::Num => PropType::Int,
                RawType::Nums => PropType::Array,
                RawType::String => PropType::String,
                RawType::Strings => PropType::StringArray,
                RawType::Phandle => PropType::Phandle,
                RawType::Phandles => PropType::Phandles,
                RawType::PhandlesAndNums => PropType::PhandleArray,
                RawType::Path => PropType::Path,
                RawType::Compound => {
                    return Err(prop.error("cannot infer binding from a property of mixed type"))
                }
            };
            Ok((name.clone(), type_))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Binding::inferred(props))
}

fn regs(tree: &Tree, id: NodeId, index: NodeIndex, is_pci_device: bool) -> Result<Vec<Register>> {
    let Some(reg) = tree.node(id).prop("reg") else {
        return Ok(Vec::new());
    };

    let address_cells = addr::address_cells(tree, id)? as usize;
    let size_cells = addr::size_cells(tree, id)? as usize;
    let hint = format!(
        "4*(<#address-cells> (= {}) + <#size-cells> (= {}))",
        address_cells, size_cells
    );

    let mut regs = Vec::new();
    for entry in addr::slice(reg, 4 * (address_cells + size_cells), &hint)? {
        let (raw_addr, raw_size) = entry.split_at(4 * address_cells);

        let addr = match address_cells {
            0 => None,
            _ => Some(addr::translate(tree, addr::to_num(raw_addr)?, id)?),
        };
        let size = match size_cells {
            0 => None,
            _ => Some(addr::to_num(raw_size)?),
        };
        // Size zero is fine for PCI devices.
        if size == Some(0) && !is_pci_device {
            return Err(Error::new(format!(
                "zero-sized 'reg' in {} seems meaningless (maybe you want a size of one or \
                 #size-cells = 0 instead)",
                repr(tree, id)
            )));
        }

        regs.push(Register {
            node: index,
            name: None,
            addr,
            size,
        });
    }

    let names = addr::names(tree, id, "reg", regs.len())?;
    for (reg, name) in regs.iter_mut().zip(names) {
        reg.name = name;
    }

    Ok(regs)
}

fn ranges(tree: &Tree, id: NodeId, index: NodeIndex) -> Result<Vec<Range>> {
    let node = tree.node(id);
    let Some(prop) = node.prop("ranges") else {
        return Ok(Vec::new());
    };

    let own_cells = |name: &str, default: u32| -> Result<u32> {
        Ok(node.prop(name).map(RawProperty::to_num).transpose()?.unwrap_or(default))
    };
    let child_address_cells = own_cells("#address-cells", 2)?;
    let parent_address_cells = addr::address_cells(tree, id)?;
    let child_size_cells = own_cells("#size-cells", 1)?;
    let entry_cells = (child_address_cells + parent_address_cells + child_size_cells) as usize;

    if entry_cells == 0 {
        if prop.value().is_empty() {
            return Ok(Vec::new());
        }
        return Err(Error::new(format!(
            "'ranges' should be empty in {} since <#address-cells> = {}, <#address-cells for \
             parent> = {} and <#size-cells> = {}",
            node.path(),
            child_address_cells,
            parent_address_cells,
            child_size_cells
        )));
    }

    let hint = format!(
        "4*(<#address-cells> (= {}) + <#address-cells for parent> (= {}) + <#size-cells> (= {}))",
        child_address_cells, parent_address_cells, child_size_cells
    );
    let num = |bytes: &[u8]| -> Result<Option<u128>> {
        match bytes.len() {
            0 => Ok(None),
            _ => addr::to_num(bytes).map(Some),
        }
    };

    addr::slice(prop, 4 * entry_cells, &hint)?
        .into_iter()
        .map(|entry| -> Result<Range> {
            let (child, rest) = entry.split_at(4 * child_address_cells as usize);
            let (parent, length) = rest.split_at(4 * parent_address_cells as usize);

            Ok(Range {
                node: index,
                child_bus_cells: child_address_cells,
                child_bus_addr: num(child)?,
                parent_bus_cells: parent_address_cells,
                parent_bus_addr: num(parent)?,
                length_cells: child_size_cells,
                length: num(length)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(source: &str, options: &EdtOptions) -> Result<Edt> {
        let tree = Tree::from_source(source, "test.dts", &ParseOptions::default())?;
        Edt::from_tree(tree, &[], options)
    }

    #[test]
    fn valid_compats() {
        let tests = [
            ("vnd,dev", true),
            ("vnd,dev-1.0+x_y", true),
            ("ns16550", true),
            ("v", false),
            ("1vnd,dev", false),
            ("vnd dev", false),
            ("vnd,dev@0", false),
        ];

        for (compat, expected) in tests {
            assert_eq!(valid_compat(compat), expected, "{}", compat);
        }
    }

    #[test]
    fn default_props_without_bindings() {
        let edt = build(
            r#"/dts-v1/;
            / {
                #address-cells = <1>;
                #size-cells = <1>;
                foo@10 {
                    reg = <0x10 0x4>;
                    reg-names = "ctrl";
                    status = "ok";
                    label = "FOO";
                    interrupt-controller;
                    custom = <1>;
                };
            };"#,
            &EdtOptions::default(),
        )
        .unwrap();

        let foo = edt.get_node("/foo@10").unwrap();
        assert_eq!(foo.status(), "okay");
        assert_eq!(foo.label(), Some("FOO"));
        assert_eq!(foo.unit_addr(), Some(0x10));
        assert_eq!(
            foo.regs(),
            [Register {
                node: foo.index(),
                name: Some("ctrl".to_string()),
                addr: Some(0x10),
                size: Some(4),
            }]
        );

        let names: Vec<&str> = foo.props().keys().map(String::as_str).collect();
        assert_eq!(names, ["reg", "reg-names", "status", "label", "interrupt-controller"]);
        assert_eq!(foo.prop("reg").unwrap().value(), &PropertyValue::Array(vec![0x10, 4]));
        assert_eq!(foo.prop("interrupt-controller").unwrap().value(), &PropertyValue::Bool(true));

        let edt = build(
            "/dts-v1/; / { foo { status = \"disabled\"; }; };",
            &EdtOptions {
                default_prop_types: false,
                ..Default::default()
            },
        )
        .unwrap();
        let foo = edt.get_node("/foo").unwrap();
        assert!(foo.props().is_empty());
        assert!(!foo.enabled());
    }

    #[test]
    fn ranges_decoding() {
        let edt = build(
            r#"/dts-v1/;
            / {
                #address-cells = <1>;
                #size-cells = <1>;
                soc {
                    #address-cells = <1>;
                    #size-cells = <1>;
                    ranges = <0x0 0x40000000 0x1000>, <0x1000 0x50000000 0x1000>;
                    uart@100 { reg = <0x100 0x10>; };
                };
                flat {
                    #address-cells = <1>;
                    #size-cells = <1>;
                    ranges;
                };
            };"#,
            &EdtOptions::default(),
        )
        .unwrap();

        let soc = edt.get_node("/soc").unwrap();
        assert_eq!(soc.ranges().len(), 2);
        assert_eq!(
            soc.ranges()[1],
            Range {
                node: soc.index(),
                child_bus_cells: 1,
                child_bus_addr: Some(0x1000),
                parent_bus_cells: 1,
                parent_bus_addr: Some(0x5000_0000),
                length_cells: 1,
                length: Some(0x1000),
            }
        );
        assert!(edt.get_node("/flat").unwrap().ranges().is_empty());

        let uart = edt.get_node("/soc/uart@100").unwrap();
        assert_eq!(uart.regs()[0].addr, Some(0x4000_0100));
        assert_eq!(uart.unit_addr(), Some(0x4000_0100));
    }

    #[test]
    fn tree_errors() {
        let tests = [
            (
                "/dts-v1/; / { a { status = \"broken\"; }; };",
                "unknown 'status' value \"broken\"",
            ),
            (
                "/dts-v1/; / { a { ranges = \"x\"; }; };",
                "expected 'ranges = < ... >;'",
            ),
            (
                "/dts-v1/; / { #address-cells = <1>; #size-cells = <1>; a@0 { reg = <0 0>; }; };",
                "zero-sized 'reg'",
            ),
            (
                "/dts-v1/; / { a@xyz { }; };",
                "non-hex unit address",
            ),
            (
                "/dts-v1/; / { a { compatible = \"vnd dev\"; }; };",
                "must match this regular expression",
            ),
            (
                "/dts-v1/; / { a { pinctrl-1 = <>; }; };",
                "missing 'pinctrl-0' property",
            ),
        ];

        for (source, expected) in tests {
            let err = build(source, &EdtOptions::default()).unwrap_err();
            assert!(err.message().contains(expected), "{}: {}", source, err);
        }
    }

    #[test]
    fn pinctrls_and_hogs() {
        let edt = build(
            r#"/dts-v1/;
            / {
                pa: pa { };
                pb: pb { };
                gpio0: gpio {
                    gpio-controller;
                    #gpio-cells = <2>;
                    hog {
                        gpio-hog;
                        gpios = <3 0>, <4 1>;
                        output-high;
                    };
                };
                dev {
                    pinctrl-1 = <&pb>;
                    pinctrl-0 = <&pa &pb>;
                    pinctrl-names = "default", "sleep";
                };
            };"#,
            &EdtOptions::default(),
        )
        .unwrap();

        let pa = edt.get_node("/pa").unwrap().index();
        let pb = edt.get_node("/pb").unwrap().index();
        let dev = edt.get_node("/dev").unwrap();
        let pinctrls: Vec<(Option<&str>, &[NodeIndex])> = dev
            .pinctrls()
            .iter()
            .map(|p| (p.name.as_deref(), p.conf_nodes.as_slice()))
            .collect();
        assert_eq!(
            pinctrls,
            [(Some("default"), &[pa, pb][..]), (Some("sleep"), &[pb][..])]
        );

        let gpio = edt.get_node("/gpio").unwrap().index();
        let hogs = edt.get_node("/gpio/hog").unwrap().gpio_hogs();
        assert_eq!(hogs.len(), 2);
        assert_eq!(hogs[1].controller, gpio);
        assert_eq!(
            hogs[1].data.iter().map(|(k, v)| (k.as_str(), *v)).collect::<Vec<_>>(),
            [("0", 4), ("1", 1)]
        );
    }

    #[test]
    fn graph_and_luts() {
        let edt = build(
            r#"/dts-v1/;
            / {
                compatible = "unknown,board";
                chosen { console = &uart; };
                aliases { serial0 = &uart; };
                intc: intc {
                    compatible = "vnd,intc";
                    interrupt-controller;
                    #interrupt-cells = <1>;
                };
                uart: uart {
                    compatible = "vnd,uart";
                    interrupt-parent = <&intc>;
                    interrupts = <5>;
                };
                uart-off {
                    compatible = "vnd,uart";
                    status = "disabled";
                };
            };"#,
            &EdtOptions::default(),
        )
        .unwrap();

        let root = edt.get_node("/").unwrap().index();
        let intc = edt.get_node("/intc").unwrap();
        let uart = edt.get_node("serial0").unwrap();
        let off = edt.get_node("/uart-off").unwrap().index();

        assert_eq!(uart.aliases(), ["serial0"]);
        assert_eq!(uart.interrupts()[0].controller, intc.index());
        assert_eq!(edt.depends_on(uart.index()), [root, intc.index()]);
        assert!(edt.required_by(intc.index()).contains(&uart.index()));
        assert!(intc.dep_ordinal() < uart.dep_ordinal());
        assert_eq!(edt.dep_ord2node()[&0], root);

        assert_eq!(edt.chosen_node("console").map(Node::index), Some(uart.index()));
        assert!(edt.chosen_node("stdout").is_none());
        assert_eq!(edt.label2node()["uart"], uart.index());
        assert_eq!(edt.compat2nodes()["vnd,uart"], [uart.index(), off]);
        assert_eq!(edt.compat2okay()["vnd,uart"], [uart.index()]);
        assert_eq!(edt.compat2notokay()["vnd,uart"], [off]);
        assert!(edt.compat2vendor().is_empty());
    }
}
