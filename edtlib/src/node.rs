//! Nodes of the extended devicetree and the typed values they carry.

use std::{fmt, path::Path, sync::Arc};

use dts_parser::{Error, NodeId, Result};
use indexmap::IndexMap;
use serde_yaml::Value;

use crate::{
    binding::{Binding, PropType, PropertySpec},
    edt::Edt,
    str_as_token,
};

/// Index of a node in [`Edt::nodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub(crate) usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A property value, decoded according to the type its binding declares.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Array(Vec<i64>),
    Bytes(Vec<u8>),
    String(String),
    Strings(Vec<String>),
    Phandle(NodeIndex),
    Phandles(Vec<NodeIndex>),
    /// One entry per `&controller cell...` group. `None` marks an entry
    /// whose phandle is zero or unknown.
    PhandleArray(Vec<Option<ControllerAndData>>),
    Path(NodeIndex),
}

impl PropertyValue {
    /// Converts a YAML `default:`, `const:` or `enum:` entry to a value of
    /// type `ty`. Returns `None` if it does not fit the type.
    pub(crate) fn from_yaml(ty: PropType, value: &Value) -> Option<PropertyValue> {
        let seq = || value.as_sequence();

        match ty {
            PropType::Int => value.as_i64().map(PropertyValue::Int),
            PropType::String => value.as_str().map(|s| PropertyValue::String(s.to_string())),
            PropType::Array => seq()?
                .iter()
                .map(Value::as_i64)
                .collect::<Option<Vec<_>>>()
                .map(PropertyValue::Array),
            PropType::Uint8Array => seq()?
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<_>>>()
                .map(PropertyValue::Bytes),
            PropType::StringArray => seq()?
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(PropertyValue::Strings),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            f.write_str("]")
        }

        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(n) => write!(f, "{}", n),
            PropertyValue::Array(v) => list(f, v),
            PropertyValue::Bytes(v) => {
                let hex: Vec<String> = v.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "[{}]", hex.join(" "))
            }
            PropertyValue::String(s) => write!(f, "'{}'", s),
            PropertyValue::Strings(v) => {
                let quoted: Vec<String> = v.iter().map(|s| format!("'{}'", s)).collect();
                list(f, &quoted)
            }
            PropertyValue::Phandle(n) | PropertyValue::Path(n) => write!(f, "{}", n),
            PropertyValue::Phandles(v) => list(f, v),
            PropertyValue::PhandleArray(v) => {
                let entries: Vec<String> = v
                    .iter()
                    .map(|e| match e {
                        Some(e) => format!("{}", e),
                        None => "None".to_string(),
                    })
                    .collect();
                list(f, &entries)
            }
        }
    }
}

/// A property of a node, typed by its binding.
#[derive(Debug, Clone)]
pub struct Property {
    pub(crate) spec: Arc<PropertySpec>,
    pub(crate) value: PropertyValue,
    pub(crate) node: NodeIndex,
}

impl Property {
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn description(&self) -> Option<&str> {
        self.spec.description()
    }

    pub fn type_(&self) -> PropType {
        self.spec.type_()
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn spec(&self) -> &PropertySpec {
        &self.spec
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    /// String values turned into identifiers (`foo-bar` becomes `foo_bar`).
    pub fn val_as_tokens(&self) -> Option<Vec<String>> {
        match &self.value {
            PropertyValue::String(s) => Some(vec![str_as_token(s)]),
            PropertyValue::Strings(v) => Some(v.iter().map(|s| str_as_token(s)).collect()),
            _ => None,
        }
    }

    /// Positions of the value(s) in the binding's `enum:` list.
    pub fn enum_indices(&self) -> Option<Vec<usize>> {
        let choices = self.spec.enum_()?;
        let position = |value: &PropertyValue| {
            choices
                .iter()
                .position(|c| PropertyValue::from_yaml(self.type_(), c).as_ref() == Some(value))
        };

        match &self.value {
            PropertyValue::Strings(v) => v
                .iter()
                .map(|s| {
                    choices
                        .iter()
                        .position(|c| c.as_str() == Some(s.as_str()))
                })
                .collect(),
            PropertyValue::Array(v) => v
                .iter()
                .map(|n| choices.iter().position(|c| c.as_i64() == Some(*n)))
                .collect(),
            value => position(value).map(|i| vec![i]),
        }
    }
}

/// A `reg` entry, translated to the root address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub node: NodeIndex,
    pub name: Option<String>,
    pub addr: Option<u128>,
    pub size: Option<u128>,
}

/// A `ranges` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub node: NodeIndex,
    pub child_bus_cells: u32,
    pub child_bus_addr: Option<u128>,
    pub parent_bus_cells: u32,
    pub parent_bus_addr: Option<u128>,
    pub length_cells: u32,
    pub length: Option<u128>,
}

/// A controller and the named specifier cells a node passes to it, as in
/// `gpios = <&gpio0 13 1>` or an interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerAndData {
    /// The node the property lives on.
    pub node: NodeIndex,
    pub controller: NodeIndex,
    pub data: IndexMap<String, u32>,
    /// Name from the matching `*-names` property.
    pub name: Option<String>,
    /// Specifier space, e.g. `gpio` for `gpios`.
    pub basename: Option<String>,
}

impl fmt::Display for ControllerAndData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ControllerAndData, controller: {}", self.controller)?;
        if let Some(name) = &self.name {
            write!(f, ", name: {}", name)?;
        }
        f.write_str(", data: {")?;
        for (i, (cell, value)) in self.data.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}': {}", cell, value)?;
        }
        f.write_str("}>")
    }
}

/// A `pinctrl-<index>` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinCtrl {
    pub node: NodeIndex,
    /// Name from `pinctrl-names`, if any.
    pub name: Option<String>,
    pub conf_nodes: Vec<NodeIndex>,
}

impl PinCtrl {
    pub fn name_as_token(&self) -> Option<String> {
        self.name.as_deref().map(str_as_token)
    }
}

/// A node of the extended devicetree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) index: NodeIndex,
    pub(crate) raw: NodeId,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) parent: Option<NodeIndex>,
    pub(crate) children: IndexMap<String, NodeIndex>,
    pub(crate) labels: Vec<String>,
    pub(crate) aliases: Vec<String>,
    pub(crate) compats: Vec<String>,
    pub(crate) matching_compat: Option<String>,
    pub(crate) binding: Option<Arc<Binding>>,
    pub(crate) bus_node: Option<NodeIndex>,
    pub(crate) on_buses: Vec<String>,
    pub(crate) unit_addr: Option<u128>,
    pub(crate) status: String,
    pub(crate) read_only: bool,
    pub(crate) label: Option<String>,
    pub(crate) props: IndexMap<String, Property>,
    pub(crate) regs: Vec<Register>,
    pub(crate) ranges: Vec<Range>,
    pub(crate) interrupts: Vec<ControllerAndData>,
    pub(crate) pinctrls: Vec<PinCtrl>,
    pub(crate) gpio_hogs: Vec<ControllerAndData>,
    pub(crate) dep_ordinal: usize,
}

impl Node {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// The node in the underlying raw tree.
    pub fn raw(&self) -> NodeId {
        self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn children(&self) -> &IndexMap<String, NodeIndex> {
        &self.children
    }

    /// Position of `child` among this node's children.
    pub fn child_index(&self, child: NodeIndex) -> Option<usize> {
        self.children.values().position(|c| *c == child)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Aliases from `/aliases` that point at this node.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn compats(&self) -> &[String] {
        &self.compats
    }

    /// The compatible string that selected the binding, if the binding came
    /// from a `compatible` match.
    pub fn matching_compat(&self) -> Option<&str> {
        self.matching_compat.as_deref()
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_deref()
    }

    pub fn binding_path(&self) -> Option<&Path> {
        self.binding.as_ref().and_then(|b| b.path())
    }

    pub fn description(&self) -> Option<&str> {
        self.binding.as_ref().and_then(|b| b.description())
    }

    /// Whether the binding describes child nodes.
    pub fn has_child_binding(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| b.child_binding().is_some())
    }

    /// Buses this node provides to its children.
    pub fn buses(&self) -> &[String] {
        self.binding.as_ref().map_or(&[], |b| b.buses())
    }

    /// Buses this node sits on, i.e. the buses of [`Node::bus_node`].
    pub fn on_buses(&self) -> &[String] {
        &self.on_buses
    }

    /// The closest ancestor that provides a bus, if the parent does.
    pub fn bus_node(&self) -> Option<NodeIndex> {
        self.bus_node
    }

    pub fn is_pci_device(&self) -> bool {
        self.on_buses.iter().any(|b| b == "pcie")
    }

    /// The address after `@`, translated to the parent's address space.
    /// `None` without `@` and for PCI devices.
    pub fn unit_addr(&self) -> Option<u128> {
        self.unit_addr
    }

    /// The normalized `status`; `ok` reads as `okay`.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn enabled(&self) -> bool {
        self.status == "okay"
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// The `label` property.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn props(&self) -> &IndexMap<String, Property> {
        &self.props
    }

    pub fn prop(&self, name: &str) -> Option<&Property> {
        self.props.get(name)
    }

    pub fn regs(&self) -> &[Register] {
        &self.regs
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn interrupts(&self) -> &[ControllerAndData] {
        &self.interrupts
    }

    pub fn pinctrls(&self) -> &[PinCtrl] {
        &self.pinctrls
    }

    pub fn gpio_hogs(&self) -> &[ControllerAndData] {
        &self.gpio_hogs
    }

    /// Position in the dependency order; nodes in the same cycle share one.
    pub fn dep_ordinal(&self) -> usize {
        self.dep_ordinal
    }

    /// The flash controller of a flash partition node: the grandparent, or
    /// the great-grandparent when the flash sits on a memory-technology
    /// device (`soc-nv-flash` on an `mtd` controller).
    pub fn flash_controller(&self, edt: &Edt) -> Result<NodeIndex> {
        let error = || {
            Error::new(format!(
                "flash partition {} lacks parent or grandparent node",
                self.path
            ))
        };

        let parent = self.parent.ok_or_else(error)?;
        let controller = edt.node(parent).parent.ok_or_else(error)?;

        if edt.node(controller).matching_compat() == Some("soc-nv-flash") {
            return edt.node(controller).parent.ok_or_else(error);
        }

        Ok(controller)
    }

    /// The chip-select GPIO of a SPI device: entry `reg[0]` of the bus
    /// node's `cs-gpios`, or `None` if the bus does not use GPIO chip
    /// selects.
    pub fn spi_cs_gpio<'e>(&self, edt: &'e Edt) -> Result<Option<&'e ControllerAndData>> {
        if !self.on_buses.iter().any(|b| b == "spi") {
            return Ok(None);
        }

        let Some(bus) = self.bus_node else {
            return Ok(None);
        };
        let Some(cs_gpios) = edt.node(bus).prop("cs-gpios") else {
            return Ok(None);
        };
        let PropertyValue::PhandleArray(entries) = cs_gpios.value() else {
            return Ok(None);
        };

        let Some(addr) = self.regs.first().and_then(|r| r.addr) else {
            return Err(Error::new(format!(
                "{} has a cs-gpios property but no reg to index it with",
                self.path
            )));
        };

        let entry = usize::try_from(addr)
            .ok()
            .and_then(|i| entries.get(i))
            .ok_or_else(|| {
                Error::new(format!(
                    "index of {} ({}) is out of range for {} entries of cs-gpios on {}",
                    self.path,
                    addr,
                    entries.len(),
                    edt.node(bus).path
                ))
            })?;

        Ok(entry.as_ref())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binding_path() {
            Some(binding) => write!(f, "<Node {} with binding {}>", self.path, binding.display()),
            None => write!(f, "<Node {} (no binding)>", self.path),
        }
    }
}
