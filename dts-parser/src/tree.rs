//! The raw devicetree: nodes and properties as written in the source, after
//! merging, deletions and reference resolution.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::{debug, trace};

use crate::{
    ast::{self, ByteCell, PropertyCell, PropertyValue, RootItem, Statement},
    error::{Error, Location, Result},
    parser,
    property::{self, Marker, MarkerKind, Property},
};

/// Index of a node in its [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    path: String,
    parent: Option<NodeId>,
    children: IndexMap<String, NodeId>,
    props: IndexMap<String, Property>,
    labels: Vec<String>,
    location: Location,
    omit_if_no_ref: bool,
    referenced: bool,
}

impl Node {
    /// Full node name, including the unit address.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in source order, keyed by name.
    pub fn children(&self) -> &IndexMap<String, NodeId> {
        &self.children
    }

    /// Properties in source order, keyed by name.
    pub fn props(&self) -> &IndexMap<String, Property> {
        &self.props
    }

    pub fn prop(&self, name: &str) -> Option<&Property> {
        self.props.get(name)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Where the node was first defined.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The part of the name after `@`, or an empty string.
    pub fn unit_addr(&self) -> &str {
        self.name.split_once('@').map_or("", |(_, addr)| addr)
    }

    fn new(name: &str, path: String, parent: Option<NodeId>, location: Location) -> Self {
        Self {
            name: name.to_string(),
            path,
            parent,
            children: IndexMap::new(),
            props: IndexMap::new(),
            labels: Vec::new(),
            location,
            omit_if_no_ref: false,
            referenced: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemReserve {
    pub labels: Vec<String>,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Directories searched for `/include/` and `/incbin/` files, after the
    /// directory of the including file.
    pub include_path: Vec<PathBuf>,
    /// Accept input without a leading `/dts-v1/;`.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct Tree {
    filename: PathBuf,
    include_path: Vec<PathBuf>,
    nodes: Vec<Node>,
    memreserves: Vec<MemReserve>,
    label2node: IndexMap<String, NodeId>,
    label2prop: IndexMap<String, (NodeId, String)>,
    label2prop_offset: IndexMap<String, (NodeId, String, usize)>,
    phandle2node: IndexMap<u32, NodeId>,
    alias2node: IndexMap<String, NodeId>,
}

impl Tree {
    /// Parses the DTS file at `path`.
    pub fn from_file(path: impl AsRef<Path>, options: &ParseOptions) -> Result<Tree> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| Error::in_file(path, format!("could not read file: {}", e)))?;

        Self::from_source(&source, path, options)
    }

    /// Parses DTS text. `filename` is used for messages and to locate included files.
    pub fn from_source(
        source: &str,
        filename: impl AsRef<Path>,
        options: &ParseOptions,
    ) -> Result<Tree> {
        let filename = filename.as_ref();
        debug!("parsing {}", filename.display());

        let dts = parser::parse(source, filename)?;
        if !options.force && dts.0.first() != Some(&RootItem::Version) {
            let line = dts.0.first().map_or(1, item_line);
            return Err(Error::at(
                filename,
                line,
                "expected '/dts-v1/;' at start of file",
            ));
        }

        let mut tree = Tree {
            filename: filename.to_path_buf(),
            include_path: options.include_path.clone(),
            nodes: vec![Node::new(
                "/",
                "/".to_string(),
                None,
                Location {
                    file: filename.to_path_buf(),
                    line: None,
                },
            )],
            memreserves: Vec::new(),
            label2node: IndexMap::new(),
            label2prop: IndexMap::new(),
            label2prop_offset: IndexMap::new(),
            phandle2node: IndexMap::new(),
            alias2node: IndexMap::new(),
        };

        let mut builder = Builder {
            tree: &mut tree,
            files: vec![canonical(filename)],
            root_defined: false,
        };
        builder.apply_dts(&dts, filename)?;
        if !builder.root_defined {
            return Err(Error::in_file(filename, "no root node defined"));
        }

        tree.register_phandles()?;
        tree.fixup_props()?;
        tree.register_aliases()?;
        tree.remove_unreferenced();
        tree.register_labels()?;

        Ok(tree)
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn include_path(&self) -> &[PathBuf] {
        &self.include_path
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Looks up a node by absolute path, or by a path starting with an alias
    /// (`alias/child`).
    pub fn get_node(&self, path: &str) -> Result<NodeId> {
        if path.starts_with('/') {
            return self.walk_path(self.root(), path, path);
        }

        let (alias, rest) = path.split_once('/').unwrap_or((path, ""));
        let Some(start) = self.alias2node.get(alias) else {
            return Err(Error::new(format!(
                "no alias '{}' found -- did you forget the leading '/' in the node path?",
                alias
            )));
        };

        self.walk_path(*start, rest, path)
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.get_node(path).is_ok()
    }

    /// Depth-first iterator over the live nodes, in source order.
    pub fn node_iter(&self) -> NodeIter<'_> {
        NodeIter {
            tree: self,
            stack: vec![self.root()],
        }
    }

    pub fn memreserves(&self) -> &[MemReserve] {
        &self.memreserves
    }

    pub fn label2node(&self) -> &IndexMap<String, NodeId> {
        &self.label2node
    }

    /// Labels placed before property names, with the node and property name.
    pub fn label2prop(&self) -> &IndexMap<String, (NodeId, String)> {
        &self.label2prop
    }

    /// Labels placed inside property values, with their byte offset.
    pub fn label2prop_offset(&self) -> &IndexMap<String, (NodeId, String, usize)> {
        &self.label2prop_offset
    }

    pub fn phandle2node(&self) -> &IndexMap<u32, NodeId> {
        &self.phandle2node
    }

    pub fn alias2node(&self) -> &IndexMap<String, NodeId> {
        &self.alias2node
    }

    fn walk_path(&self, start: NodeId, path: &str, full_path: &str) -> Result<NodeId> {
        let mut cur = start;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            cur = *self.nodes[cur.0].children.get(component).ok_or_else(|| {
                Error::new(format!(
                    "component '{}' in path '{}' does not exist",
                    component, full_path
                ))
            })?;
        }

        Ok(cur)
    }

    fn find_label(&self, label: &str) -> Option<NodeId> {
        self.node_iter()
            .find(|id| self.nodes[id.0].labels.iter().any(|l| l == label))
    }

    /// Resolves the text of a `&...` reference.
    fn ref2node(&self, reference: &str) -> Result<NodeId> {
        match reference.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
            Some(path) => self
                .get_node(path)
                .map_err(|_| Error::new(format!("non-existent node with path '{}'", path))),
            None => self
                .find_label(reference)
                .ok_or_else(|| Error::new(format!("undefined node label '{}'", reference))),
        }
    }

    fn get_or_add_child(&mut self, parent: NodeId, name: &str, location: Location) -> NodeId {
        if let Some(id) = self.nodes[parent.0].children.get(name) {
            return *id;
        }

        let parent_path = &self.nodes[parent.0].path;
        let path = if parent_path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_path, name)
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, path, Some(parent), location));
        self.nodes[parent.0].children.insert(name.to_string(), id);
        id
    }

    /// Unlinks a node from its parent. The node stays in the arena but is no
    /// longer reachable.
    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            let name = self.nodes[id.0].name.clone();
            self.nodes[parent.0].children.shift_remove(&name);
        }
    }

    fn register_phandles(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.node_iter().collect();

        for id in ids {
            let Some(prop) = self.nodes[id.0].props.get("phandle") else {
                continue;
            };

            if prop.value.len() != 4 {
                return Err(prop.error(format!(
                    "bad phandle length ({}), expected 4 bytes",
                    prop.value.len()
                )));
            }

            let mut self_referential = false;
            for marker in prop.markers.iter().filter(|m| m.kind == MarkerKind::Phandle) {
                let target = self
                    .ref2node(marker.data.as_deref().unwrap_or_default())
                    .map_err(|e| prop.error(e.message()))?;
                if target != id {
                    return Err(prop.error("phandle refers to another node"));
                }
                self_referential = true;
            }
            if self_referential {
                continue;
            }

            let phandle = property::be_u32(&prop.value);
            if phandle == 0 || phandle == u32::MAX {
                return Err(prop.error(format!("bad value {:#x} for phandle", phandle)));
            }
            if let Some(other) = self.phandle2node.get(&phandle) {
                return Err(prop.error(format!(
                    "duplicated phandle {:#x} (seen before at {})",
                    phandle, self.nodes[other.0].path
                )));
            }

            self.phandle2node.insert(phandle, id);
        }

        Ok(())
    }

    /// Replaces path references with the target path and phandle references
    /// with the target phandle, shifting the markers that follow.
    fn fixup_props(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.node_iter().collect();

        for id in ids {
            let names: Vec<String> = self.nodes[id.0].props.keys().cloned().collect();

            for name in names {
                let mut prop = self.nodes[id.0].props[&name].clone();
                if !prop
                    .markers
                    .iter()
                    .any(|m| matches!(m.kind, MarkerKind::Path | MarkerKind::Phandle))
                {
                    continue;
                }

                let mut markers = std::mem::take(&mut prop.markers);
                let mut res = Vec::with_capacity(prop.value.len());
                let mut prev = 0;

                for marker in markers.iter_mut() {
                    let pos = marker.offset;
                    res.extend_from_slice(&prop.value[prev..pos]);
                    marker.offset = res.len();
                    prev = pos;

                    if !matches!(marker.kind, MarkerKind::Path | MarkerKind::Phandle) {
                        continue;
                    }

                    let target = self
                        .ref2node(marker.data.as_deref().unwrap_or_default())
                        .map_err(|e| prop.error(e.message()))?;
                    self.nodes[target.0].referenced = true;

                    if marker.kind == MarkerKind::Path {
                        res.extend_from_slice(self.nodes[target.0].path.as_bytes());
                        res.push(0);
                    } else {
                        res.extend_from_slice(&self.node_phandle(target).to_be_bytes());
                        prev = pos + 4;
                    }
                }

                res.extend_from_slice(&prop.value[prev..]);
                prop.value = res;
                prop.markers = markers;
                self.nodes[id.0].props.insert(name, prop);
            }
        }

        Ok(())
    }

    /// Returns the phandle of a node, allocating the lowest free one if the
    /// node has none yet.
    fn node_phandle(&mut self, id: NodeId) -> u32 {
        if let Some(prop) = self.nodes[id.0].props.get("phandle") {
            if prop.value.len() == 4 {
                let phandle = property::be_u32(&prop.value);
                if phandle != 0 {
                    return phandle;
                }
            }
        }

        let mut phandle = 1;
        while self.phandle2node.contains_key(&phandle) {
            phandle += 1;
        }
        self.phandle2node.insert(phandle, id);

        let node = &mut self.nodes[id.0];
        trace!("allocated phandle {:#x} for {}", phandle, node.path);

        let (path, location) = (node.path.clone(), node.location.clone());
        let prop = node
            .props
            .entry("phandle".to_string())
            .or_insert_with(|| Property::new("phandle", id, &path, location));
        if prop.markers.is_empty() {
            prop.markers.push(Marker {
                offset: 0,
                kind: MarkerKind::Uint32,
                data: None,
            });
        }
        prop.value = phandle.to_be_bytes().to_vec();

        phandle
    }

    fn register_aliases(&mut self) -> Result<()> {
        let Some(aliases) = self.nodes[0].children.get("aliases").copied() else {
            return Ok(());
        };

        let mut alias2node = IndexMap::new();
        for prop in self.nodes[aliases.0].props.values() {
            let valid = !prop.name.is_empty()
                && prop
                    .name
                    .chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || c == '-');
            if !valid {
                return Err(prop.error(
                    "alias property name should include only characters from [0-9a-z-]",
                ));
            }

            alias2node.insert(prop.name.clone(), prop.to_path(self)?);
        }

        self.alias2node = alias2node;
        Ok(())
    }

    fn remove_unreferenced(&mut self) {
        let omitted: Vec<NodeId> = self
            .node_iter()
            .filter(|id| {
                let node = &self.nodes[id.0];
                node.omit_if_no_ref && !node.referenced
            })
            .collect();

        if omitted.is_empty() {
            return;
        }

        for id in omitted {
            debug!("omitting unreferenced node {}", self.nodes[id.0].path);
            self.detach(id);
        }

        let live: HashSet<NodeId> = self.node_iter().collect();
        self.phandle2node.retain(|_, id| live.contains(id));
        self.alias2node.retain(|_, id| live.contains(id));
    }

    fn register_labels(&mut self) -> Result<()> {
        #[derive(PartialEq)]
        enum Thing {
            Node(NodeId),
            Prop(NodeId, String),
            Value(NodeId, String, usize),
            MemReserve,
        }

        fn push(things: &mut IndexMap<String, Vec<Thing>>, label: &str, thing: Thing) {
            let entry = things.entry(label.to_string()).or_default();
            if !entry.contains(&thing) {
                entry.push(thing);
            }
        }

        let mut things: IndexMap<String, Vec<Thing>> = IndexMap::new();
        let ids: Vec<NodeId> = self.node_iter().collect();

        for id in ids {
            let node = &self.nodes[id.0];

            for label in &node.labels {
                push(&mut things, label, Thing::Node(id));
                self.label2node.insert(label.clone(), id);
            }

            for prop in node.props.values() {
                for label in &prop.labels {
                    push(&mut things, label, Thing::Prop(id, prop.name.clone()));
                    self.label2prop
                        .insert(label.clone(), (id, prop.name.clone()));
                }
                for (label, offset) in prop.offset_labels() {
                    push(
                        &mut things,
                        label,
                        Thing::Value(id, prop.name.clone(), offset),
                    );
                    self.label2prop_offset
                        .insert(label.to_string(), (id, prop.name.clone(), offset));
                }
            }
        }

        for memreserve in &self.memreserves {
            for label in &memreserve.labels {
                push(&mut things, label, Thing::MemReserve);
            }
        }

        let describe = |thing: &Thing| match thing {
            Thing::Node(id) => self.nodes[id.0].path.clone(),
            Thing::Prop(id, name) => {
                format!("property '{}' on {}", name, self.nodes[id.0].path)
            }
            Thing::Value(id, name, offset) => format!(
                "value of property '{}' on {} (offset {})",
                name, self.nodes[id.0].path, offset
            ),
            Thing::MemReserve => "a /memreserve/".to_string(),
        };

        for (label, things) in &things {
            if let [first, second, ..] = things.as_slice() {
                return Err(Error::in_file(
                    &self.filename,
                    format!(
                        "label '{}' appears on {} and on {}",
                        label,
                        describe(first),
                        describe(second)
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// Depth-first iterator over the nodes of a [`Tree`].
pub struct NodeIter<'t> {
    tree: &'t Tree,
    stack: Vec<NodeId>,
}

impl Iterator for NodeIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.nodes[id.0].children.values().rev().copied());
        Some(id)
    }
}

/// Applies parsed statements to a tree under construction.
struct Builder<'t> {
    tree: &'t mut Tree,
    /// Files currently being processed, outermost first.
    files: Vec<PathBuf>,
    root_defined: bool,
}

impl Builder<'_> {
    fn apply_dts(&mut self, dts: &ast::Dts, file: &Path) -> Result<()> {
        for item in &dts.0 {
            match item {
                RootItem::Version => {}
                RootItem::Include(inc) => {
                    let path = self.find_file(inc.path, file, inc.line)?;
                    self.with_file(&path, file, inc.line, |builder, source| {
                        let dts = parser::parse(source, &path)?;
                        builder.apply_dts(&dts, &path)
                    })?;
                }
                RootItem::Node(node) => {
                    let id = match &node.id {
                        ast::NodeId::Name(..) => {
                            self.root_defined = true;
                            self.tree.root()
                        }
                        ast::NodeId::Ref(r) => self.resolve(r, file, node.line)?,
                    };
                    self.apply_node(id, node, file)?;
                }
                RootItem::DeleteNode(r, line) => {
                    let id = self.resolve(r, file, *line)?;
                    if id == self.tree.root() {
                        return Err(Error::at(file, *line, "cannot delete the root node"));
                    }
                    self.tree.detach(id);
                }
                RootItem::OmitNode(r, line) => {
                    let id = self.resolve(r, file, *line)?;
                    self.tree.nodes[id.0].omit_if_no_ref = true;
                }
                RootItem::MemReserve(m) => {
                    let address = eval_u64(&m.address, file, m.line)?;
                    let size = eval_u64(&m.size, file, m.line)?;
                    self.tree.memreserves.push(MemReserve {
                        labels: m.labels.iter().map(|l| l.to_string()).collect(),
                        address,
                        size,
                    });
                }
            }
        }

        Ok(())
    }

    fn apply_node(&mut self, id: NodeId, node: &ast::Node, file: &Path) -> Result<()> {
        let target = &mut self.tree.nodes[id.0];
        for label in &node.labels {
            push_no_dup(&mut target.labels, label);
        }
        if node.omit_if_no_ref {
            target.omit_if_no_ref = true;
        }

        self.apply_contents(id, &node.contents, file)
    }

    fn apply_contents(
        &mut self,
        id: NodeId,
        contents: &ast::NodeContents,
        file: &Path,
    ) -> Result<()> {
        let mut defined = HashSet::new();

        for statement in &contents.statements {
            match statement {
                Statement::Property(prop) => self.assign_property(id, prop, file)?,
                Statement::Node(child) => {
                    let name = match child.id {
                        ast::NodeId::Name(name, None) => name.to_string(),
                        ast::NodeId::Name(name, Some(addr)) => format!("{}@{}", name, addr),
                        ast::NodeId::Ref(_) => {
                            return Err(Error::at(file, child.line, "unexpected node reference"))
                        }
                    };
                    if name.matches('@').count() > 1 {
                        return Err(Error::at(
                            file,
                            child.line,
                            format!("multiple '@' in node name '{}'", name),
                        ));
                    }
                    if !defined.insert(name.clone()) {
                        return Err(Error::at(
                            file,
                            child.line,
                            format!(
                                "node '{}' defined more than once in {}",
                                name, self.tree.nodes[id.0].path
                            ),
                        ));
                    }

                    let location = Location {
                        file: file.to_path_buf(),
                        line: Some(child.line),
                    };
                    let child_id = self.tree.get_or_add_child(id, &name, location);
                    self.apply_node(child_id, child, file)?;
                }
                Statement::Include(inc) => {
                    let path = self.find_file(inc.path, file, inc.line)?;
                    self.with_file(&path, file, inc.line, |builder, source| {
                        let contents = parser::parse_node_contents(source, &path)?;
                        builder.apply_contents(id, &contents, &path)
                    })?;
                }
            }
        }

        let node = &mut self.tree.nodes[id.0];
        for name in &contents.deleted_props {
            node.props.shift_remove(*name);
        }
        for name in &contents.deleted_nodes {
            node.children.shift_remove(*name);
        }

        Ok(())
    }

    fn assign_property(&mut self, id: NodeId, decl: &ast::Property, file: &Path) -> Result<()> {
        if decl.name.contains('@') {
            return Err(Error::at(
                file,
                decl.line,
                format!("'@' is only allowed in node names, not in property '{}'", decl.name),
            ));
        }

        let location = Location {
            file: file.to_path_buf(),
            line: Some(decl.line),
        };
        let node = &self.tree.nodes[id.0];
        let mut prop = match node.props.get(decl.name) {
            Some(prop) => {
                let mut prop = prop.clone();
                prop.value.clear();
                prop.markers.clear();
                prop.location = location;
                prop
            }
            None => Property::new(decl.name, id, &node.path, location),
        };

        for label in &decl.labels {
            push_no_dup(&mut prop.labels, label);
        }
        for value in decl.value.iter().flatten() {
            self.append_value(&mut prop, value, file, decl.line)?;
        }

        self.tree.nodes[id.0]
            .props
            .insert(decl.name.to_string(), prop);
        Ok(())
    }

    fn append_value(
        &self,
        prop: &mut Property,
        value: &PropertyValue,
        file: &Path,
        line: u32,
    ) -> Result<()> {
        match value {
            PropertyValue::Label(label) => prop.add_marker(MarkerKind::Label, Some(label.to_string())),
            PropertyValue::Str(s) => {
                prop.add_marker(MarkerKind::String, None);
                prop.value.extend(ast::unescape(s));
                prop.value.push(0);
            }
            PropertyValue::Ref(r) => prop.add_marker(MarkerKind::Path, Some(r.to_string())),
            PropertyValue::Bytestring(cells) => {
                prop.add_marker(MarkerKind::Uint8, None);
                for cell in cells {
                    match cell {
                        ByteCell::Byte(b) => prop.value.push(*b),
                        ByteCell::Label(label) => {
                            prop.add_marker(MarkerKind::Label, Some(label.to_string()))
                        }
                    }
                }
            }
            PropertyValue::CellArray(cells) => append_cells(prop, 32, cells, file, line)?,
            PropertyValue::Bits(bits, cells) => append_cells(prop, *bits, cells, file, line)?,
            PropertyValue::Incbin { path, range } => {
                let found = self.find_file(path, file, line)?;
                let data = fs::read(&found).map_err(|e| {
                    Error::at(file, line, format!("could not read '{}': {}", found.display(), e))
                })?;

                let data = match range {
                    Some((offset, size)) => {
                        let offset = eval_u64(offset, file, line)? as usize;
                        let size = eval_u64(size, file, line)? as usize;
                        data.get(offset..offset.saturating_add(size)).ok_or_else(|| {
                            Error::at(file, line, format!("/incbin/ range out of bounds for '{}'", path))
                        })?
                    }
                    None => &data[..],
                };

                prop.add_marker(MarkerKind::Uint8, None);
                prop.value.extend_from_slice(data);
            }
        }

        Ok(())
    }

    /// Resolves a `&label` or `&{/path}` used as a statement target.
    fn resolve(&self, reference: &ast::Reference, file: &Path, line: u32) -> Result<NodeId> {
        self.tree
            .ref2node(&reference.to_string())
            .map_err(|e| Error::at(file, line, e.message()))
    }

    /// Finds an included file: first next to the including file, then in
    /// the include path.
    fn find_file(&self, name: &str, current: &Path, line: u32) -> Result<PathBuf> {
        let name = Path::new(name);
        let dirs = current
            .parent()
            .map(Path::to_path_buf)
            .into_iter()
            .chain(self.tree.include_path.iter().cloned());

        if name.is_absolute() {
            if name.is_file() {
                return Ok(name.to_path_buf());
            }
        } else {
            for dir in dirs {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        Err(Error::at(
            current,
            line,
            format!("'{}' could not be found", name.display()),
        ))
    }

    /// Reads `path` and runs `f` on its contents with `path` pushed on the
    /// include stack.
    fn with_file<F>(&mut self, path: &Path, from: &Path, line: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self, &str) -> Result<()>,
    {
        let key = canonical(path);
        if self.files.contains(&key) {
            return Err(Error::at(
                from,
                line,
                format!("recursive /include/ of '{}'", path.display()),
            ));
        }

        debug!("including {}", path.display());
        let source = fs::read_to_string(path)
            .map_err(|e| Error::at(from, line, format!("could not read '{}': {}", path.display(), e)))?;

        self.files.push(key);
        let res = f(self, &source);
        self.files.pop();
        res
    }
}

fn append_cells(
    prop: &mut Property,
    bits: u32,
    cells: &[PropertyCell],
    file: &Path,
    line: u32,
) -> Result<()> {
    let size = bits as usize / 8;
    prop.add_marker(MarkerKind::from_bits(bits), None);

    for cell in cells {
        match cell {
            PropertyCell::Label(label) => {
                prop.add_marker(MarkerKind::Label, Some(label.to_string()))
            }
            PropertyCell::Ref(r) => {
                if bits != 32 {
                    return Err(Error::at(
                        file,
                        line,
                        "phandle references are only allowed in arrays with 32-bit elements",
                    ));
                }
                prop.add_marker(MarkerKind::Phandle, Some(r.to_string()));
                prop.value.extend_from_slice(&[0; 4]);
            }
            PropertyCell::Expr(expr) => {
                let value = eval(expr, file, line)?;
                let bytes = property::int_to_be(value, size).ok_or_else(|| {
                    Error::at(file, line, format!("{} does not fit in {} bits", value, bits))
                })?;
                prop.value.extend(bytes);
            }
        }
    }

    Ok(())
}

fn eval(expr: &ast::Expression, file: &Path, line: u32) -> Result<i128> {
    expr.eval()
        .ok_or_else(|| Error::at(file, line, "division by zero"))
}

fn eval_u64(expr: &ast::Expression, file: &Path, line: u32) -> Result<u64> {
    let value = eval(expr, file, line)?;
    property::int_to_be(value, 8)
        .and_then(|bytes| property::be_int(&bytes))
        .map(|v| v as u64)
        .ok_or_else(|| Error::at(file, line, format!("{} does not fit in 64 bits", value)))
}

fn item_line(item: &RootItem) -> u32 {
    match item {
        RootItem::Version => 1,
        RootItem::Include(inc) => inc.line,
        RootItem::Node(node) => node.line,
        RootItem::OmitNode(_, line) | RootItem::DeleteNode(_, line) => *line,
        RootItem::MemReserve(m) => m.line,
    }
}

fn push_no_dup(labels: &mut Vec<String>, label: &str) {
    if !labels.iter().any(|l| l == label) {
        labels.push(label.to_string());
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<Tree> {
        Tree::from_source(source, "test.dts", &ParseOptions::default())
    }

    fn cells(tree: &Tree, path: &str, prop: &str) -> Vec<u32> {
        let node = tree.node(tree.get_node(path).unwrap());
        node.prop(prop)
            .unwrap()
            .value()
            .chunks_exact(4)
            .map(property::be_u32)
            .collect()
    }

    #[test]
    fn merge_nodes_and_properties() {
        let tree = parse(
            r#"/dts-v1/;
            / {
                a: node { x = <1>; y = <2>; sub { }; };
            };
            / {
                node { x = <3>; other { }; };
            };
            b: &a { z = <4>; sub { w; }; };
            "#,
        )
        .unwrap();

        let id = tree.get_node("/node").unwrap();
        let node = tree.node(id);

        assert_eq!(node.labels(), ["a", "b"]);
        assert_eq!(node.props().keys().collect::<Vec<_>>(), ["x", "y", "z"]);
        assert_eq!(node.children().keys().collect::<Vec<_>>(), ["sub", "other"]);
        assert_eq!(cells(&tree, "/node", "x"), [3]);
        assert!(tree.has_node("/node/sub"));
        assert_eq!(tree.label2node().get("b"), Some(&id));
    }

    #[test]
    fn deletions_apply_after_the_block() {
        let tree = parse(
            r#"/dts-v1/;
            / {
                keep { };
                gone { };
                /delete-node/ gone;
                /delete-property/ p;
                p = <1>;
                q = <2>;
            };
            / { t: target { }; };
            /delete-node/ &t;
            "#,
        )
        .unwrap();

        let root = tree.node(tree.root());
        assert_eq!(root.children().keys().collect::<Vec<_>>(), ["keep"]);
        assert_eq!(root.props().keys().collect::<Vec<_>>(), ["q"]);
        assert!(!tree.has_node("/target"));
    }

    #[test]
    fn resolve_references() {
        let tree = parse(
            r#"/dts-v1/;
            / {
                a: a { phandle = <7>; };
                b: b { };
                c {
                    refs = <&a &b &{/a}>;
                    path = "x", &b, "y";
                    lbl = <1 mid: 2>;
                };
            };
            "#,
        )
        .unwrap();

        let a = tree.get_node("/a").unwrap();
        let b = tree.get_node("/b").unwrap();

        assert_eq!(cells(&tree, "/c", "refs"), [7, 1, 7]);
        assert_eq!(tree.phandle2node().get(&1), Some(&b));
        assert_eq!(tree.phandle2node().get(&7), Some(&a));
        assert_eq!(cells(&tree, "/b", "phandle"), [1]);

        let c = tree.node(tree.get_node("/c").unwrap());
        let path = c.prop("path").unwrap();
        assert_eq!(path.value(), b"x\0/b\0y\0");
        assert_eq!(
            path.markers().iter().map(|m| m.offset).collect::<Vec<_>>(),
            [0, 2, 5]
        );
        assert_eq!(
            tree.label2prop_offset().get("mid"),
            Some(&(tree.get_node("/c").unwrap(), "lbl".to_string(), 4))
        );
    }

    #[test]
    fn aliases_and_omitted_nodes() {
        let tree = parse(
            r#"/dts-v1/;
            / {
                aliases { serial-0 = &uart; };
                soc {
                    uart: uart@1000 { };
                    /omit-if-no-ref/ unused: unused { };
                    used: used { };
                };
                user { p = <&used>; };
            };
            "#,
        )
        .unwrap();

        assert_eq!(
            tree.get_node("serial-0").unwrap(),
            tree.get_node("/soc/uart@1000").unwrap()
        );
        assert!(tree.has_node("/soc/used"));
        assert!(!tree.has_node("/soc/unused"));
        assert!(tree.label2node().get("unused").is_none());
        assert!(tree.get_node("nope/x").is_err());
    }

    #[test]
    fn version_directive_is_required() {
        let err = parse("/ { };").unwrap_err();
        assert!(err.message().contains("/dts-v1/"), "{}", err);

        let forced = ParseOptions {
            force: true,
            ..Default::default()
        };
        assert!(Tree::from_source("/ { };", "test.dts", &forced).is_ok());
    }

    #[test]
    fn reject_invalid_trees() {
        for (source, needle) in [
            ("/dts-v1/;", "no root node defined"),
            ("/dts-v1/; / { a { }; a { }; };", "defined more than once"),
            ("/dts-v1/; / { a@1@2 { }; };", "multiple '@'"),
            ("/dts-v1/; / { p@1 = <1>; };", "'@' is only allowed in node names"),
            ("/dts-v1/; / { p = <&missing>; };", "undefined node label 'missing'"),
            ("/dts-v1/; &missing { };", "undefined node label 'missing'"),
            ("/dts-v1/; / { p = &{/nope}; };", "non-existent node with path '/nope'"),
            ("/dts-v1/; / { a: x { }; a: y { }; };", "label 'a' appears on /x and on /y"),
            ("/dts-v1/; / { a { phandle = <1>; }; b { phandle = <1>; }; };", "duplicated phandle"),
            ("/dts-v1/; / { a { phandle = <0>; }; };", "bad value 0x0 for phandle"),
            ("/dts-v1/; / { a { phandle = <1 2>; }; };", "bad phandle length"),
            ("/dts-v1/; / { p = /bits/ 8 <256>; };", "256 does not fit in 8 bits"),
            ("/dts-v1/; / { x: x { }; p = /bits/ 16 <&x>; };", "only allowed in arrays with 32-bit"),
            ("/dts-v1/; / { p = <(1 / 0)>; };", "division by zero"),
            ("/dts-v1/; / { aliases { Bad = \"/\"; }; };", "alias property name"),
            ("/dts-v1/; /include/ \"missing.dtsi\"", "could not be found"),
        ] {
            let err = parse(source).unwrap_err();
            assert!(err.to_string().contains(needle), "{}: {}", source, err);
        }
    }

    #[test]
    fn negative_values_wrap() {
        let tree = parse("/dts-v1/; / { p = <(-1)>; q = /bits/ 8 <(-2)>; };").unwrap();
        let root = tree.node(tree.root());

        assert_eq!(cells(&tree, "/", "p"), [u32::MAX]);
        assert_eq!(root.prop("q").unwrap().value(), [0xfe]);
    }

    #[test]
    fn self_referential_phandle() {
        let tree = parse("/dts-v1/; / { n: n { phandle = <&n>; }; m { phandle = <1>; }; };").unwrap();

        assert_eq!(cells(&tree, "/n", "phandle"), [2]);
        assert_eq!(tree.phandle2node().len(), 2);
    }

    #[test]
    fn memreserves() {
        let tree = parse("/dts-v1/; r: /memreserve/ 0x1000 (0x10 * 2); / { };").unwrap();

        assert_eq!(
            tree.memreserves(),
            [MemReserve {
                labels: vec!["r".to_string()],
                address: 0x1000,
                size: 0x20,
            }]
        );
    }
}
