//! Devicetree bindings.
//!
//! A binding is a YAML document describing the properties a node may or must
//! have. Bindings pull in other bindings with `include:`, optionally through
//! property allow/block lists, and describe child nodes with `child-binding:`.
//!
//! ```yaml
//! description: Example UART
//! compatible: "vnd,uart"
//! include: [base.yaml, { name: pinctrl.yaml, property-allowlist: [pinctrl-0] }]
//! on-bus: apb
//! properties:
//!   current-speed:
//!     type: int
//!     required: true
//! ```

use std::{
    cell::RefCell,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dts_parser::{Error, Result};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};

use crate::{node::PropertyValue, str_as_token};

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropType {
    Boolean,
    Int,
    Array,
    Uint8Array,
    String,
    StringArray,
    Phandle,
    Phandles,
    PhandleArray,
    Path,
    Compound,
}

impl PropType {
    pub const ALL: [PropType; 11] = [
        PropType::Boolean,
        PropType::Int,
        PropType::Array,
        PropType::Uint8Array,
        PropType::String,
        PropType::StringArray,
        PropType::Phandle,
        PropType::Phandles,
        PropType::PhandleArray,
        PropType::Path,
        PropType::Compound,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PropType::Boolean => "boolean",
            PropType::Int => "int",
            PropType::Array => "array",
            PropType::Uint8Array => "uint8-array",
            PropType::String => "string",
            PropType::StringArray => "string-array",
            PropType::Phandle => "phandle",
            PropType::Phandles => "phandles",
            PropType::PhandleArray => "phandle-array",
            PropType::Path => "path",
            PropType::Compound => "compound",
        }
    }

    pub fn parse(s: &str) -> Option<PropType> {
        PropType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declaration of one property under `properties:`.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    name: String,
    path: Option<PathBuf>,
    type_: PropType,
    description: Option<String>,
    enum_: Option<Vec<Value>>,
    const_: Option<PropertyValue>,
    default: Option<PropertyValue>,
    required: bool,
    deprecated: bool,
    specifier_space: Option<String>,
}

impl PropertySpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The binding file that last modified this property, following
    /// `include:`s.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn type_(&self) -> PropType {
        self.type_
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn enum_(&self) -> Option<&[Value]> {
        self.enum_.as_deref()
    }

    pub fn const_(&self) -> Option<&PropertyValue> {
        self.const_.as_ref()
    }

    pub fn default(&self) -> Option<&PropertyValue> {
        self.default.as_ref()
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn deprecated(&self) -> bool {
        self.deprecated
    }

    pub fn specifier_space(&self) -> Option<&str> {
        self.specifier_space.as_deref()
    }

    /// Whether the `enum:` of a string property maps to distinct
    /// identifiers.
    pub fn enum_tokenizable(&self) -> bool {
        self.enum_tokens().is_some_and(|tokens| all_unique(&tokens))
    }

    /// Like [`PropertySpec::enum_tokenizable`], with the identifiers
    /// uppercased.
    pub fn enum_upper_tokenizable(&self) -> bool {
        self.enum_tokens().is_some_and(|tokens| {
            let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();
            all_unique(&tokens) && all_unique(&upper)
        })
    }

    fn enum_tokens(&self) -> Option<Vec<String>> {
        if self.type_ != PropType::String {
            return None;
        }

        self.enum_
            .as_ref()?
            .iter()
            .map(|v| v.as_str().map(str_as_token))
            .collect()
    }

    /// Spec used for properties that have no binding, when untyped
    /// properties get their standard types.
    pub(crate) fn standard(name: &str, type_: PropType) -> PropertySpec {
        let enum_ = (name == "status").then(|| {
            STATUS_VALUES
                .iter()
                .map(|s| Value::String(s.to_string()))
                .collect()
        });

        PropertySpec {
            name: name.to_string(),
            path: None,
            type_,
            description: None,
            enum_,
            const_: None,
            default: None,
            required: false,
            deprecated: false,
            specifier_space: None,
        }
    }

    fn from_raw(name: &str, options: &Mapping, path: Option<PathBuf>) -> Result<PropertySpec> {
        let type_ = options
            .get("type")
            .and_then(Value::as_str)
            .and_then(PropType::parse)
            .ok_or_else(|| err(path.as_deref(), format!("missing type for '{}'", name)))?;

        let convert = |key: &str| -> Result<Option<PropertyValue>> {
            let Some(value) = options.get(key) else {
                return Ok(None);
            };
            PropertyValue::from_yaml(type_, value).map(Some).ok_or_else(|| {
                err(
                    path.as_deref(),
                    format!(
                        "'{}: {}' is invalid for '{}' in 'properties:', which has type {}",
                        key,
                        show(value),
                        name,
                        type_
                    ),
                )
            })
        };
        let const_ = convert("const")?;
        let default = convert("default")?;

        Ok(PropertySpec {
            name: name.to_string(),
            type_,
            description: options
                .get("description")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            enum_: options.get("enum").and_then(Value::as_sequence).cloned(),
            const_,
            default,
            required: options.get("required").and_then(Value::as_bool) == Some(true),
            deprecated: options.get("deprecated").and_then(Value::as_bool) == Some(true),
            specifier_space: options
                .get("specifier-space")
                .and_then(Value::as_str)
                .map(str::to_string),
            path,
        })
    }
}

pub(crate) const STATUS_VALUES: [&str; 6] = ["ok", "okay", "disabled", "reserved", "fail", "fail-sss"];

/// A loaded binding, with its `include:`s merged in.
#[derive(Debug, Clone)]
pub struct Binding {
    path: Option<PathBuf>,
    raw: Mapping,
    description: Option<String>,
    compatible: Option<String>,
    buses: Vec<String>,
    on_bus: Option<String>,
    prop2specs: IndexMap<String, Arc<PropertySpec>>,
    specifier2cells: IndexMap<String, Vec<String>>,
    child_binding: Option<Arc<Binding>>,
}

/// Property allow/block lists inherited from including bindings.
#[derive(Debug, Clone, Default)]
struct Filter {
    allowlist: Option<Vec<String>>,
    blocklist: Option<Vec<String>>,
}

impl Binding {
    /// Loads the binding at `path`. `fname2path` maps the file names that
    /// may appear in `include:` to their paths.
    pub fn from_file(
        path: impl AsRef<Path>,
        fname2path: &IndexMap<String, PathBuf>,
    ) -> Result<Binding> {
        let path = path.as_ref();
        let raw = match load_yaml(path)? {
            Value::Mapping(raw) => raw,
            _ => return Err(Error::in_file(path, "invalid contents, expected a mapping")),
        };

        Binding::from_raw(Some(path), raw, fname2path, true, true)
    }

    /// Builds a binding from already parsed YAML. `path` is only used for
    /// provenance and error messages.
    pub fn from_raw(
        path: Option<&Path>,
        raw: Mapping,
        fname2path: &IndexMap<String, PathBuf>,
        require_compatible: bool,
        require_description: bool,
    ) -> Result<Binding> {
        let loader = Loader {
            fname2path,
            includes: RefCell::new(path.map(Path::to_path_buf).into_iter().collect()),
        };
        loader.build(
            path,
            raw,
            require_compatible,
            require_description,
            &Filter::default(),
        )
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The merged YAML contents.
    pub fn raw(&self) -> &Mapping {
        &self.raw
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn compatible(&self) -> Option<&str> {
        self.compatible.as_deref()
    }

    /// Buses provided to child nodes (`bus:`).
    pub fn buses(&self) -> &[String] {
        &self.buses
    }

    /// The bus this binding applies on (`on-bus:`).
    pub fn on_bus(&self) -> Option<&str> {
        self.on_bus.as_deref()
    }

    pub fn prop2specs(&self) -> &IndexMap<String, Arc<PropertySpec>> {
        &self.prop2specs
    }

    /// Cell names per specifier space, from the `<space>-cells:` keys.
    pub fn specifier2cells(&self) -> &IndexMap<String, Vec<String>> {
        &self.specifier2cells
    }

    pub fn child_binding(&self) -> Option<&Arc<Binding>> {
        self.child_binding.as_ref()
    }

    /// Binding that gives each property of `props` the type of its value,
    /// for nodes with no binding of their own.
    pub(crate) fn inferred(props: impl IntoIterator<Item = (String, PropType)>) -> Binding {
        let mut raw = Mapping::new();
        let mut properties = Mapping::new();
        let mut prop2specs = IndexMap::new();

        for (name, type_) in props {
            let mut options = Mapping::new();
            options.insert("type".into(), type_.as_str().into());
            properties.insert(name.as_str().into(), Value::Mapping(options));
            prop2specs.insert(name.clone(), Arc::new(PropertySpec::standard(&name, type_)));
        }
        raw.insert("properties".into(), Value::Mapping(properties));

        Binding {
            path: None,
            raw,
            description: None,
            compatible: None,
            buses: Vec::new(),
            on_bus: None,
            prop2specs,
            specifier2cells: IndexMap::new(),
            child_binding: None,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<Binding")?;
        if let Some(compatible) = &self.compatible {
            write!(f, " for compatible '{}'", compatible)?;
        }
        if let Some(path) = &self.path {
            write!(f, " {}", path.display())?;
        }
        f.write_str(">")
    }
}

/// Loads every binding in `paths`. With `ignore_errors`, bindings that fail
/// to load are skipped.
pub fn bindings_from_paths(paths: &[PathBuf], ignore_errors: bool) -> Result<Vec<Binding>> {
    let fname2path = fname2path(paths);
    let mut bindings = Vec::new();

    for path in paths {
        match Binding::from_file(path, &fname2path) {
            Ok(binding) => bindings.push(binding),
            Err(e) if ignore_errors => log::debug!("skipping {}: {}", path.display(), e),
            Err(e) => return Err(e),
        }
    }

    Ok(bindings)
}

/// Maps file names to paths, for resolving `include:`.
pub fn fname2path(paths: &[PathBuf]) -> IndexMap<String, PathBuf> {
    paths
        .iter()
        .filter_map(|p| {
            let fname = p.file_name()?.to_str()?;
            Some((fname.to_string(), p.clone()))
        })
        .collect()
}

/// Reads a YAML file, expanding `!include` tags and `<<` merge keys.
pub(crate) fn load_yaml(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::in_file(path, format!("could not read binding: {}", e)))?;
    parse_yaml(&text, Some(path))
}

pub(crate) fn parse_yaml(text: &str, path: Option<&Path>) -> Result<Value> {
    let mut value: Value = serde_yaml::from_str(text)
        .map_err(|e| err(path, format!("invalid YAML: {}", e)))?;
    value
        .apply_merge()
        .map_err(|e| err(path, format!("invalid YAML: {}", e)))?;

    expand_include_tags(value, path)
}

/// `!include foo.yaml` and `!include [a.yaml, b.yaml]` are the legacy
/// spelling of an include list.
fn expand_include_tags(value: Value, path: Option<&Path>) -> Result<Value> {
    Ok(match value {
        Value::Tagged(tagged) => {
            if tagged.tag != "!include" {
                return Err(err(path, format!("unknown tag {}", tagged.tag)));
            }
            match tagged.value {
                Value::String(s) => Value::Sequence(vec![Value::String(s)]),
                Value::Sequence(seq) => Value::Sequence(seq),
                _ => {
                    return Err(err(
                        path,
                        "unrecognised node type in !include statement",
                    ))
                }
            }
        }
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(|v| expand_include_tags(v, path))
                .collect::<Result<_>>()?,
        ),
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| Ok((k, expand_include_tags(v, path)?)))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

struct Loader<'a> {
    fname2path: &'a IndexMap<String, PathBuf>,
    /// Files being loaded, outermost first.
    includes: RefCell<Vec<PathBuf>>,
}

impl Loader<'_> {
    fn build(
        &self,
        path: Option<&Path>,
        raw: Mapping,
        require_compatible: bool,
        require_description: bool,
        filter: &Filter,
    ) -> Result<Binding> {
        let last_modified: Vec<String> = raw
            .get("properties")
            .and_then(Value::as_mapping)
            .map(|props| props.keys().map(key_str).collect())
            .unwrap_or_default();

        let mut provenance = IndexMap::new();
        let raw = self.merge_includes(raw, path, filter, &mut provenance)?;

        let child_binding = match raw.get("child-binding") {
            None => None,
            Some(Value::Mapping(child)) => Some(Arc::new(self.build(
                path,
                child.clone(),
                false,
                false,
                &Filter::default(),
            )?)),
            Some(_) => {
                return Err(err(
                    path,
                    "malformed 'child-binding:', expected a binding (dictionary with keys/values)",
                ))
            }
        };

        let buses = check(&raw, path, require_compatible, require_description)?;

        for name in last_modified {
            provenance.insert(name, path.map(Path::to_path_buf));
        }

        let empty = Mapping::new();
        let properties = raw
            .get("properties")
            .and_then(Value::as_mapping)
            .unwrap_or(&empty);
        let mut prop2specs = IndexMap::new();
        for (name, spec_path) in provenance {
            let Some(options) = properties.get(name.as_str()).and_then(Value::as_mapping) else {
                continue;
            };
            let spec = PropertySpec::from_raw(&name, options, spec_path)?;
            prop2specs.insert(name, Arc::new(spec));
        }

        let specifier2cells = raw
            .iter()
            .filter_map(|(key, value)| {
                let space = key.as_str()?.strip_suffix("-cells")?;
                let cells = value
                    .as_sequence()?
                    .iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect();
                Some((space.to_string(), cells))
            })
            .collect();

        Ok(Binding {
            path: path.map(Path::to_path_buf),
            description: raw
                .get("description")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            compatible: raw
                .get("compatible")
                .and_then(Value::as_str)
                .map(str::to_string),
            on_bus: raw.get("on-bus").and_then(Value::as_str).map(str::to_string),
            buses,
            prop2specs,
            specifier2cells,
            child_binding,
            raw,
        })
    }

    /// Merges the files listed in `include:` into `raw`, recording in
    /// `provenance` which file last modified each included property.
    fn merge_includes(
        &self,
        mut raw: Mapping,
        binding_path: Option<&Path>,
        filter: &Filter,
        provenance: &mut IndexMap<String, Option<PathBuf>>,
    ) -> Result<Mapping> {
        let Some(include) = raw.remove("include") else {
            return Ok(raw);
        };

        let mut merged = Mapping::new();
        let mut merge_file = |name: &str, filter: &Filter, child_filter: Option<&Value>| -> Result<()> {
            let contents = self.load_include(name, filter, child_filter, binding_path, provenance)?;
            merge_props(&mut merged, &contents, None, binding_path, false)
        };

        match include {
            Value::String(name) => merge_file(&name, filter, None)?,
            Value::Sequence(elems) => {
                for elem in elems {
                    match elem {
                        Value::String(name) => merge_file(&name, filter, None)?,
                        Value::Mapping(mut elem) => {
                            let name = elem.remove("name");
                            let allowlist = elem.remove("property-allowlist");
                            let blocklist = elem.remove("property-blocklist");
                            let child_filter = elem.remove("child-binding");

                            let Some(name) = name.as_ref().and_then(Value::as_str) else {
                                return Err(err(
                                    binding_path,
                                    "'include:' element should have a 'name' key",
                                ));
                            };
                            if !elem.is_empty() {
                                return Err(err(
                                    binding_path,
                                    format!(
                                        "'include:' should not have these unexpected contents: {}",
                                        show(&Value::Mapping(elem))
                                    ),
                                ));
                            }

                            let filter = Filter {
                                allowlist: inherit(
                                    string_list(allowlist.as_ref(), "property-allowlist", binding_path)?,
                                    &filter.allowlist,
                                ),
                                blocklist: inherit(
                                    string_list(blocklist.as_ref(), "property-blocklist", binding_path)?,
                                    &filter.blocklist,
                                ),
                            };
                            check_include_filters(name, &filter, child_filter.as_ref(), binding_path)?;

                            merge_file(name, &filter, child_filter.as_ref())?;
                        }
                        other => {
                            return Err(err(
                                binding_path,
                                format!(
                                    "all elements in 'include:' should be either strings or maps \
                                     with a 'name' key and optional 'property-allowlist' or \
                                     'property-blocklist' keys, but got: {}",
                                    show(&other)
                                ),
                            ))
                        }
                    }
                }
            }
            other => {
                return Err(err(
                    binding_path,
                    format!("'include:' should be a string or list, not {}", show(&other)),
                ))
            }
        }

        merge_props(&mut raw, &merged, None, binding_path, true)?;
        Ok(raw)
    }

    /// Loads an included file, filtered and with its own includes merged.
    fn load_include(
        &self,
        fname: &str,
        filter: &Filter,
        child_filter: Option<&Value>,
        binding_path: Option<&Path>,
        provenance: &mut IndexMap<String, Option<PathBuf>>,
    ) -> Result<Mapping> {
        let Some(path) = self.fname2path.get(fname) else {
            return Err(err(binding_path, format!("'{}' not found", fname)));
        };

        let mut contents = match load_yaml(path)? {
            Value::Mapping(contents) => contents,
            _ => return Err(Error::in_file(path, "invalid contents, expected a mapping")),
        };
        filter_properties(&mut contents, filter, child_filter, binding_path)?;

        if self.includes.borrow().contains(path) {
            let chain: Vec<String> = self
                .includes
                .borrow()
                .iter()
                .chain([path])
                .map(|p| file_name(p))
                .collect();
            return Err(err(
                binding_path,
                format!("'{}' includes itself ({})", fname, chain.join(" -> ")),
            ));
        }

        self.includes.borrow_mut().push(path.clone());
        let included = self.build(Some(path), contents, false, false, filter);
        self.includes.borrow_mut().pop();
        let included = included?;
        for (name, spec) in &included.prop2specs {
            provenance
                .entry(name.clone())
                .or_insert_with(|| spec.path.clone());
        }

        Ok(included.raw)
    }
}

/// Merges `from` into `to`. Nested mappings merge recursively and keys
/// missing from `to` are added. A key present on both sides must agree,
/// except for `description`, `title`, `compatible` and `required`; the
/// latter is OR'ed.
fn merge_props(
    to: &mut Mapping,
    from: &Mapping,
    parent: Option<&str>,
    binding_path: Option<&Path>,
    check_required: bool,
) -> Result<()> {
    for (key, from_value) in from {
        let name = key_str(key);

        if !to.contains_key(key) {
            to.insert(key.clone(), from_value.clone());
            continue;
        }

        let Some(to_value) = to.get_mut(key) else {
            continue;
        };

        match (to_value, from_value) {
            (Value::Mapping(to_map), Value::Mapping(from_map)) => {
                merge_props(to_map, from_map, Some(&name), binding_path, check_required)?
            }
            (to_value, _) if bad_overwrite(&name, &*to_value, from_value, check_required) => {
                return Err(err(
                    binding_path,
                    format!(
                        "(in '{}'): '{}' from included file overwritten ('{}' replaced with '{}')",
                        parent.unwrap_or("None"),
                        name,
                        show(from_value),
                        show(to_value)
                    ),
                ));
            }
            (to_value, _) if name == "required" => {
                let (Some(to_required), Some(from_required)) =
                    (to_value.as_bool(), from_value.as_bool())
                else {
                    return Err(err(
                        binding_path,
                        format!(
                            "malformed 'required:' setting for '{}' in 'properties', expected true/false",
                            parent.unwrap_or("None")
                        ),
                    ));
                };
                *to_value = Value::Bool(to_required || from_required);
            }
            _ => {}
        }
    }

    Ok(())
}

fn bad_overwrite(name: &str, to: &Value, from: &Value, check_required: bool) -> bool {
    if to == from {
        return false;
    }

    match name {
        "title" | "description" | "compatible" => false,
        "required" => check_required && from.as_bool() == Some(true) && to.as_bool() == Some(false),
        _ => true,
    }
}

/// Applies the include filters to `raw`'s properties, and the
/// `child-binding` filters down its chain of child bindings.
fn filter_properties(
    raw: &mut Mapping,
    filter: &Filter,
    child_filter: Option<&Value>,
    binding_path: Option<&Path>,
) -> Result<()> {
    if let Some(Value::Mapping(props)) = raw.get_mut("properties") {
        filter_props(props, filter);
    }

    let mut child_filter = child_filter;
    let mut child = raw.get_mut("child-binding");

    while let (Some(Value::Mapping(filter)), Some(Value::Mapping(binding))) = (child_filter, child) {
        let filter_here = Filter {
            allowlist: string_list(filter.get("property-allowlist"), "property-allowlist", binding_path)?,
            blocklist: string_list(filter.get("property-blocklist"), "property-blocklist", binding_path)?,
        };
        if let Some(Value::Mapping(props)) = binding.get_mut("properties") {
            filter_props(props, &filter_here);
        }

        child_filter = filter.get("child-binding");
        child = binding.get_mut("child-binding");
    }

    Ok(())
}

fn filter_props(props: &mut Mapping, filter: &Filter) {
    let keep = |name: &str| match (&filter.allowlist, &filter.blocklist) {
        (Some(allow), _) => allow.iter().any(|a| a == name),
        (None, Some(block)) => !block.iter().any(|b| b == name),
        (None, None) => true,
    };

    let dropped: Vec<Value> = props
        .keys()
        .filter(|k| !keep(&key_str(k)))
        .cloned()
        .collect();
    for key in dropped {
        props.remove(&key);
    }
}

fn check_include_filters(
    name: &str,
    filter: &Filter,
    child_filter: Option<&Value>,
    binding_path: Option<&Path>,
) -> Result<()> {
    let both = || {
        err(
            binding_path,
            format!(
                "'include:' of file '{}' should not specify both 'property-allowlist:' and \
                 'property-blocklist:'",
                name
            ),
        )
    };

    if filter.allowlist.is_some() && filter.blocklist.is_some() {
        return Err(both());
    }

    let mut child_filter = child_filter;
    while let Some(value) = child_filter {
        let Value::Mapping(map) = value else {
            return Err(err(
                binding_path,
                format!("'child-binding' in 'include:' of file '{}' should be a mapping", name),
            ));
        };

        let unexpected: Vec<String> = map
            .keys()
            .map(key_str)
            .filter(|k| !["property-allowlist", "property-blocklist", "child-binding"].contains(&k.as_str()))
            .collect();
        if !unexpected.is_empty() {
            return Err(err(
                binding_path,
                format!(
                    "'include:' of file '{}' should not have these unexpected contents in a \
                     'child-binding': {}",
                    name,
                    unexpected.join(", ")
                ),
            ));
        }
        if map.contains_key("property-allowlist") && map.contains_key("property-blocklist") {
            return Err(both());
        }

        child_filter = map.get("child-binding");
    }

    Ok(())
}

/// Own filter entries extended with the ones inherited from the includer.
fn inherit(own: Option<Vec<String>>, inherited: &Option<Vec<String>>) -> Option<Vec<String>> {
    match (own, inherited) {
        (Some(mut own), Some(inherited)) => {
            own.extend(inherited.iter().cloned());
            Some(own)
        }
        (Some(own), None) => Some(own),
        (None, inherited) => inherited.clone(),
    }
}

/// Checks the merged binding and returns its `bus:` list.
fn check(
    raw: &Mapping,
    path: Option<&Path>,
    require_compatible: bool,
    require_description: bool,
) -> Result<Vec<String>> {
    match raw.get("compatible") {
        Some(Value::String(_)) => {}
        Some(other) => {
            return Err(err(
                path,
                format!("malformed 'compatible: {}' field, should be a string", show(other)),
            ))
        }
        None if require_compatible => return Err(err(path, "missing 'compatible'")),
        None => {}
    }

    match raw.get("description") {
        Some(Value::String(s)) if !s.is_empty() => {}
        Some(_) => return Err(err(path, "malformed or empty 'description'")),
        None if require_description => return Err(err(path, "missing 'description'")),
        None => {}
    }

    const OK_TOP: [&str; 6] = [
        "description",
        "compatible",
        "bus",
        "on-bus",
        "properties",
        "child-binding",
    ];

    for key in raw.keys() {
        let key = key_str(key);
        let legacy = match key.as_str() {
            "#cells" => Some("expected *-cells syntax"),
            "child" | "child-bus" => Some("use 'bus: <bus>' instead"),
            "parent" | "parent-bus" => Some("use 'on-bus: <bus>' instead"),
            "sub-node" => Some("use 'child-binding' instead"),
            "title" => Some("use 'description' instead"),
            _ => None,
        };
        if let Some(hint) = legacy {
            return Err(err(path, format!("legacy '{}:', {}", key, hint)));
        }
        if !OK_TOP.contains(&key.as_str()) && !key.ends_with("-cells") {
            return Err(err(
                path,
                format!(
                    "unknown key '{}', expected one of {}, or *-cells",
                    key,
                    OK_TOP.join(", ")
                ),
            ));
        }
    }

    let buses = match raw.get("bus") {
        None => Vec::new(),
        Some(Value::String(bus)) => vec![bus.clone()],
        Some(other) => string_list(Some(other), "bus", path)?.ok_or_else(|| {
            err(path, "malformed 'bus:' value, expected string or list")
        })?,
    };

    if let Some(on_bus) = raw.get("on-bus") {
        if !on_bus.is_string() {
            return Err(err(path, "malformed 'on-bus:' value, expected string"));
        }
    }

    check_properties(raw, path)?;

    for (key, value) in raw {
        let key = key_str(key);
        if !key.ends_with("-cells") {
            continue;
        }
        let ok = value
            .as_sequence()
            .is_some_and(|cells| cells.iter().all(Value::is_string));
        if !ok {
            return Err(err(
                path,
                format!("malformed '{}:', expected a list of strings", key),
            ));
        }
    }

    Ok(buses)
}

fn check_properties(raw: &Mapping, path: Option<&Path>) -> Result<()> {
    const OK_PROP_KEYS: [&str; 8] = [
        "description",
        "required",
        "type",
        "enum",
        "const",
        "default",
        "deprecated",
        "specifier-space",
    ];

    let Some(properties) = raw.get("properties") else {
        return Ok(());
    };
    let Value::Mapping(properties) = properties else {
        return Err(err(path, "malformed 'properties:', expected a mapping"));
    };

    for (name, options) in properties {
        let name = key_str(name);
        let Value::Mapping(options) = options else {
            return Err(err(
                path,
                format!("malformed entry for '{}' in 'properties', expected a mapping", name),
            ));
        };

        for key in options.keys() {
            let key = key_str(key);
            if !OK_PROP_KEYS.contains(&key.as_str()) {
                return Err(err(
                    path,
                    format!(
                        "unknown setting '{}' in 'properties: {}: ...', expected one of {}",
                        key,
                        name,
                        OK_PROP_KEYS.join(", ")
                    ),
                ));
            }
        }

        check_prop_by_type(&name, options, path)?;

        for flag in ["required", "deprecated"] {
            if let Some(value) = options.get(flag) {
                if !value.is_bool() {
                    return Err(err(
                        path,
                        format!(
                            "malformed '{}:' setting '{}' for '{}' in 'properties', expected true/false",
                            flag,
                            show(value),
                            name
                        ),
                    ));
                }
            }
        }

        let is_true = |key: &str| options.get(key).and_then(Value::as_bool) == Some(true);
        if is_true("deprecated") && is_true("required") {
            return Err(err(
                path,
                format!(
                    "'{}' in 'properties' should not have both 'deprecated' and 'required' set",
                    name
                ),
            ));
        }

        if let Some(description) = options.get("description") {
            if description.as_str().map_or(true, str::is_empty) {
                return Err(err(
                    path,
                    format!("missing, malformed, or empty 'description' for '{}' in 'properties'", name),
                ));
            }
        }

        if let Some(choices) = options.get("enum") {
            if !choices.is_sequence() {
                return Err(err(
                    path,
                    format!("enum in properties: {} should be a list, not {}", name, show(choices)),
                ));
            }
        }
    }

    Ok(())
}

fn check_prop_by_type(name: &str, options: &Mapping, path: Option<&Path>) -> Result<()> {
    let Some(type_name) = options.get("type") else {
        return Err(err(path, format!("missing 'type:' for '{}' in 'properties'", name)));
    };
    let Some(type_) = type_name.as_str().and_then(PropType::parse) else {
        let expected: Vec<&str> = PropType::ALL.iter().map(|t| t.as_str()).collect();
        return Err(err(
            path,
            format!(
                "'{}' in 'properties:' has unknown type '{}', expected one of {}",
                name,
                show(type_name),
                expected.join(", ")
            ),
        ));
    };

    let has_space = options.contains_key("specifier-space");
    if has_space && type_ != PropType::PhandleArray {
        return Err(err(
            path,
            format!(
                "'specifier-space' in 'properties: {}' has type '{}', expected 'phandle-array'",
                name, type_
            ),
        ));
    }
    if type_ == PropType::PhandleArray && !name.ends_with('s') && !has_space {
        return Err(err(
            path,
            format!(
                "'{}' in 'properties:' has type 'phandle-array' and its name does not end in 's', \
                 but no 'specifier-space' was provided.",
                name
            ),
        ));
    }

    const CONST_TYPES: [PropType; 5] = [
        PropType::Int,
        PropType::Array,
        PropType::Uint8Array,
        PropType::String,
        PropType::StringArray,
    ];
    if let Some(value) = options.get("const") {
        if !CONST_TYPES.contains(&type_) {
            return Err(err(
                path,
                format!(
                    "const for property '{}' has type '{}', expected one of int, array, \
                     uint8-array, string, string-array",
                    name, type_
                ),
            ));
        }
        if PropertyValue::from_yaml(type_, value).is_none() {
            return Err(err(
                path,
                format!(
                    "'const: {}' is invalid for '{}' in 'properties:', which has type {}",
                    show(value),
                    name,
                    type_
                ),
            ));
        }
    }

    let Some(default) = options.get("default") else {
        return Ok(());
    };

    if !CONST_TYPES.contains(&type_) {
        return Err(err(
            path,
            format!(
                "'default:' can't be combined with 'type: {}' for '{}' in 'properties:'",
                type_, name
            ),
        ));
    }
    if PropertyValue::from_yaml(type_, default).is_none() {
        return Err(err(
            path,
            format!(
                "'default: {}' is invalid for '{}' in 'properties:', which has type {}",
                show(default),
                name,
                type_
            ),
        ));
    }

    Ok(())
}

/// A `[a, b]` list of strings. `None` when absent.
fn string_list(value: Option<&Value>, what: &str, path: Option<&Path>) -> Result<Option<Vec<String>>> {
    let Some(value) = value else {
        return Ok(None);
    };

    value
        .as_sequence()
        .and_then(|seq| {
            seq.iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .map(Some)
        .ok_or_else(|| {
            err(
                path,
                format!("'{}' value {} should be a list of strings", what, show(value)),
            )
        })
}

fn all_unique(items: &[String]) -> bool {
    items
        .iter()
        .enumerate()
        .all(|(i, item)| !items[..i].contains(item))
}

fn key_str(key: &Value) -> String {
    show(key)
}

/// Short, single-line rendering of a YAML value for messages.
pub(crate) fn show(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(seq) => {
            let items: Vec<String> = seq.iter().map(show).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Mapping(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", show(k), show(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        Value::Tagged(tagged) => format!("{} {}", tagged.tag, show(&tagged.value)),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

fn err(path: Option<&Path>, message: impl Into<String>) -> Error {
    match path {
        Some(path) => Error::in_file(path, message),
        None => Error::new(message),
    }
}
