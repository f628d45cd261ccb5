//! Discovery and lookup of the bindings a devicetree uses.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dts_parser::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use serde_yaml::Value;

use crate::binding::{fname2path, parse_yaml, Binding};

/// Bindings keyed by `(compatible, on-bus)`.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    paths: Vec<PathBuf>,
    fname2path: IndexMap<String, PathBuf>,
    compat2binding: IndexMap<(String, Option<String>), Arc<Binding>>,
}

impl BindingRegistry {
    /// An empty registry whose `include:`s resolve against `paths`.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            fname2path: fname2path(&paths),
            paths,
            compat2binding: IndexMap::new(),
        }
    }

    /// Finds every binding under `dirs` and registers the ones whose
    /// `compatible` is in `compats`, along with their child bindings.
    pub fn from_dirs(dirs: &[PathBuf], compats: &IndexSet<String>) -> Result<Self> {
        let mut registry = Self::new(binding_paths(dirs)?);

        for path in registry.paths.clone() {
            let text = fs::read_to_string(&path)
                .map_err(|e| Error::in_file(&path, format!("could not read binding: {}", e)))?;

            // Most files are for hardware the tree doesn't have.
            if !compats.iter().any(|c| text.contains(c.as_str())) {
                continue;
            }

            let raw = parse_yaml(&text, Some(&path)).map_err(|e| {
                Error::in_file(
                    &path,
                    format!("appears in binding directories but isn't valid YAML: {}", e.message()),
                )
            })?;
            let Value::Mapping(raw) = raw else {
                continue;
            };
            match raw.get("compatible") {
                None => continue,
                Some(Value::String(compat)) if !compats.contains(compat) => continue,
                Some(_) => {}
            }

            let binding = Binding::from_raw(Some(&path), raw, &registry.fname2path, true, true)?;
            log::debug!("loaded binding {}", path.display());
            registry.register(Arc::new(binding))?;
        }

        Ok(registry)
    }

    /// Registers `binding` and every child binding below it that has a
    /// `compatible`. A second binding for the same compatible and bus is an
    /// error.
    pub fn register(&mut self, binding: Arc<Binding>) -> Result<()> {
        let mut next = Some(binding);

        while let Some(binding) = next {
            if let Some(compat) = binding.compatible() {
                let key = (compat.to_string(), binding.on_bus().map(str::to_string));

                if let Some(old) = self.compat2binding.get(&key) {
                    let mut message = format!(
                        "both {} and {} have 'compatible: {}'",
                        display_path(old.path()),
                        display_path(binding.path()),
                        compat
                    );
                    if let Some(bus) = binding.on_bus() {
                        message.push_str(&format!(" and 'on-bus: {}'", bus));
                    }
                    return Err(Error::new(message));
                }

                self.compat2binding.insert(key, binding.clone());
            }

            next = binding.child_binding().cloned();
        }

        Ok(())
    }

    pub fn get(&self, compat: &str, bus: Option<&str>) -> Option<&Arc<Binding>> {
        self.compat2binding
            .get(&(compat.to_string(), bus.map(str::to_string)))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Arc<Binding>> {
        self.compat2binding.values()
    }

    pub fn compat2binding(&self) -> &IndexMap<(String, Option<String>), Arc<Binding>> {
        &self.compat2binding
    }

    /// Every binding file found, registered or not.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn fname2path(&self) -> &IndexMap<String, PathBuf> {
        &self.fname2path
    }
}

/// Every `.yaml`/`.yml` file below `dirs`, in directory order with entries
/// sorted by name.
pub fn binding_paths(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<()> {
        let entries = fs::read_dir(dir)
            .map_err(|e| Error::in_file(dir, format!("could not read binding directory: {}", e)))?;
        let mut entries: Vec<PathBuf> = entries
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::in_file(dir, format!("could not read binding directory: {}", e)))?;
        entries.sort();

        for path in entries {
            if path.is_dir() {
                walk(&path, paths)?;
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            ) {
                paths.push(path);
            }
        }

        Ok(())
    }

    let mut paths = Vec::new();
    for dir in dirs {
        walk(dir, &mut paths)?;
    }

    Ok(paths)
}

pub(crate) fn display_path(path: Option<&Path>) -> String {
    path.map_or_else(|| "None".to_string(), |p| p.display().to_string())
}
