use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    sync::Arc,
};

use serde::Deserialize;

/// Receives the warnings emitted while building an [`Edt`](crate::Edt).
pub trait Reporter: Send + Sync {
    fn warn(&self, message: &str);
}

/// Forwards warnings to `log::warn!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn warn(&self, message: &str) {
        log::warn!("{}", message);
    }
}

/// Options for building an [`Edt`](crate::Edt).
///
/// Deserializes from kebab-case keys, so a front-end can read it from a
/// config file:
///
/// ```toml
/// werror = true
/// infer-binding-for-paths = ["/zephyr,user"]
///
/// [vendor-prefixes]
/// vnd = "A Vendor"
/// ```
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EdtOptions {
    /// Warn when the unit address of a node differs from its first `reg`
    /// address.
    pub warn_reg_unit_address_mismatch: bool,
    /// Give nodes without a binding the standard properties (`reg`,
    /// `status`, `interrupts`, ...).
    pub default_prop_types: bool,
    /// `fixed-partitions` nodes never sit on a bus, so their binding matches
    /// whatever bus the flash controller is on.
    pub support_fixed_partitions_on_any_bus: bool,
    /// Nodes whose binding is made up from the properties they have.
    pub infer_binding_for_paths: BTreeSet<String>,
    /// Known vendor prefixes. When non-empty, compatibles with an unknown
    /// prefix produce a warning.
    pub vendor_prefixes: BTreeMap<String, String>,
    /// Turn warnings into errors.
    pub werror: bool,
    /// Search path for `/include/` and `/incbin/` in the DTS.
    pub include_path: Vec<PathBuf>,
    #[serde(skip, default = "default_reporter")]
    pub reporter: Arc<dyn Reporter>,
}

fn default_reporter() -> Arc<dyn Reporter> {
    Arc::new(LogReporter)
}

impl Default for EdtOptions {
    fn default() -> Self {
        Self {
            warn_reg_unit_address_mismatch: false,
            default_prop_types: true,
            support_fixed_partitions_on_any_bus: false,
            infer_binding_for_paths: BTreeSet::new(),
            vendor_prefixes: BTreeMap::new(),
            werror: false,
            include_path: Vec::new(),
            reporter: default_reporter(),
        }
    }
}

impl fmt::Debug for EdtOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdtOptions")
            .field(
                "warn_reg_unit_address_mismatch",
                &self.warn_reg_unit_address_mismatch,
            )
            .field("default_prop_types", &self.default_prop_types)
            .field(
                "support_fixed_partitions_on_any_bus",
                &self.support_fixed_partitions_on_any_bus,
            )
            .field("infer_binding_for_paths", &self.infer_binding_for_paths)
            .field("vendor_prefixes", &self.vendor_prefixes)
            .field("werror", &self.werror)
            .field("include_path", &self.include_path)
            .finish_non_exhaustive()
    }
}
