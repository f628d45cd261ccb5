mod logger;

use std::{fs, path::PathBuf, process};

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use edtlib::{ControllerAndData, Edt, EdtOptions, Node, PropertyValue};

/// Builds the extended devicetree of a DTS file and prints it.
#[derive(Debug, Parser)]
#[clap(version)]
struct Args {
    /// DTS file to read.
    dts: PathBuf,
    /// Directory searched (recursively) for YAML bindings. May be repeated.
    #[clap(short, long = "bindings-dir")]
    bindings_dirs: Vec<PathBuf>,
    /// Directory searched for `/include/`d files. May be repeated.
    #[clap(short = 'I', long = "include")]
    include_path: Vec<PathBuf>,
    /// Options file, in TOML, with kebab-case keys.
    #[clap(short, long, env = "EDT_DUMP_CONFIG")]
    config: Option<PathBuf>,
    /// `vendor-prefixes.txt` used to check compatibles.
    #[clap(long)]
    vendor_prefixes: Option<PathBuf>,
    /// Nodes whose binding is inferred from their properties. May be repeated.
    #[clap(long = "infer-binding")]
    infer_binding_for_paths: Vec<String>,
    /// Treat warnings as errors.
    #[clap(long)]
    werror: bool,
    /// Warn when a unit address differs from the first `reg` address.
    #[clap(long)]
    warn_reg_unit_address_mismatch: bool,
    /// What to print.
    #[clap(short, long, value_enum, default_value_t = Output::Dts)]
    output: Output,
    /// Enables verbose logging.
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Output {
    /// The merged tree as canonical DTS.
    Dts,
    /// Dependency ordinals with the nodes that share each one.
    Scc,
    /// Every node with its binding and typed properties.
    Nodes,
}

fn main() {
    let args = Args::parse();
    logger::init(args.verbose);

    if let Err(err) = run(args) {
        log::error!("{:?}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let options = options(&args)?;
    log::debug!("{:?}", options);

    let edt = Edt::new(&args.dts, &args.bindings_dirs, &options)
        .with_context(|| format!("failed to build the devicetree for {}", args.dts.display()))?;
    log::info!("{} nodes, {} warnings", edt.nodes().len(), edt.warnings().len());

    match args.output {
        Output::Dts => print!("{}", edt.dts_source()),
        Output::Scc => print_scc(&edt),
        Output::Nodes => {
            for node in edt.nodes() {
                print_node(&edt, node);
            }
        }
    }

    Ok(())
}

/// Options from the config file, if any, with the command line on top.
fn options(args: &Args) -> anyhow::Result<EdtOptions> {
    let mut options = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("invalid options in {}", path.display()))?
        }
        None => EdtOptions::default(),
    };

    options.include_path.extend(args.include_path.iter().cloned());
    options
        .infer_binding_for_paths
        .extend(args.infer_binding_for_paths.iter().cloned());
    options.werror |= args.werror;
    options.warn_reg_unit_address_mismatch |= args.warn_reg_unit_address_mismatch;

    if let Some(path) = &args.vendor_prefixes {
        let prefixes = edtlib::load_vendor_prefixes_txt(path)
            .with_context(|| format!("failed to load vendor prefixes from {}", path.display()))?;
        options.vendor_prefixes.extend(prefixes);
    }

    Ok(options)
}

fn print_scc(edt: &Edt) {
    for (ordinal, component) in edt.scc_order().iter().enumerate() {
        let paths: Vec<&str> = component.iter().map(|n| edt.node(*n).path()).collect();
        println!("{:4} {}", ordinal, paths.join(" "));
    }
}

fn print_node(edt: &Edt, node: &Node) {
    let path = |n| edt.node(n).path();

    println!("{} (ordinal {}, {})", node.path(), node.dep_ordinal(), node.status());
    if let Some(compat) = node.matching_compat() {
        println!("  compatible: {}", compat);
    }
    if let Some(binding) = node.binding_path() {
        println!("  binding: {}", binding.display());
    }
    if let Some(bus) = node.bus_node() {
        println!("  on bus: {} ({})", path(bus), node.on_buses().join(", "));
    }

    for reg in node.regs() {
        println!(
            "  reg{}: {} {}",
            reg.name.as_ref().map(|n| format!(" '{}'", n)).unwrap_or_default(),
            hex(reg.addr),
            hex(reg.size)
        );
    }
    for interrupt in node.interrupts() {
        println!("  interrupt: {}", entry(edt, interrupt));
    }

    for prop in node.props().values() {
        let value = match prop.value() {
            PropertyValue::Phandle(n) | PropertyValue::Path(n) => path(*n).to_string(),
            PropertyValue::Phandles(v) => {
                let paths: Vec<&str> = v.iter().map(|n| path(*n)).collect();
                format!("[{}]", paths.join(", "))
            }
            PropertyValue::PhandleArray(v) => {
                let entries: Vec<String> = v
                    .iter()
                    .map(|e| e.as_ref().map_or_else(|| "None".to_string(), |e| entry(edt, e)))
                    .collect();
                format!("[{}]", entries.join(", "))
            }
            value => value.to_string(),
        };
        println!("  {}: {} = {}", prop.name(), prop.type_().as_str(), value);
    }

    let deps: Vec<&str> = edt.depends_on(node.index()).into_iter().map(path).collect();
    if !deps.is_empty() {
        println!("  depends on: {}", deps.join(" "));
    }
}

fn entry(edt: &Edt, entry: &ControllerAndData) -> String {
    let cells: Vec<String> = entry
        .data
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    let name = entry
        .name
        .as_ref()
        .map(|n| format!("{}: ", n))
        .unwrap_or_default();

    format!("{}{} {{{}}}", name, edt.node(entry.controller).path(), cells.join(", "))
}

fn hex(value: Option<u128>) -> String {
    value.map_or_else(|| "None".to_string(), |v| format!("{:#x}", v))
}
