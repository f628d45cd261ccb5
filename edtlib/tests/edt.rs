use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use dts_parser::{ParseOptions, Tree};
use edtlib::{load_vendor_prefixes_txt, Edt, EdtOptions, Node, PropertyValue, Reporter, Result};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn bindings() -> Vec<PathBuf> {
    vec![fixtures().join("bindings")]
}

fn board(options: &EdtOptions) -> Result<Edt> {
    Edt::new(fixtures().join("board.dts"), &bindings(), options)
}

fn inline(source: &str, options: &EdtOptions) -> Result<Edt> {
    let tree = Tree::from_source(source, "inline.dts", &ParseOptions::default())?;
    Edt::from_tree(tree, &bindings(), options)
}

fn index(edt: &Edt, path: &str) -> edtlib::NodeIndex {
    edt.get_node(path).unwrap().index()
}

#[derive(Default)]
struct Collect(Mutex<Vec<String>>);

impl Reporter for Collect {
    fn warn(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

#[test_log::test]
fn minimal_tree_without_bindings() {
    let edt = Edt::new(fixtures().join("minimal.dts"), &[], &EdtOptions::default()).unwrap();

    assert_eq!(edt.nodes().len(), 2);
    let foo = edt.get_node("/foo").unwrap();
    assert_eq!(foo.regs().len(), 1);
    assert_eq!(foo.regs()[0].addr, Some(0x10));
    assert_eq!(foo.regs()[0].size, Some(4));
    assert_eq!(foo.regs()[0].name, None);
    assert!(foo.binding().is_none());
    assert_eq!(edt.parent(foo.index()).map(Node::path), Some("/"));
    assert!(edt.get_node("/").unwrap().parent().is_none());
}

#[test_log::test]
fn phandle_resolution() {
    let edt = board(&EdtOptions::default()).unwrap();

    let a = index(&edt, "/a");
    let b = edt.get_node("/b").unwrap();
    assert_eq!(b.prop("friend").unwrap().value(), &PropertyValue::Phandle(a));
    assert!(edt.depends_on(b.index()).contains(&a));
    assert!(edt.required_by(a).contains(&b.index()));
    assert!(edt.node(a).dep_ordinal() < b.dep_ordinal());
}

#[test_log::test]
fn interrupt_through_map() {
    let edt = board(&EdtOptions::default()).unwrap();

    let cpu = index(&edt, "/cpu");
    let dev = edt.get_node("/bridge/dev").unwrap();
    let interrupts = dev.interrupts();
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].controller, cpu);
    assert_eq!(interrupts[0].data.get("irq"), Some(&42));
    assert_eq!(interrupts[0].data.len(), 1);
    assert!(edt.depends_on(dev.index()).contains(&cpu));

    let uart = edt.get_node("serial0").unwrap();
    assert_eq!(uart.interrupts()[0].controller, cpu);
    assert_eq!(uart.interrupts()[0].data.get("irq"), Some(&3));
}

#[test_log::test]
fn default_injection() {
    let edt = board(&EdtOptions::default()).unwrap();

    let node = edt.get_node("/defaults").unwrap();
    let foo = node.prop("foo").unwrap();
    assert_eq!(foo.value(), &PropertyValue::Int(9));
    assert_eq!(foo.spec().default(), Some(&PropertyValue::Int(9)));
    assert_eq!(
        node.prop("bytes").unwrap().value(),
        &PropertyValue::Bytes(vec![0x12, 0x34])
    );
    assert_eq!(node.prop("flag").unwrap().value(), &PropertyValue::Bool(false));
}

#[test_log::test]
fn cycles_share_an_ordinal() {
    let edt = board(&EdtOptions::default()).unwrap();

    let ping = edt.get_node("/ping").unwrap();
    let pong = edt.get_node("/pong").unwrap();
    assert_eq!(ping.dep_ordinal(), pong.dep_ordinal());
    assert!(edt
        .scc_order()
        .iter()
        .any(|c| c.as_slice() == [ping.index(), pong.index()]));

    // Every other component is a single node.
    let multi = edt.scc_order().iter().filter(|c| c.len() > 1).count();
    assert_eq!(multi, 1);
    assert_eq!(edt.dep_ord2node()[&ping.dep_ordinal()], ping.index());
}

#[test_log::test]
fn parents_come_first() {
    let edt = board(&EdtOptions::default()).unwrap();

    for node in edt.nodes() {
        if let Some(parent) = edt.parent(node.index()) {
            assert!(
                parent.dep_ordinal() < node.dep_ordinal(),
                "{} before {}",
                parent.path(),
                node.path()
            );
        }
    }
}

#[test_log::test]
fn bus_specific_bindings() {
    let edt = board(&EdtOptions::default()).unwrap();

    let apb = index(&edt, "/apb");
    let uart = edt.get_node("/apb/serial@1000").unwrap();
    assert_eq!(uart.bus_node(), Some(apb));
    assert_eq!(uart.on_buses(), ["apb"]);
    assert_eq!(uart.matching_compat(), Some("vnd,uart"));
    assert!(uart.binding_path().unwrap().ends_with("vnd,uart.yaml"));
    assert_eq!(uart.binding().unwrap().on_bus(), Some("apb"));
    assert_eq!(uart.regs()[0].addr, Some(0x4000_1000));
    assert_eq!(uart.unit_addr(), Some(0x4000_1000));
    assert_eq!(uart.label(), Some("UART_0"));

    let speed = uart.prop("current-speed").unwrap();
    assert_eq!(speed.value(), &PropertyValue::Int(115200));
    assert_eq!(speed.enum_indices(), Some(vec![1]));

    let other = edt.get_node("/serial@50000000").unwrap();
    assert!(other.bus_node().is_none());
    assert!(other.binding_path().unwrap().ends_with("vnd,uart-any.yaml"));
    assert!(!other.enabled());
    assert_eq!(edt.compat2okay()["vnd,uart"], [uart.index()]);
    assert_eq!(edt.compat2notokay()["vnd,uart"], [other.index()]);
}

#[test_log::test]
fn include_filters_and_provenance() {
    let edt = board(&EdtOptions::default()).unwrap();

    let binding = edt.get_node("serial0").unwrap().binding().unwrap();
    let mut names: Vec<&str> = binding.prop2specs().keys().map(String::as_str).collect();
    names.sort();
    assert_eq!(names, ["current-speed", "interrupts", "label", "reg"]);
    assert!(binding.prop2specs()["reg"]
        .path()
        .unwrap()
        .ends_with("base.yaml"));
    assert!(binding.prop2specs()["current-speed"]
        .path()
        .unwrap()
        .ends_with("vnd,uart.yaml"));

    let generic = edt.get_node("/serial@50000000").unwrap().binding().unwrap();
    assert!(generic.prop2specs().contains_key("clock-frequency"));
}

#[test_log::test]
fn child_bindings() {
    let edt = board(&EdtOptions::default()).unwrap();

    let gpio = index(&edt, "/gpio@60000000");
    let leds = edt.get_node("/leds").unwrap();
    let led = edt.get_node("/leds/led0").unwrap();
    assert!(leds.has_child_binding());
    assert_eq!(led.description(), Some("A single LED"));
    assert_eq!(led.matching_compat(), None);

    let PropertyValue::PhandleArray(entries) = led.prop("gpios").unwrap().value() else {
        panic!("gpios is not a phandle-array");
    };
    let entry = entries[0].as_ref().unwrap();
    assert_eq!(entry.controller, gpio);
    assert_eq!(entry.basename.as_deref(), Some("gpio"));
    let data: Vec<(&str, u32)> = entry.data.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    assert_eq!(data, [("pin", 13), ("flags", 1)]);

    // The LED's references count for the node carrying the child binding.
    assert!(edt.depends_on(leds.index()).contains(&gpio));
    assert!(edt.depends_on(led.index()).contains(&gpio));
}

#[test_log::test]
fn lookups() {
    let edt = board(&EdtOptions::default()).unwrap();

    let uart = index(&edt, "/apb/serial@1000");
    assert_eq!(edt.chosen_node("zephyr,console").map(Node::index), Some(uart));
    assert_eq!(edt.chosen_nodes().len(), 1);
    assert_eq!(edt.label2node()["uart0"], uart);
    assert_eq!(edt.node(uart).aliases(), ["serial0"]);
    assert!(edt.has_node("serial0"));
    assert!(!edt.has_node("/nope"));
    assert!(edt.get_node("nope").is_err());

    let children: Vec<&str> = edt.children(index(&edt, "/apb")).map(Node::name).collect();
    assert_eq!(children, ["serial@1000"]);
    assert_eq!(edt.node(uart).child_index(uart), None);
    assert_eq!(edt.node(index(&edt, "/apb")).child_index(uart), Some(0));
}

#[test_log::test]
fn dts_source_round_trip() {
    let edt = board(&EdtOptions::default()).unwrap();

    let source = edt.dts_source();
    let again = Tree::from_source(&source, "again.dts", &ParseOptions::default()).unwrap();
    assert_eq!(again.to_string(), source);
}

#[test_log::test]
fn vendor_prefixes() {
    let reporter = Arc::new(Collect::default());
    let mut options = EdtOptions {
        vendor_prefixes: load_vendor_prefixes_txt(fixtures().join("vendor-prefixes.txt")).unwrap(),
        ..Default::default()
    };
    options.reporter = reporter.clone();

    let edt = board(&options).unwrap();
    assert_eq!(edt.compat2vendor()["vnd,uart"], "Vendor Inc.");
    assert_eq!(edt.compat2model()["vnd,uart"], "uart");
    assert_eq!(
        edt.warnings(),
        ["node '/widget' compatible 'zzz,widget' has unknown vendor prefix 'zzz'"]
    );
    assert_eq!(reporter.0.lock().unwrap().as_slice(), edt.warnings());

    options.werror = true;
    let err = board(&options).unwrap_err();
    assert!(err.message().contains("unknown vendor prefix 'zzz'"), "{}", err);
}

#[test_log::test]
fn deprecated_properties() {
    let source = "/dts-v1/; / { old { compatible = \"vnd,old\"; old-prop = <1>; }; };";

    let edt = inline(source, &EdtOptions::default()).unwrap();
    assert_eq!(edt.warnings().len(), 1);
    assert!(edt.warnings()[0].contains("'old-prop' is marked as deprecated"));
    assert_eq!(
        edt.get_node("/old").unwrap().prop("old-prop").unwrap().value(),
        &PropertyValue::Int(1)
    );

    let options = EdtOptions {
        werror: true,
        ..Default::default()
    };
    assert!(inline(source, &options).is_err());
}

#[test_log::test]
fn non_tokenizable_enums() {
    let edt = inline(
        "/dts-v1/; / { m { compatible = \"vnd,modes\"; mode = \"fast-mode\"; }; };",
        &EdtOptions::default(),
    )
    .unwrap();

    assert_eq!(edt.warnings().len(), 1);
    assert!(edt.warnings()[0].contains("non-tokenizable enum for property 'mode'"));
}

#[test_log::test]
fn unit_address_mismatch() {
    let source = r#"/dts-v1/;
        / {
            #address-cells = <1>;
            #size-cells = <1>;
            good@10 { reg = <0x10 4>; };
            bad@10 { reg = <0x20 4>; };
        };"#;

    let edt = inline(source, &EdtOptions::default()).unwrap();
    assert!(edt.warnings().is_empty());

    let options = EdtOptions {
        warn_reg_unit_address_mismatch: true,
        ..Default::default()
    };
    let edt = inline(source, &options).unwrap();
    assert_eq!(
        edt.warnings(),
        ["unit address and first address in 'reg' (0x20) don't match for /bad@10"]
    );
}

#[test_log::test]
fn inferred_bindings() {
    let options = EdtOptions {
        infer_binding_for_paths: ["/user".to_string()].into(),
        ..Default::default()
    };
    let edt = inline(
        r#"/dts-v1/;
        / {
            g: g { };
            user {
                nums = <1 2>;
                flag;
                name = "x";
                ref = <&g>;
            };
        };"#,
        &options,
    )
    .unwrap();

    let g = index(&edt, "/g");
    let user = edt.get_node("/user").unwrap();
    assert!(user.binding().unwrap().path().is_none());
    assert_eq!(user.prop("nums").unwrap().value(), &PropertyValue::Array(vec![1, 2]));
    assert_eq!(user.prop("flag").unwrap().value(), &PropertyValue::Bool(true));
    assert_eq!(
        user.prop("name").unwrap().value(),
        &PropertyValue::String("x".to_string())
    );
    assert_eq!(user.prop("ref").unwrap().value(), &PropertyValue::Phandle(g));
    assert!(edt.depends_on(user.index()).contains(&g));
}

#[test_log::test]
fn build_errors() {
    let tests = [
        (
            "/dts-v1/; / { choice { compatible = \"vnd,choice\"; foo = \"c\"; }; };",
            &["value of property 'foo' on /choice", "('c')", "vnd,choice.yaml", "[a, b]"][..],
        ),
        (
            "/dts-v1/; / { choice { compatible = \"vnd,choice\"; fixed = <4>; }; };",
            &["is different from the 'const' value", "(3)"],
        ),
        (
            "/dts-v1/; / { b { compatible = \"vnd,friend\"; extra = <1>; }; };",
            &["'extra' appears in /b", "vnd,friend.yaml"],
        ),
        (
            r#"/dts-v1/; / { apb { compatible = "vnd,apb"; #address-cells = <1>; #size-cells = <1>;
                s@0 { compatible = "vnd,uart"; reg = <0 1>; }; }; };"#,
            &["'current-speed' is marked as required"],
        ),
        (
            "/dts-v1/; / { d { compatible = \"vnd,defaults\"; flag = <1>; }; };",
            &["'flag' in <Node /d in 'inline.dts'> is defined with 'type: boolean'"],
        ),
        (
            "/dts-v1/; / { d { compatible = \"vnd,defaults\"; foo = \"nine\"; }; };",
            &["property 'foo' on /d", "expected to be assigned with 'foo = < (number) >;'"],
        ),
        (
            "/dts-v1/; / { dev { interrupts = <1>; }; };",
            &["neither the node nor any of its parents has an 'interrupt-parent'"],
        ),
        (
            r#"/dts-v1/; / {
                a: a { #address-cells = <0>; #interrupt-cells = <1>; interrupt-map = <1 &b 2>;
                    dev { interrupt-parent = <&a>; interrupts = <1>; }; };
                b: b { #address-cells = <0>; #interrupt-cells = <1>; interrupt-map = <2 &a 1>; };
            };"#,
            &["map loop", "/a -> /b -> /a"],
        ),
        (
            "/dts-v1/; / { l { compatible = \"vnd,loop\"; }; };",
            &["'loop-a.yaml' includes itself (vnd,loop.yaml -> loop-a.yaml -> loop-b.yaml -> loop-a.yaml)"],
        ),
    ];

    for (source, expected) in tests {
        let err = inline(source, &EdtOptions::default()).unwrap_err();
        for part in expected {
            assert!(err.to_string().contains(part), "{:?} not in {}", part, err);
        }
    }
}

#[test_log::test]
fn cyclic_input_is_an_error() {
    let tests = [
        ("map-loop.dts", "map loop"),
        ("include-loop.dts", "includes itself"),
    ];

    for (dts, expected) in tests {
        let err = Edt::new(fixtures().join(dts), &bindings(), &EdtOptions::default()).unwrap_err();
        assert!(err.message().contains(expected), "{}: {}", dts, err);
    }
}

#[test_log::test]
fn duplicate_bindings() {
    let tree = Tree::from_source(
        "/dts-v1/; / { d { compatible = \"vnd,dup\"; }; };",
        "inline.dts",
        &ParseOptions::default(),
    )
    .unwrap();

    let err = Edt::from_tree(tree, &[fixtures().join("dup-bindings")], &EdtOptions::default())
        .unwrap_err();
    assert!(err.message().starts_with("both "), "{}", err);
    assert!(err.message().ends_with("have 'compatible: vnd,dup'"), "{}", err);
}
