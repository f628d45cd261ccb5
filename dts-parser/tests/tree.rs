use std::path::{Path, PathBuf};

use dts_parser::{ParseOptions, PropertyType, Tree};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn board() -> Tree {
    let options = ParseOptions {
        include_path: vec![fixtures().join("include")],
        ..Default::default()
    };
    Tree::from_file(fixtures().join("board.dts"), &options).unwrap()
}

#[test_log::test]
fn parse_board_with_includes() {
    let tree = board();

    let uart = tree.get_node("/soc/serial@2000").unwrap();
    let node = tree.node(uart);
    assert_eq!(node.labels(), ["uart0"]);
    assert_eq!(node.unit_addr(), "2000");
    assert_eq!(node.prop("status").unwrap().to_string().unwrap(), "okay");
    assert_eq!(node.prop("current-speed").unwrap().to_num().unwrap(), 115200);
    assert!(node
        .prop("current-speed")
        .unwrap()
        .location()
        .file
        .ends_with("board.dts"));
    assert!(node
        .prop("compatible")
        .unwrap()
        .location()
        .file
        .ends_with("soc.dtsi"));

    let timer = tree.node(tree.get_node("/soc/timer@3000").unwrap());
    assert_eq!(timer.prop("status").unwrap().to_string().unwrap(), "disabled");
    assert!(!tree.has_node("/soc/unused@4000"));
    assert!(tree.label2node().get("unused").is_none());

    let leds = tree.node(tree.get_node("/leds").unwrap());
    assert_eq!(
        leds.prop("compatible").unwrap().to_string().unwrap(),
        "gpio-leds"
    );

    assert_eq!(tree.get_node("serial0").unwrap(), uart);
    assert_eq!(
        tree.get_node("gpio-a").unwrap(),
        tree.get_node("/soc/gpio@1000").unwrap()
    );
    assert_eq!(tree.memreserves().len(), 1);
}

#[test_log::test]
fn resolve_phandles_across_files() {
    let tree = board();

    let gpio = tree.get_node("/soc/gpio@1000").unwrap();
    let led = tree.node(tree.get_node("/leds/led-0").unwrap());
    let gpios = led.prop("gpios").unwrap();

    assert_eq!(gpios.type_(), PropertyType::PhandlesAndNums);
    assert_eq!(gpios.value(), [0, 0, 0, 1, 0, 0, 0, 13, 0, 0, 0, 1]);
    assert_eq!(tree.phandle2node().get(&1), Some(&gpio));

    let chosen = tree.node(tree.get_node("/chosen").unwrap());
    assert_eq!(
        chosen.prop("stdout-path").unwrap().to_path(&tree).unwrap(),
        tree.get_node("/soc/serial@2000").unwrap()
    );
}

#[test_log::test]
fn include_binary_data() {
    let tree = board();
    let firmware = tree.node(tree.get_node("/firmware").unwrap());

    assert_eq!(firmware.prop("blob").unwrap().to_bytes().unwrap(), [1, 2, 3, 4]);
    assert_eq!(firmware.prop("part").unwrap().to_bytes().unwrap(), [2, 3]);
}

#[test_log::test]
fn emitted_tree_parses_back() {
    let tree = board();
    let text = tree.to_string();

    let reparsed = Tree::from_source(&text, "emitted.dts", &ParseOptions::default()).unwrap();
    assert_eq!(reparsed.to_string(), text);

    let paths = |t: &Tree| {
        t.node_iter()
            .map(|id| t.node(id).path().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(paths(&reparsed), paths(&tree));
}

#[test_log::test]
fn recursive_include_is_an_error() {
    let err = Tree::from_file(fixtures().join("recursive.dts"), &ParseOptions::default())
        .unwrap_err();

    assert!(err.message().contains("recursive /include/"), "{}", err);
}

#[test_log::test]
fn errors_point_into_included_files() {
    let err = Tree::from_file(fixtures().join("uses-broken.dts"), &ParseOptions::default())
        .unwrap_err();

    let location = err.location().unwrap();
    assert!(location.file.ends_with("broken.dtsi"), "{}", err);
    assert!(location.line.is_some());
}

#[test_log::test]
fn missing_file() {
    let err = Tree::from_file(fixtures().join("nope.dts"), &ParseOptions::default()).unwrap_err();

    assert!(err.message().contains("could not read file"), "{}", err);
}
