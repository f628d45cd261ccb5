//! Raw properties: payload bytes plus the markers describing how the value was
//! written in the source.

use std::str;

use crate::{
    error::{Error, Location, Result},
    tree::{NodeId, Tree},
};

/// What a [`Marker`] records at its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// `&ref` outside of `<>`: replaced by the path of the target node.
    Path,
    /// `&ref` inside of `<>`: four bytes replaced by the phandle of the target.
    Phandle,
    /// `label:` inside the value.
    Label,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    String,
}

impl MarkerKind {
    /// Element size in bytes of a cell group marker.
    pub fn elem_size(self) -> Option<usize> {
        match self {
            MarkerKind::Uint8 => Some(1),
            MarkerKind::Uint16 => Some(2),
            MarkerKind::Uint32 => Some(4),
            MarkerKind::Uint64 => Some(8),
            _ => None,
        }
    }

    pub(crate) fn from_bits(bits: u32) -> MarkerKind {
        match bits {
            8 => MarkerKind::Uint8,
            16 => MarkerKind::Uint16,
            64 => MarkerKind::Uint64,
            _ => MarkerKind::Uint32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub offset: usize,
    pub kind: MarkerKind,
    /// Label name for [`MarkerKind::Label`], reference text (`label` or
    /// `{/path}`) for references.
    pub data: Option<String>,
}

/// Type of a raw property, derived from its markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Empty,
    Bytes,
    Num,
    Nums,
    String,
    Strings,
    Path,
    Phandle,
    Phandles,
    PhandlesAndNums,
    Compound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) node: NodeId,
    pub(crate) node_path: String,
    pub(crate) value: Vec<u8>,
    pub(crate) markers: Vec<Marker>,
    pub(crate) labels: Vec<String>,
    pub(crate) location: Location,
}

impl Property {
    pub(crate) fn new(name: &str, node: NodeId, node_path: &str, location: Location) -> Self {
        Self {
            name: name.to_string(),
            node,
            node_path: node_path.to_string(),
            value: Vec::new(),
            markers: Vec::new(),
            labels: Vec::new(),
            location,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node carrying this property.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    /// Raw payload, with references already resolved.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Where the property was last assigned.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Labels placed inside the value, with their byte offset.
    pub fn offset_labels(&self) -> impl Iterator<Item = (&str, usize)> {
        self.markers.iter().filter_map(|m| match (m.kind, &m.data) {
            (MarkerKind::Label, Some(label)) => Some((label.as_str(), m.offset)),
            _ => None,
        })
    }

    pub(crate) fn add_marker(&mut self, kind: MarkerKind, data: Option<String>) {
        self.markers.push(Marker {
            offset: self.value.len(),
            kind,
            data,
        });
    }

    /// Classifies the property from the kinds of its non-label markers.
    pub fn type_(&self) -> PropertyType {
        use MarkerKind as K;

        if self.value.is_empty() {
            return PropertyType::Empty;
        }

        let kinds: Vec<MarkerKind> = self
            .markers
            .iter()
            .map(|m| m.kind)
            .filter(|k| *k != K::Label)
            .collect();
        let all = |allowed: &[MarkerKind]| kinds.iter().all(|k| allowed.contains(k));
        let phandles = kinds.iter().filter(|k| **k == K::Phandle).count();

        match kinds.as_slice() {
            [] => PropertyType::Empty,
            [K::Uint8] => PropertyType::Bytes,
            [K::Uint32] if self.value.len() == 4 => PropertyType::Num,
            [K::Uint32] => PropertyType::Nums,
            [K::Path] => PropertyType::Path,
            [K::Uint32, K::Phandle] if self.value.len() == 4 => PropertyType::Phandle,
            _ if all(&[K::Uint32]) => PropertyType::Nums,
            [K::String] => PropertyType::String,
            _ if all(&[K::String]) => PropertyType::Strings,
            _ if all(&[K::Uint32, K::Phandle]) && self.value.len() == 4 * phandles => {
                PropertyType::Phandles
            }
            _ if all(&[K::Uint32, K::Phandle]) => PropertyType::PhandlesAndNums,
            _ => PropertyType::Compound,
        }
    }

    /// Error naming this property, its node and its source.
    pub fn error(&self, message: impl std::fmt::Display) -> Error {
        let message = format!(
            "property '{}' on {}: {}",
            self.name, self.node_path, message
        );
        match self.location.line {
            Some(line) => Error::at(&self.location.file, line, message),
            None => Error::in_file(&self.location.file, message),
        }
    }

    fn type_error(&self, expected: &str) -> Error {
        self.error(format!(
            "expected to be assigned with '{} = {};', not '{}'",
            self.name,
            expected,
            crate::emit::value_to_string(self).trim_start_matches(" = ")
        ))
    }

    /// Decodes a single 32-bit cell.
    pub fn to_num(&self) -> Result<u32> {
        if self.type_() != PropertyType::Num {
            return Err(self.type_error("< (number) >"));
        }

        Ok(be_u32(&self.value))
    }

    /// Decodes a list of 32-bit cells. An empty value gives an empty list.
    pub fn to_nums(&self) -> Result<Vec<u32>> {
        match self.type_() {
            PropertyType::Empty | PropertyType::Num | PropertyType::Nums => {
                Ok(self.value.chunks_exact(4).map(be_u32).collect())
            }
            _ => Err(self.type_error("< (number) (number) ... >")),
        }
    }

    /// Returns the raw bytes of a `[...]` value.
    pub fn to_bytes(&self) -> Result<&[u8]> {
        match self.type_() {
            PropertyType::Empty | PropertyType::Bytes => Ok(&self.value),
            _ => Err(self.type_error("[ (byte) (byte) ... ]")),
        }
    }

    /// Decodes a single string.
    pub fn to_string(&self) -> Result<String> {
        if self.type_() != PropertyType::String {
            return Err(self.type_error("\"string\""));
        }

        self.decode_str(&self.value[..self.value.len() - 1])
    }

    /// Decodes a list of strings.
    pub fn to_strings(&self) -> Result<Vec<String>> {
        match self.type_() {
            PropertyType::String | PropertyType::Strings => self.value
                [..self.value.len() - 1]
                .split(|b| *b == 0)
                .map(|s| self.decode_str(s))
                .collect(),
            _ => Err(self.type_error("\"string\", \"string\", ...")),
        }
    }

    /// Resolves a single phandle to its node.
    pub fn to_node(&self, tree: &Tree) -> Result<NodeId> {
        if !matches!(self.type_(), PropertyType::Phandle | PropertyType::Num) {
            return Err(self.type_error("< &foo >"));
        }

        self.phandle_to_node(tree, be_u32(&self.value))
    }

    /// Resolves a list of phandles. An empty value gives an empty list.
    pub fn to_nodes(&self, tree: &Tree) -> Result<Vec<NodeId>> {
        match self.type_() {
            PropertyType::Empty
            | PropertyType::Num
            | PropertyType::Nums
            | PropertyType::Phandle
            | PropertyType::Phandles => self
                .value
                .chunks_exact(4)
                .map(|cell| self.phandle_to_node(tree, be_u32(cell)))
                .collect(),
            _ => Err(self.type_error("< &foo &bar ... >")),
        }
    }

    /// Resolves a path, given either as a string or as a `&ref`.
    pub fn to_path(&self, tree: &Tree) -> Result<NodeId> {
        if !matches!(self.type_(), PropertyType::Path | PropertyType::String) {
            return Err(self.type_error("&foo"));
        }

        let path = self.decode_str(&self.value[..self.value.len() - 1])?;
        tree.get_node(&path)
            .map_err(|_| self.error(format!("no node with path '{}'", path)))
    }

    fn phandle_to_node(&self, tree: &Tree, phandle: u32) -> Result<NodeId> {
        tree.phandle2node()
            .get(&phandle)
            .copied()
            .ok_or_else(|| self.error(format!("non-existent phandle {:#x}", phandle)))
    }

    fn decode_str(&self, bytes: &[u8]) -> Result<String> {
        if !self.value.ends_with(&[0]) {
            return Err(self.error("value is not NUL-terminated"));
        }

        str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| self.error(format!("value is not valid UTF-8 ({})", e)))
    }
}

/// Reads a big-endian u32 from the first four bytes of `bytes`.
pub fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Reads a big-endian unsigned integer of up to 16 bytes.
pub fn be_int(bytes: &[u8]) -> Option<u128> {
    if bytes.len() > 16 {
        return None;
    }

    Some(bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128))
}

/// Encodes `value` in `n` big-endian bytes, falling back to two's complement
/// for negative values. Returns `None` if it fits neither way.
pub(crate) fn int_to_be(value: i128, n: usize) -> Option<Vec<u8>> {
    let bits = 8 * n as u32;
    let fits_unsigned = value >= 0 && (value >> bits) == 0;
    let fits_signed = value < 0 && value >= -(1i128 << (bits - 1));

    if !fits_unsigned && !fits_signed {
        return None;
    }

    Some(value.to_be_bytes()[16 - n..].to_vec())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::tree::ParseOptions;

    fn tree(body: &str) -> Tree {
        let source = format!("/dts-v1/;\n/ {{\n{}\n}};\n", body);
        Tree::from_source(&source, "test.dts", &ParseOptions::default()).unwrap()
    }

    fn prop<'t>(tree: &'t Tree, name: &str) -> &'t Property {
        tree.node(tree.root()).props().get(name).unwrap()
    }

    #[test]
    fn classify_properties() {
        use PropertyType::*;

        let t = tree(
            r#"
            a: node { };
            empty;
            empty_cells = <>;
            bytes = [01 02];
            num = <1>;
            nums = <1 2>;
            nums2 = <1>, <2>;
            string = "x";
            strings = "x", "y";
            path = &a;
            phandle = <&a>;
            phandles = <&a &a>;
            mixed = <&a 1 2>;
            compound = <1>, "x";
            labeled = l1: <1> l2:;
            wide = /bits/ 64 <1>;
            "#,
        );

        for (name, exp) in [
            ("empty", Empty),
            ("empty_cells", Empty),
            ("bytes", Bytes),
            ("num", Num),
            ("nums", Nums),
            ("nums2", Nums),
            ("string", String),
            ("strings", Strings),
            ("path", Path),
            ("phandle", Phandle),
            ("phandles", Phandles),
            ("mixed", PhandlesAndNums),
            ("compound", Compound),
            ("labeled", Num),
            ("wide", Compound),
        ] {
            assert_eq!(prop(&t, name).type_(), exp, "{}", name);
        }
    }

    #[test]
    fn decode_properties() {
        let t = tree(
            r#"
            a: node { };
            num = <0x12345678>;
            nums = <1 2 3>;
            bytes = [de ad];
            str = "hello";
            strs = "a", "bc";
            ph = <&a>;
            phs = <&a &a>;
            path = &a;
            path_str = "/node";
            esc = "tab\there";
            "#,
        );
        let a = t.get_node("/node").unwrap();

        assert_eq!(prop(&t, "num").to_num(), Ok(0x12345678));
        assert_eq!(prop(&t, "nums").to_nums(), Ok(vec![1, 2, 3]));
        assert_eq!(prop(&t, "bytes").to_bytes(), Ok(&[0xde, 0xad][..]));
        assert_eq!(prop(&t, "str").to_string(), Ok("hello".to_string()));
        assert_eq!(
            prop(&t, "strs").to_strings(),
            Ok(vec!["a".to_string(), "bc".to_string()])
        );
        assert_eq!(prop(&t, "ph").to_node(&t), Ok(a));
        assert_eq!(prop(&t, "phs").to_nodes(&t), Ok(vec![a, a]));
        assert_eq!(prop(&t, "path").to_path(&t), Ok(a));
        assert_eq!(prop(&t, "path_str").to_path(&t), Ok(a));
        assert_eq!(prop(&t, "esc").to_string(), Ok("tab\there".to_string()));
    }

    #[test]
    fn decode_errors_name_the_property() {
        let t = tree("num = <1 2>;\nbad = <0x7>;");

        let err = prop(&t, "num").to_num().unwrap_err();
        assert!(err.message().contains("property 'num' on /"), "{}", err);
        assert_eq!(
            err.location().map(|l| l.file.clone()),
            Some(PathBuf::from("test.dts"))
        );

        let err = prop(&t, "bad").to_node(&t).unwrap_err();
        assert!(err.message().contains("non-existent phandle 0x7"), "{}", err);
    }

    #[test]
    fn encode_integers() {
        for (value, n, exp) in [
            (1, 4, Some(vec![0, 0, 0, 1])),
            (-1, 1, Some(vec![0xff])),
            (0xff, 1, Some(vec![0xff])),
            (0x100, 1, None),
            (-129, 1, None),
            (u32::MAX as i128, 4, Some(vec![0xff; 4])),
            (u64::MAX as i128, 8, Some(vec![0xff; 8])),
        ] {
            assert_eq!(int_to_be(value, n), exp, "{} in {} bytes", value, n);
        }

        assert_eq!(be_int(&[0x01, 0x00, 0x00, 0x00, 0x00]), Some(0x1_0000_0000));
    }
}
