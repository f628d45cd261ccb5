//! Syntax tree of a Devicetree source file, as produced by the parser.
//!
//! The tree borrows from the source text. Values are kept unevaluated so that
//! the tree builder can report errors against the line they come from.

/// A whole source file: the ordered list of top-level statements.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dts<'s>(pub Vec<RootItem<'s>>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootItem<'s> {
    Version,
    Include(Include<'s>),
    Node(Node<'s>),
    OmitNode(Reference<'s>, u32),
    DeleteNode(Reference<'s>, u32),
    MemReserve(MemReserve<'s>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Include<'s> {
    pub path: &'s str,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemReserve<'s> {
    pub labels: Vec<&'s str>,
    pub address: Expression,
    pub size: Expression,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<'s> {
    pub id: NodeId<'s>,
    pub labels: Vec<&'s str>,
    pub contents: NodeContents<'s>,
    pub omit_if_no_ref: bool,
    pub line: u32,
}

impl<'s> Default for Node<'s> {
    fn default() -> Self {
        Self {
            id: NodeId::Name("", None),
            labels: Default::default(),
            contents: Default::default(),
            omit_if_no_ref: Default::default(),
            line: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeId<'s> {
    Ref(Reference<'s>),
    Name(&'s str, Option<&'s str>),
}

/// A `&label` or `&{/path}` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'s> {
    Label(&'s str),
    Path(&'s str),
}

impl std::fmt::Display for Reference<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Label(label) => f.write_str(label),
            Reference::Path(path) => write!(f, "{{{}}}", path),
        }
    }
}

/// Body of a node.
///
/// Deletions are kept apart from the other statements since they take effect
/// once the rest of the block has been applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeContents<'s> {
    pub statements: Vec<Statement<'s>>,
    pub deleted_props: Vec<&'s str>,
    pub deleted_nodes: Vec<&'s str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement<'s> {
    Property(Property<'s>),
    Node(Node<'s>),
    Include(Include<'s>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property<'s> {
    pub name: &'s str,
    pub labels: Vec<&'s str>,
    pub value: Option<Vec<PropertyValue<'s>>>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue<'s> {
    /// String literal, with its escape sequences still in place.
    Str(&'s str),
    Ref(Reference<'s>),
    Bytestring(Vec<ByteCell<'s>>),
    CellArray(Vec<PropertyCell<'s>>),
    Bits(u32, Vec<PropertyCell<'s>>),
    Incbin {
        path: &'s str,
        range: Option<(Expression, Expression)>,
    },
    Label(&'s str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyCell<'s> {
    Ref(Reference<'s>),
    Expr(Expression),
    Label(&'s str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteCell<'s> {
    Byte(u8),
    Label(&'s str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Lit(IntegerLiteral),
    Unary(UnaryOperator, Box<Expression>),
    Binary(Box<Expression>, BinaryOperator, Box<Expression>),
    Ternary {
        cond: Box<Expression>,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Evaluates the expression. Returns `None` on division by zero.
    pub fn eval(&self) -> Option<i128> {
        match self {
            Expression::Lit(l) => Some(l.eval()),
            Expression::Unary(op, e) => Some(op.apply(e.eval()?)),
            Expression::Binary(lhs, op, rhs) => op.apply(lhs.eval()?, rhs.eval()?),
            Expression::Ternary { cond, left, right } => {
                if cond.eval()? != 0 {
                    left.eval()
                } else {
                    right.eval()
                }
            }
        }
    }
}

impl From<u64> for Box<Expression> {
    fn from(i: u64) -> Self {
        Expression::Lit(IntegerLiteral::Num(i)).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerLiteral {
    Num(u64),
    Char(char),
}

impl IntegerLiteral {
    pub fn eval(&self) -> i128 {
        match self {
            IntegerLiteral::Num(n) => *n as i128,
            IntegerLiteral::Char(c) => *c as i128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    BitNot,
    LogicalNot,
}

impl UnaryOperator {
    fn apply(self, e: i128) -> i128 {
        match self {
            UnaryOperator::Neg => e.wrapping_neg(),
            UnaryOperator::BitNot => !e,
            UnaryOperator::LogicalNot => (e == 0) as i128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOperator {
    fn apply(self, l: i128, r: i128) -> Option<i128> {
        let shift = |r: i128| u32::try_from(r).ok().filter(|r| *r < 128);

        Some(match self {
            BinaryOperator::Add => l.wrapping_add(r),
            BinaryOperator::Sub => l.wrapping_sub(r),
            BinaryOperator::Mul => l.wrapping_mul(r),
            BinaryOperator::Div => l.checked_div(r)?,
            BinaryOperator::Mod => l.checked_rem(r)?,
            BinaryOperator::LShift => shift(r).map_or(0, |r| l.wrapping_shl(r)),
            BinaryOperator::RShift => shift(r).map_or(0, |r| l.wrapping_shr(r)),
            BinaryOperator::BitAnd => l & r,
            BinaryOperator::BitOr => l | r,
            BinaryOperator::BitXor => l ^ r,
            BinaryOperator::And => (l != 0 && r != 0) as i128,
            BinaryOperator::Or => (l != 0 || r != 0) as i128,
            BinaryOperator::Eq => (l == r) as i128,
            BinaryOperator::Neq => (l != r) as i128,
            BinaryOperator::Lt => (l < r) as i128,
            BinaryOperator::Gt => (l > r) as i128,
            BinaryOperator::Le => (l <= r) as i128,
            BinaryOperator::Ge => (l >= r) as i128,
        })
    }
}

/// Decodes the escape sequences of a string or character literal.
pub fn unescape(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        i += 1;
        match bytes[i] {
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b't' => out.push(b'\t'),
            b'n' => out.push(b'\n'),
            b'v' => out.push(0x0b),
            b'f' => out.push(0x0c),
            b'r' => out.push(b'\r'),
            b'x' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take(2)
                    .take_while(|b| b.is_ascii_hexdigit())
                    .count();
                if digits == 0 {
                    out.push(b'x');
                } else {
                    out.push(radix_byte(&bytes[i + 1..i + 1 + digits], 16));
                    i += digits;
                }
            }
            b'0'..=b'7' => {
                let digits = bytes[i..]
                    .iter()
                    .take(3)
                    .take_while(|b| (b'0'..=b'7').contains(*b))
                    .count();
                out.push(radix_byte(&bytes[i..i + digits], 8));
                i += digits - 1;
            }
            c => out.push(c),
        }
        i += 1;
    }

    out
}

fn radix_byte(digits: &[u8], radix: u32) -> u8 {
    digits.iter().fold(0u32, |acc, d| {
        acc * radix + (*d as char).to_digit(radix).unwrap_or(0)
    }) as u8
}
