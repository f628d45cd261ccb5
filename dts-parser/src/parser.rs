use std::{iter, num::ParseIntError, path::Path, str};

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_until, take_while, take_while1, take_while_m_n},
    character::complete::{anychar, char, digit1, hex_digit1, multispace1, oct_digit1, satisfy},
    combinator::{all_consuming, cut, eof, map, map_opt, map_res, not, opt, recognize, value, verify},
    error::{context, ContextError, ErrorKind, FromExternalError, ParseError},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    Finish,
};
use nom_locate::{position, LocatedSpan};

use crate::{ast::*, error::Error};

pub(crate) type Input<'a> = LocatedSpan<&'a str>;

type IResult<'a, T, E> = nom::IResult<Input<'a>, T, E>;

/// Error types usable by the grammar.
pub(crate) trait DtsError<'a>:
    ParseError<Input<'a>> + ContextError<Input<'a>> + FromExternalError<Input<'a>, ParseIntError>
{
}

impl<'a, T> DtsError<'a> for T where
    T: ParseError<Input<'a>> + ContextError<Input<'a>> + FromExternalError<Input<'a>, ParseIntError>
{
}

/// Parse a Devicetree source file.
pub(crate) fn parse<'a>(source: &'a str, file: &Path) -> Result<Dts<'a>, Error> {
    all_consuming(dts_file::<SyntaxError>)(Input::new(source))
        .finish()
        .map(|(_, dts)| dts)
        .map_err(|e| e.into_error(file))
}

/// Parse a file included from within a node body.
pub(crate) fn parse_node_contents<'a>(
    source: &'a str,
    file: &Path,
) -> Result<NodeContents<'a>, Error> {
    let contents = terminated(
        node_contents::<SyntaxError>,
        preceded(ws, cut(context("expected property or node", eof))),
    );

    all_consuming(contents)(Input::new(source))
        .finish()
        .map(|(_, contents)| contents)
        .map_err(|e| e.into_error(file))
}

/// Parse a Device Tree source file.
fn dts_file<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Dts<'a>, E> {
    map(
        terminated(
            many0(root_item),
            preceded(
                ws,
                cut(context("expected '/', '&label' or a directive", eof)),
            ),
        ),
        Dts,
    )(input)
}

/// Parse a top-level statement.
fn root_item<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, RootItem<'a>, E> {
    alt((
        map(version_directive, |_| RootItem::Version),
        map(memreserve, RootItem::MemReserve),
        map(include_directive, RootItem::Include),
        map(deleted_node_ref, |(r, line)| RootItem::DeleteNode(r, line)),
        map(root_node, RootItem::Node),
        map(node_override, RootItem::Node),
        map(omit_if_no_ref, |(r, line)| RootItem::OmitNode(r, line)),
        unknown_directive,
    ))(input)
}

/// Parse a version directive.
fn version_directive<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    terminated(dts_v1_keyword, cut(context("expected ';'", terminator)))(input)
}

/// Parse a valid root node.
///
/// The root node is a top-level named node in the file and its name should always be '/'.
fn root_node<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Node<'a>, E> {
    map(
        tuple((
            line,
            node_labels,
            root_node_name,
            node_body,
            cut(context("expected ';' after node", terminator)),
        )),
        |(line, labels, _, contents, _)| Node {
            id: NodeId::Name("/", None),
            labels,
            contents,
            omit_if_no_ref: false,
            line,
        },
    )(input)
}

/// Parse a valid node override.
///
/// Node overrides are only valid in the top-level of the file and their name should be
/// a valid node reference.
fn node_override<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Node<'a>, E> {
    map(
        tuple((
            line,
            opt(omit_if_no_ref_keyword),
            node_labels,
            lexeme(node_reference),
            node_body,
            cut(context("expected ';' after node", terminator)),
        )),
        |(line, omit, labels, reference, contents, _)| Node {
            id: NodeId::Ref(reference),
            labels,
            contents,
            omit_if_no_ref: omit.is_some(),
            line,
        },
    )(input)
}

/// Parse a valid inner node.
///
/// Inner nodes are only valid within the body of a node. Their name should be a valid node name.
fn inner_node<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Node<'a>, E> {
    map(
        tuple((
            line,
            opt(omit_if_no_ref_keyword),
            node_labels,
            node_name,
            node_body,
            cut(context("expected ';' after node", terminator)),
        )),
        |(line, omit, labels, id, contents, _)| Node {
            id,
            labels,
            contents,
            omit_if_no_ref: omit.is_some(),
            line,
        },
    )(input)
}

/// Recognize the name of a root node.
fn root_node_name<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('/'))(input)
}

/// Parse the body of a device tree node.
fn node_body<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, NodeContents<'a>, E> {
    preceded(
        left_brace,
        cut(terminated(
            node_contents,
            context("expected property, node or '}'", right_brace),
        )),
    )(input)
}

/// Parse a list of labels, as found before nodes and properties.
fn node_labels<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Vec<&'a str>, E> {
    many0(lexeme(label_def))(input)
}

/// Parse a label definition, i.e. a label name immediately followed by a colon.
fn label_def<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, &'a str, E> {
    map(terminated(label_str, char(':')), |s: Input<'a>| *s.fragment())(input)
}

/// Parse the contents of a node.
fn node_contents<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, NodeContents<'a>, E> {
    enum NodeContent<'s> {
        Statement(Statement<'s>),
        DeletedProp(&'s str),
        DeletedNode(&'s str),
    }

    map(
        many0(alt((
            map(deleted_property, NodeContent::DeletedProp),
            map(deleted_node_name, NodeContent::DeletedNode),
            map(include_directive, |inc| {
                NodeContent::Statement(Statement::Include(inc))
            }),
            map(inner_node, |node| NodeContent::Statement(Statement::Node(node))),
            map(property, |prop| NodeContent::Statement(Statement::Property(prop))),
            unknown_directive,
        ))),
        |contents| {
            contents
                .into_iter()
                .fold(NodeContents::default(), |mut contents, elem| {
                    match elem {
                        NodeContent::Statement(s) => contents.statements.push(s),
                        NodeContent::DeletedProp(p) => contents.deleted_props.push(p),
                        NodeContent::DeletedNode(n) => contents.deleted_nodes.push(n),
                    };
                    contents
                })
        },
    )(input)
}

/// Parse a node property.
fn property<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Property<'a>, E> {
    map(
        tuple((
            line,
            node_labels,
            prop_name,
            opt(preceded(
                assignment,
                cut(context("expected property value", prop_values)),
            )),
            cut(context("expected ';' or ','", terminator)),
        )),
        |(line, labels, name, value, _)| Property {
            name,
            labels,
            value,
            line,
        },
    )(input)
}

/// Parse a propery name.
fn prop_name<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, &'a str, E> {
    map(lexeme(name_str), |s: Input<'a>| *s.fragment())(input)
}

/// Parse a property value list.
///
/// Labels may appear before and after every comma-separated chunk.
fn prop_values<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Vec<PropertyValue<'a>>, E> {
    let value_labels = || many0(map(lexeme(label_def), PropertyValue::Label));

    map(
        separated_list1(
            list_separator,
            tuple((value_labels(), prop_value, value_labels())),
        ),
        |chunks| {
            chunks
                .into_iter()
                .flat_map(|(before, value, after)| {
                    before.into_iter().chain(iter::once(value)).chain(after)
                })
                .collect()
        },
    )(input)
}

/// Parse a single value chunk.
fn prop_value<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyValue<'a>, E> {
    alt((
        prop_value_bits,
        prop_value_cell_array,
        prop_value_bytestring,
        prop_value_incbin,
        prop_value_ref,
        prop_value_str,
    ))(input)
}

/// Parse a property value corresponding to the `/bits/` keyword followed by its arguments.
fn prop_value_bits<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyValue<'a>, E> {
    map(
        tuple((
            bits_keyword,
            cut(context(
                "expected 8, 16, 32, or 64",
                verify(
                    lexeme(map_res(digit1, |s: Input| s.fragment().parse::<u32>())),
                    |n: &u32| matches!(*n, 8 | 16 | 32 | 64),
                ),
            )),
            cut(context("expected '<' after /bits/", cell_array)),
        )),
        |(_, n, cells)| PropertyValue::Bits(n, cells),
    )(input)
}

/// Parse a property value corresponding to a cell array.
///
/// A cell array can be empty.
fn prop_value_cell_array<'a, E: DtsError<'a>>(
    input: Input<'a>,
) -> IResult<'a, PropertyValue<'a>, E> {
    map(cell_array, PropertyValue::CellArray)(input)
}

/// Parse the `<...>` part of a cell array.
fn cell_array<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Vec<PropertyCell<'a>>, E> {
    preceded(
        left_chevron,
        cut(terminated(
            many0(alt((prop_cell_label, prop_cell_ref, prop_cell_expr))),
            context("expected number, reference, label or '>'", right_chevron),
        )),
    )(input)
}

/// Parse a property value corresponding to a byte string.
fn prop_value_bytestring<'a, E: DtsError<'a>>(
    input: Input<'a>,
) -> IResult<'a, PropertyValue<'a>, E> {
    map(
        preceded(
            left_bracket,
            cut(terminated(
                many0(alt((
                    map(lexeme(label_def), ByteCell::Label),
                    map(lexeme(hex_byte), ByteCell::Byte),
                ))),
                context("expected two-digit byte or ']'", right_bracket),
            )),
        ),
        PropertyValue::Bytestring,
    )(input)
}

/// Parse an `/incbin/ ("file"[, offset, size])` value.
fn prop_value_incbin<'a, E: DtsError<'a>>(
    input: Input<'a>,
) -> IResult<'a, PropertyValue<'a>, E> {
    map(
        preceded(
            incbin_keyword,
            cut(delimited(
                left_paren,
                pair(
                    lexeme(string_literal),
                    opt(preceded(
                        list_separator,
                        pair(terminated(integer_expr, list_separator), integer_expr),
                    )),
                ),
                context("expected ')'", right_paren),
            )),
        ),
        |(path, range)| PropertyValue::Incbin {
            path: *path.fragment(),
            range,
        },
    )(input)
}

/// Parse a property value corresponding to a reference to another node.
fn prop_value_ref<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyValue<'a>, E> {
    map(lexeme(node_reference), PropertyValue::Ref)(input)
}

/// Parse a property value corresponding to a string.
fn prop_value_str<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyValue<'a>, E> {
    map(lexeme(string_literal), |s: Input<'a>| {
        PropertyValue::Str(*s.fragment())
    })(input)
}

/// Parse a label placed between the cells of an array.
fn prop_cell_label<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyCell<'a>, E> {
    map(lexeme(label_def), PropertyCell::Label)(input)
}

/// Parse a property cell containing a reference to another node.
fn prop_cell_ref<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyCell<'a>, E> {
    map(lexeme(node_reference), PropertyCell::Ref)(input)
}

/// Parse a property cell containing an integer expression.
fn prop_cell_expr<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, PropertyCell<'a>, E> {
    map(integer_expr, PropertyCell::Expr)(input)
}

/// Parse a node deletion inside a node body.
fn deleted_node_name<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, &'a str, E> {
    delimited(
        delete_node_keyword,
        cut(context(
            "expected node name",
            map(lexeme(name_str), |s: Input<'a>| *s.fragment()),
        )),
        cut(terminator),
    )(input)
}

/// Parse a top-level node deletion by reference.
fn deleted_node_ref<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, (Reference<'a>, u32), E> {
    map(
        tuple((
            line,
            delete_node_keyword,
            cut(context("expected label reference (&foo)", lexeme(node_reference))),
            cut(terminator),
        )),
        |(line, _, reference, _)| (reference, line),
    )(input)
}

/// Parse a deleted property.
fn deleted_property<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, &'a str, E> {
    delimited(
        delete_property_keyword,
        cut(context("expected property name", prop_name)),
        cut(terminator),
    )(input)
}

/// Parse a valid memreserve directive.
fn memreserve<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, MemReserve<'a>, E> {
    map(
        tuple((
            line,
            node_labels,
            memreserve_keyword,
            cut(pair(integer_expr, integer_expr)),
            cut(terminator),
        )),
        |(line, labels, _, (address, size), _)| MemReserve {
            labels,
            address,
            size,
            line,
        },
    )(input)
}

/// Parse a valid omitted node directive.
fn omit_if_no_ref<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, (Reference<'a>, u32), E> {
    map(
        tuple((
            line,
            omit_if_no_ref_keyword,
            cut(context("expected label reference (&foo)", lexeme(node_reference))),
            cut(terminator),
        )),
        |(line, _, reference, _)| (reference, line),
    )(input)
}

/// Parse a valid node reference.
fn node_reference<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Reference<'a>, E> {
    let node_ref = alt((
        map(label_str, |s: Input<'a>| Reference::Label(*s.fragment())),
        map(delimited(char('{'), path_str, char('}')), |s: Input<'a>| {
            Reference::Path(*s.fragment())
        }),
    ));

    preceded(
        char('&'),
        cut(context("expected label or {/path} after '&'", node_ref)),
    )(input)
}

/// Parse a valid node name.
///
/// A node name is composed of node-name part and an optional unit-address.
fn node_name<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, NodeId<'a>, E> {
    map(lexeme(name_str), |s: Input<'a>| {
        let s = *s.fragment();
        match s.split_once('@') {
            Some((name, address)) => NodeId::Name(name, Some(address)),
            None => NodeId::Name(s, None),
        }
    })(input)
}

/// Parse a valid include directive.
fn include_directive<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Include<'a>, E> {
    map(
        tuple((
            line,
            include_keyword,
            cut(context("expected quoted filename", lexeme(string_literal))),
        )),
        |(line, _, path)| Include {
            path: *path.fragment(),
            line,
        },
    )(input)
}

/// Parse a string literal, returning the raw text between the quotes.
fn string_literal<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    preceded(
        char('"'),
        cut(terminated(
            recognize(many0(alt((is_not("\\\""), escape_sequence)))),
            context("unterminated string", char('"')),
        )),
    )(input)
}

/* === Integer expressions === */

/// Parse a valid top-level integer expression in a property cell.
///
/// Valid expressions include a single integer literal (e.g. `<0>`) or a parenthesized expression
/// (e.g. `<(1 << 1)>`).
fn integer_expr<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    alt((
        map(lexeme(integer_literal), Expression::Lit),
        integer_expr_parens,
    ))(input)
}

/// Parse a valid parenthesized integer expression in a property cell.
fn integer_expr_parens<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    preceded(
        left_paren,
        cut(terminated(
            expr_ternary,
            context("expected ')'", right_paren),
        )),
    )(input)
}

/// Parse a conditional expression, the lowest-precedence construct.
fn expr_ternary<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    map(
        pair(
            expr_or,
            opt(tuple((
                lexeme(char('?')),
                cut(expr_ternary),
                cut(context("expected ':'", lexeme(char(':')))),
                cut(expr_ternary),
            ))),
        ),
        |(cond, rest)| match rest {
            Some((_, left, _, right)) => Expression::Ternary {
                cond: Box::new(cond),
                left: Box::new(left),
                right: Box::new(right),
            },
            None => cond,
        },
    )(input)
}

fn expr_or<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(expr_and, lexeme(value(BinaryOperator::Or, tag("||"))))(input)
}

fn expr_and<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(expr_bit_or, lexeme(value(BinaryOperator::And, tag("&&"))))(input)
}

fn expr_bit_or<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_bit_xor,
        lexeme(value(BinaryOperator::BitOr, terminated(char('|'), not(char('|'))))),
    )(input)
}

fn expr_bit_xor<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(expr_bit_and, lexeme(value(BinaryOperator::BitXor, char('^'))))(input)
}

fn expr_bit_and<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_equality,
        lexeme(value(BinaryOperator::BitAnd, terminated(char('&'), not(char('&'))))),
    )(input)
}

fn expr_equality<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_relational,
        lexeme(alt((
            value(BinaryOperator::Eq, tag("==")),
            value(BinaryOperator::Neq, tag("!=")),
        ))),
    )(input)
}

fn expr_relational<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_shift,
        lexeme(alt((
            value(BinaryOperator::Le, tag("<=")),
            value(BinaryOperator::Ge, tag(">=")),
            value(BinaryOperator::Lt, char('<')),
            value(BinaryOperator::Gt, char('>')),
        ))),
    )(input)
}

fn expr_shift<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_additive,
        lexeme(alt((
            value(BinaryOperator::LShift, tag("<<")),
            value(BinaryOperator::RShift, tag(">>")),
        ))),
    )(input)
}

fn expr_additive<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_multiplicative,
        lexeme(alt((
            value(BinaryOperator::Add, char('+')),
            value(BinaryOperator::Sub, char('-')),
        ))),
    )(input)
}

fn expr_multiplicative<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    binary_chain(
        expr_unary,
        lexeme(alt((
            value(BinaryOperator::Mul, char('*')),
            value(BinaryOperator::Div, char('/')),
            value(BinaryOperator::Mod, char('%')),
        ))),
    )(input)
}

/// Parse a unary operator applied to an expression, or a primary expression.
fn expr_unary<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Expression, E> {
    alt((
        map(pair(arith_operator_unary, expr_unary), |(op, e)| {
            Expression::Unary(op, Box::new(e))
        }),
        integer_expr,
    ))(input)
}

/// Parse a left-associative chain of binary operators of the same precedence.
fn binary_chain<'a, E, F, G>(
    mut operand: F,
    mut operator: G,
) -> impl FnMut(Input<'a>) -> IResult<'a, Expression, E>
where
    E: DtsError<'a>,
    F: FnMut(Input<'a>) -> IResult<'a, Expression, E>,
    G: FnMut(Input<'a>) -> IResult<'a, BinaryOperator, E>,
{
    move |input| {
        let (mut input, mut lhs) = operand(input)?;

        loop {
            let (rest, op) = match operator(input) {
                Ok(res) => res,
                Err(nom::Err::Error(_)) => return Ok((input, lhs)),
                Err(e) => return Err(e),
            };
            let (rest, rhs) = operand(rest)?;

            lhs = Expression::Binary(Box::new(lhs), op, Box::new(rhs));
            input = rest;
        }
    }
}

fn integer_literal<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, IntegerLiteral, E> {
    alt((
        map(numeric_literal, IntegerLiteral::Num),
        map(char_literal, IntegerLiteral::Char),
    ))(input)
}

/// Parse an unsigned integer number in any base, with an optional C suffix.
fn numeric_literal<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, u64, E> {
    terminated(alt((hex, octal, dec)), opt(integer_suffix))(input)
}

/// Parse a valid character literal.
fn char_literal<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    delimited(
        char('\''),
        cut(map_opt(
            recognize(many1(alt((is_not("\\'"), escape_sequence)))),
            |s: Input| {
                let bytes = unescape(s.fragment());
                match bytes.as_slice() {
                    [b] => Some(*b as char),
                    _ => {
                        let mut chars = str::from_utf8(&bytes).ok()?.chars();
                        chars.next().filter(|_| chars.next().is_none())
                    }
                }
            },
        )),
        cut(context("unterminated character literal", char('\''))),
    )(input)
}

/* === Low-level syntax parsers === */

/// Recognize an assigment operator.
fn assignment<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('='))(input)
}

/// Recognize a statement terminator.
fn terminator<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char(';'))(input)
}

/// Recognize a list separator.
fn list_separator<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char(','))(input)
}

/// Recognize an opening brace.
fn left_brace<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('{'))(input)
}

/// Recognize a closing brace.
fn right_brace<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('}'))(input)
}

/// Recognize an opening chevron.
fn left_chevron<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('<'))(input)
}

/// Recognize a closing chevron.
fn right_chevron<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('>'))(input)
}

/// Recognize an opening parenthesis.
fn left_paren<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('('))(input)
}

/// Recognize a closing parenthesis.
fn right_paren<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char(')'))(input)
}

/// Recognize an opening bracket.
fn left_bracket<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char('['))(input)
}

/// Recognize a closing bracket.
fn right_bracket<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, char, E> {
    lexeme(char(']'))(input)
}

/// Recognize an arithmetic unary operator.
fn arith_operator_unary<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, UnaryOperator, E> {
    lexeme(alt((
        value(UnaryOperator::Neg, char('-')),
        value(UnaryOperator::BitNot, char('~')),
        value(UnaryOperator::LogicalNot, char('!')),
    )))(input)
}

/// Parse an unsigned integer number in base 16, prefixed by `0x`.
fn hex<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, u64, E> {
    map_res(preceded(tag_no_case("0x"), cut(hex_digit1)), |s: Input| {
        u64::from_str_radix(s.fragment(), 16)
    })(input)
}

/// Parse an unsigned integer number in base 8, prefixed by `0`.
fn octal<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, u64, E> {
    map_res(preceded(char('0'), oct_digit1), |s: Input| {
        u64::from_str_radix(s.fragment(), 8)
    })(input)
}

/// Parse an unsigned integer number in base 10.
fn dec<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, u64, E> {
    map_res(digit1, |s: Input| s.fragment().parse::<u64>())(input)
}

/// Recognize the `U`, `L`, `UL`, `LL` and `ULL` integer suffixes.
fn integer_suffix<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    alt((
        tag_no_case("ull"),
        tag_no_case("ul"),
        tag_no_case("ll"),
        tag_no_case("u"),
        tag_no_case("l"),
    ))(input)
}

/// Parse a byte represented by two hex digits.
fn hex_byte<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, u8, E> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: Input| u8::from_str_radix(s.fragment(), 16),
    )(input)
}

/// Recognize a backslash escape sequence.
fn escape_sequence<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    recognize(pair(char('\\'), anychar))(input)
}

/// Recognize a valid node or property name string.
fn name_str<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || ",._+*#?@-".contains(c))(input)
}

/// Recognize a valid label string.
fn label_str<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// Recognize a valid node path.
fn path_str<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    recognize(pair(
        char('/'),
        take_while(|c: char| c.is_ascii_alphanumeric() || ",._+*#?@-/".contains(c)),
    ))(input)
}

/// Recognize a Devicetree include directive prefix.
fn include_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/include/"))(input)
}

/// Recognize the `/incbin/` keyword.
fn incbin_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/incbin/"))(input)
}

/// Recognize the `/bits/` keyword.
fn bits_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/bits/"))(input)
}

/// Recognize the `/memreserve/` keyword.
fn memreserve_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/memreserve/"))(input)
}

/// Recognize the `/delete-node/` keyword.
fn delete_node_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/delete-node/"))(input)
}

/// Recognize the `/delete-property/` keyword.
fn delete_property_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/delete-property/"))(input)
}

/// Recognize the `/omit-if-no-ref/` keyword.
fn omit_if_no_ref_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/omit-if-no-ref/"))(input)
}

/// Recognize the `/dts-v1/` keyword.
fn dts_v1_keyword<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    lexeme(tag("/dts-v1/"))(input)
}

/// Fail hard on a `/.../` directive that no other parser recognized.
fn unknown_directive<'a, O, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, O, E> {
    let (start, _) = ws(input)?;
    let (_, name) = delimited(
        char('/'),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        char('/'),
    )(start)?;

    let message = match *name.fragment() {
        "plugin" => "/plugin/ is not supported",
        _ => "unknown directive",
    };

    Err(nom::Err::Failure(E::add_context(
        start,
        message,
        E::from_error_kind(start, ErrorKind::Tag),
    )))
}

/* === Utility functions === */

/// Parse a lexeme using the combinator passed as its argument,
/// also consuming any whitespaces or comments before or after.
fn lexeme<'a, O, F, E: DtsError<'a>>(f: F) -> impl FnMut(Input<'a>) -> IResult<'a, O, E>
where
    F: FnMut(Input<'a>) -> IResult<'a, O, E>,
{
    delimited(ws, f, ws)
}

/// Skip whitespace and comments, then return the current line.
fn line<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, u32, E> {
    map(preceded(ws, position), |pos: Input| pos.location_line())(input)
}

/// Consume zero or more whitespace characters or comments.
fn ws<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    recognize(many0(alt((multispace1, line_comment, block_comment))))(input)
}

/// Parse block comments.
fn block_comment<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    recognize(tuple((
        tag("/*"),
        cut(context("unterminated comment", take_until("*/"))),
        tag("*/"),
    )))(input)
}

/// Parse a single line comment.
///
/// The parser stops just before the newline character but doesn't consume the newline.
fn line_comment<'a, E: DtsError<'a>>(input: Input<'a>) -> IResult<'a, Input<'a>, E> {
    recognize(pair(tag("//"), opt(is_not("\n"))))(input)
}

/* === Error reporting === */

/// Error type used when parsing for real: remembers the furthest failure
/// position and the innermost context attached to it.
#[derive(Debug)]
pub(crate) struct SyntaxError<'a> {
    input: Input<'a>,
    context: Option<&'static str>,
}

impl<'a> SyntaxError<'a> {
    fn into_error(self, file: &Path) -> Error {
        let near: String = self
            .input
            .fragment()
            .chars()
            .take_while(|c| *c != '\n')
            .take(24)
            .collect();
        let what = self.context.unwrap_or("syntax error");

        let message = if near.trim().is_empty() {
            format!("{} at end of input", what)
        } else {
            format!("{} near '{}'", what, near.trim_end())
        };

        Error::at(file, self.input.location_line(), message)
    }
}

impl<'a> ParseError<Input<'a>> for SyntaxError<'a> {
    fn from_error_kind(input: Input<'a>, _kind: ErrorKind) -> Self {
        Self {
            input,
            context: None,
        }
    }

    fn append(_input: Input<'a>, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        if other.input.location_offset() > self.input.location_offset() {
            other
        } else {
            self
        }
    }
}

impl<'a> FromExternalError<Input<'a>, ParseIntError> for SyntaxError<'a> {
    fn from_external_error(input: Input<'a>, _kind: ErrorKind, _e: ParseIntError) -> Self {
        Self {
            input,
            context: Some("invalid number"),
        }
    }
}

impl<'a> ContextError<Input<'a>> for SyntaxError<'a> {
    fn add_context(_input: Input<'a>, ctx: &'static str, mut other: Self) -> Self {
        other.context.get_or_insert(ctx);
        other
    }
}

/* === Unit Tests === */

#[cfg(test)]
mod tests {
    use super::*;

    use nom::error::Error;

    /// Run `parser` over the whole of `s`.
    fn parse_all<'a, O>(
        parser: impl FnMut(Input<'a>) -> IResult<'a, O, Error<Input<'a>>>,
        s: &'a str,
    ) -> O {
        match all_consuming(parser)(Input::new(s)) {
            Ok((_, out)) => out,
            Err(e) => panic!("failed to parse {:?}: {:?}", s, e),
        }
    }

    fn lit(n: u64) -> Expression {
        Expression::Lit(IntegerLiteral::Num(n))
    }

    #[test]
    fn parse_escaped_strings() {
        for (input, exp) in [
            (r#""Escaped string: \"\\\"""#, r#"Escaped string: \"\\\""#),
            (r#""""#, ""),
            (r#""tab\there""#, r#"tab\there"#),
        ] {
            assert_eq!(*parse_all(string_literal, input).fragment(), exp);
        }
    }

    #[test]
    fn parse_comments() {
        for input in [
            "// This is a comment\n",
            "// Comment at end of input",
            "/* block */",
            "/* multi\n line */ // and more\n",
        ] {
            assert_eq!(*parse_all(ws, input).fragment(), input);
        }

        assert!(line_comment::<Error<Input>>(Input::new(r#"prop = "value"; // x"#)).is_err());
    }

    #[test]
    fn parse_node_names() {
        for (input, exp) in [
            ("cpus", NodeId::Name("cpus", None)),
            ("cpu@0", NodeId::Name("cpu", Some("0"))),
            ("l2-cache", NodeId::Name("l2-cache", None)),
            ("open-pic", NodeId::Name("open-pic", None)),
            ("soc_gpio1", NodeId::Name("soc_gpio1", None)),
            ("memory@0", NodeId::Name("memory", Some("0"))),
            ("uart@fe001000", NodeId::Name("uart", Some("fe001000"))),
            ("pcie@1,0", NodeId::Name("pcie", Some("1,0"))),
        ] {
            assert_eq!(parse_all(node_name, input), exp);
        }
    }

    #[test]
    fn parse_node_labels() {
        for label in ["L3", "L2_0", "L2_1", "mmc0", "eth0", "pinctrl_wifi_pin", "_x"] {
            assert_eq!(parse_all(label_def, &format!("{}:", label)), label);
        }

        assert!(label_def::<Error<Input>>(Input::new("0abc:")).is_err());
    }

    #[test]
    fn parse_prop_names() {
        for name in [
            "reg",
            "status",
            "compatible",
            "device_type",
            "#size-cells",
            "#address-cells",
            "interrupt-controller",
            "fsl,channel-fifo-len",
            "ibm,ppc-interrupt-server#s",
            "linux,network-index",
        ] {
            assert_eq!(parse_all(prop_name, name), name);
        }
    }

    #[test]
    fn parse_integer_literals() {
        for (input, exp) in [
            ("0", 0),
            ("17", 17),
            ("0x1F", 0x1f),
            ("0X10", 0x10),
            ("010", 8),
            ("08", 8),
            ("42U", 42),
            ("42ULL", 42),
            ("0xffffffffffffffff", u64::MAX),
        ] {
            assert_eq!(parse_all(numeric_literal, input), exp);
        }

        for (input, exp) in [("'A'", 'A'), (r"'\n'", '\n'), (r"'\x41'", 'A')] {
            assert_eq!(parse_all(char_literal, input), exp);
        }
    }

    #[test]
    fn parse_expressions() {
        for (input, exp) in [
            ("(1 + 2 * 3)", 7),
            ("((1 + 2) * 3)", 9),
            ("(1 << 4 | 1)", 17),
            ("(10 - 2 - 3)", 5),
            ("(-1)", -1),
            ("(~0 & 0xff)", 0xff),
            ("(2 > 1 ? 10 : 20)", 10),
            ("(1 == 2 || 3 != 4)", 1),
            ("(6 % 4 ^ 1)", 3),
            ("(!0 && 1)", 1),
            ("(1 <= 1)", 1),
            ("(16 >> 2)", 4),
        ] {
            assert_eq!(parse_all(integer_expr, input).eval(), Some(exp), "{}", input);
        }
    }

    #[test]
    fn parse_properties() {
        use PropertyCell::*;
        use PropertyValue::*;

        for (input, value) in [
            (r#"device_type = "cpu";"#, Some(vec![Str("cpu")])),
            (
                r#"compatible = "ns16550", "ns8250";"#,
                Some(vec![Str("ns16550"), Str("ns8250")]),
            ),
            (
                r#"example = <&mpic 0xf00f0000 19>, "a strange property format";"#,
                Some(vec![
                    CellArray(vec![
                        PropertyCell::Ref(Reference::Label("mpic")),
                        Expr(lit(0xf00f_0000)),
                        Expr(lit(19)),
                    ]),
                    Str("a strange property format"),
                ]),
            ),
            (r#"cache-unified;"#, None),
            (
                r#"interrupts = <17 0xc 'A'>;"#,
                Some(vec![CellArray(vec![
                    Expr(lit(17)),
                    Expr(lit(0xc)),
                    Expr(Expression::Lit(IntegerLiteral::Char('A'))),
                ])]),
            ),
            (
                r#"serial0 = &usart3;"#,
                Some(vec![PropertyValue::Ref(Reference::Label("usart3"))]),
            ),
            (
                r#"cpu = <&{/cpus/cpu@0}>;"#,
                Some(vec![CellArray(vec![PropertyCell::Ref(Reference::Path(
                    "/cpus/cpu@0",
                ))])]),
            ),
            (r#"pinctrl-0 = <>;"#, Some(vec![CellArray(vec![])])),
            (
                r#"mac = [00 1a2B];"#,
                Some(vec![Bytestring(vec![
                    ByteCell::Byte(0x00),
                    ByteCell::Byte(0x1a),
                    ByteCell::Byte(0x2b),
                ])]),
            ),
            (
                r#"wide = /bits/ 64 <1>;"#,
                Some(vec![Bits(64, vec![Expr(lit(1))])]),
            ),
            (
                r#"l = a: <b: 1 c:> d:, "x";"#,
                Some(vec![
                    PropertyValue::Label("a"),
                    CellArray(vec![PropertyCell::Label("b"), Expr(lit(1)), PropertyCell::Label("c")]),
                    PropertyValue::Label("d"),
                    Str("x"),
                ]),
            ),
        ] {
            let prop = parse_all(property, input);
            assert_eq!(prop.value, value, "{}", input);
        }
    }

    #[test]
    fn parse_root_node() {
        use PropertyCell::*;
        use PropertyValue::*;

        let input = r#"/ { #address-cells = <2>; #size-cells = <1>; };"#;

        let exp = Node {
            id: NodeId::Name("/", None),
            contents: NodeContents {
                statements: vec![
                    Statement::Property(Property {
                        name: "#address-cells",
                        labels: vec![],
                        value: Some(vec![CellArray(vec![Expr(lit(2))])]),
                        line: 1,
                    }),
                    Statement::Property(Property {
                        name: "#size-cells",
                        labels: vec![],
                        value: Some(vec![CellArray(vec![Expr(lit(1))])]),
                        line: 1,
                    }),
                ],
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(parse_all(root_node, input), exp);
    }

    #[test]
    fn parse_node_contents_with_deletions() {
        let input = r#"
            a: child@1 { };
            /delete-property/ foo;
            /delete-node/ other;
            /omit-if-no-ref/ maybe { };
        "#;

        let contents = parse_all(node_contents, input);

        assert_eq!(contents.statements.len(), 2);
        assert_eq!(contents.deleted_props, vec!["foo"]);
        assert_eq!(contents.deleted_nodes, vec!["other"]);
        match &contents.statements[1] {
            Statement::Node(node) => {
                assert!(node.omit_if_no_ref);
                assert_eq!(node.line, 5);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_top_level_items() {
        let input = r#"
            /dts-v1/;
            r: /memreserve/ 0x1000 0x100;
            / { };
            l: &foo { };
            &{/a/b} { };
            /delete-node/ &bar;
            /omit-if-no-ref/ &baz;
        "#;

        let Dts(items) = parse_all(dts_file, input);

        assert_eq!(items.len(), 7);
        assert_eq!(items[0], RootItem::Version);
        assert!(matches!(&items[1], RootItem::MemReserve(m) if m.labels == vec!["r"]));
        assert!(matches!(
            &items[4],
            RootItem::Node(Node { id: NodeId::Ref(Reference::Path("/a/b")), .. })
        ));
        assert_eq!(items[5], RootItem::DeleteNode(Reference::Label("bar"), 7));
        assert_eq!(items[6], RootItem::OmitNode(Reference::Label("baz"), 8));
    }

    #[test]
    fn report_syntax_errors() {
        let file = Path::new("bad.dts");

        for (input, line, needle) in [
            ("/dts-v1/;\n/ {\n a = <1>\n b;\n};", 4, "expected ';' or ','"),
            ("/dts-v1/;\n/ {\n", 3, "expected property, node or '}'"),
            ("/dts-v1/;\n/foo/;\n", 2, "unknown directive"),
            ("/dts-v1/;\n/plugin/;\n", 2, "/plugin/ is not supported"),
            ("/dts-v1/;\n/ { a = \"x; };", 2, "unterminated string"),
            ("/dts-v1/;\n/ { a = /bits/ 7 <1>; };", 2, "expected 8, 16, 32, or 64"),
            ("/dts-v1/;\n/ { a = <1 2; };", 2, "expected number, reference, label or '>'"),
        ] {
            let err = parse(input, file).unwrap_err();
            let loc = err.location().unwrap();

            assert_eq!(loc.line, Some(line), "{}: {}", input, err);
            assert!(err.message().contains(needle), "{}: {}", input, err);
        }
    }
}
