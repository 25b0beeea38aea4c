//! Parser for textual query submissions.
//!
//! Accepts the fluent chain form, e.g.
//! `Query::from("sensors").filter(value < 42 && id != 0).sink(print)`,
//! covering the operators a plain string can reasonably express: filter,
//! map, project (with renames) and the sink stage. Windowed or joined
//! queries are submitted as serialized plans instead.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, multispace0};
use nom::combinator::{map, opt, recognize};
use nom::multi::{many0, separated_list1};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use dse_core::{BinaryOp, CoreError, CoreResult, Expr};
use dse_plan::{Query, QueryPlan, SinkDescriptor};

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        opt(take_while1(|c: char| {
            c.is_ascii_alphanumeric() || c == '_' || c == '$'
        })),
    ))(input)
}

fn string_literal(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while1(|c| c != '"'), char('"'))(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), expr, char(')')),
        map(string_literal, |s: &str| Expr::lit(s)),
        map(double, |n: f64| {
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Expr::lit(n as i64)
            } else {
                Expr::lit(n)
            }
        }),
        map(identifier, |name: &str| match name {
            "true" => Expr::lit(true),
            "false" => Expr::lit(false),
            other => Expr::field(other),
        }),
    )))(input)
}

fn binary_chain<'a>(
    input: &'a str,
    operand: fn(&'a str) -> IResult<&'a str, Expr>,
    ops: &[(&'static str, BinaryOp)],
) -> IResult<&'a str, Expr> {
    let (mut rest, mut lhs) = operand(input)?;
    loop {
        let mut matched = None;
        for (symbol, op) in ops {
            if let Ok((r, _)) = ws::<_, &str>(tag(*symbol))(rest) {
                matched = Some((r, *op));
                break;
            }
        }
        let Some((r, op)) = matched else {
            return Ok((rest, lhs));
        };
        let (r, rhs) = operand(r)?;
        lhs = Expr::binary(op, lhs, rhs);
        rest = r;
    }
}

fn mul_expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        input,
        atom,
        &[
            ("*", BinaryOp::Mul),
            ("/", BinaryOp::Div),
            ("%", BinaryOp::Mod),
        ],
    )
}

fn add_expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(input, mul_expr, &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)])
}

fn cmp_expr(input: &str) -> IResult<&str, Expr> {
    // longest symbols first so `<=` never parses as `<`
    binary_chain(
        input,
        add_expr,
        &[
            ("<=", BinaryOp::LessEq),
            (">=", BinaryOp::GreaterEq),
            ("==", BinaryOp::Eq),
            ("!=", BinaryOp::NotEq),
            ("<", BinaryOp::Less),
            (">", BinaryOp::Greater),
        ],
    )
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(input, cmp_expr, &[("&&", BinaryOp::And)])
}

fn expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(input, and_expr, &[("||", BinaryOp::Or)])
}

enum Stage {
    Filter(Expr),
    Map(String, Expr),
    Project(Vec<(String, Option<String>)>),
    Sink(SinkDescriptor),
}

fn project_item(input: &str) -> IResult<&str, (String, Option<String>)> {
    let (rest, name) = ws(identifier)(input)?;
    let (rest, rename) = opt(preceded(
        tuple((ws(char('.')), tag("as"), ws(char('(')))),
        nom::sequence::terminated(string_literal, ws(char(')'))),
    ))(rest)?;
    Ok((rest, (name.to_string(), rename.map(str::to_string))))
}

fn sink_spec(input: &str) -> IResult<&str, SinkDescriptor> {
    ws(alt((
        map(
            preceded(
                pair(tag("file"), ws(char('('))),
                nom::sequence::terminated(string_literal, ws(char(')'))),
            ),
            |path: &str| SinkDescriptor::File {
                path: path.to_string(),
                append: false,
            },
        ),
        map(tag("print"), |_| SinkDescriptor::Print),
        map(tag("null"), |_| SinkDescriptor::Null),
    )))(input)
}

fn stage(input: &str) -> IResult<&str, Stage> {
    preceded(
        ws(char('.')),
        alt((
            map(
                preceded(
                    pair(tag("filter"), ws(char('('))),
                    nom::sequence::terminated(expr, ws(char(')'))),
                ),
                Stage::Filter,
            ),
            map(
                preceded(
                    pair(tag("map"), ws(char('('))),
                    nom::sequence::terminated(
                        tuple((
                            ws(string_literal),
                            preceded(ws(char(',')), expr),
                        )),
                        ws(char(')')),
                    ),
                ),
                |(field, e)| Stage::Map(field.to_string(), e),
            ),
            map(
                preceded(
                    pair(tag("project"), ws(char('('))),
                    nom::sequence::terminated(
                        separated_list1(ws(char(',')), project_item),
                        ws(char(')')),
                    ),
                ),
                Stage::Project,
            ),
            map(
                preceded(
                    pair(tag("sink"), ws(char('('))),
                    nom::sequence::terminated(sink_spec, ws(char(')'))),
                ),
                Stage::Sink,
            ),
        )),
    )(input)
}

fn query(input: &str) -> IResult<&str, (String, Vec<Stage>)> {
    let (rest, source) = preceded(
        tuple((
            multispace0,
            tag("Query"),
            ws(tag("::")),
            tag("from"),
            ws(char('(')),
        )),
        nom::sequence::terminated(string_literal, ws(char(')'))),
    )(input)?;
    let (rest, stages) = many0(stage)(rest)?;
    Ok((rest, (source.to_string(), stages)))
}

/// Parse a submitted query string into an untyped logical plan.
pub fn parse_query(input: &str) -> CoreResult<QueryPlan> {
    let (rest, (source, stages)) = query(input)
        .map_err(|e| CoreError::Validation(format!("malformed query: {e}")))?;
    if !rest.trim().is_empty() {
        return Err(CoreError::Validation(format!(
            "malformed query: trailing input at `{}`",
            rest.trim()
        )));
    }
    let mut builder = Query::from(source);
    let mut has_sink = false;
    for stage in stages {
        builder = match stage {
            Stage::Filter(predicate) => builder.filter(predicate),
            Stage::Map(field, e) => builder.map(field, e),
            Stage::Project(fields) => {
                let refs: Vec<(&str, Option<&str>)> = fields
                    .iter()
                    .map(|(n, r)| (n.as_str(), r.as_deref()))
                    .collect();
                builder.project(&refs)
            }
            Stage::Sink(descriptor) => {
                has_sink = true;
                builder.sink(descriptor)
            }
        };
    }
    if !has_sink {
        return Err(CoreError::Validation(
            "query has no sink stage".to_string(),
        ));
    }
    let plan = builder.into_plan();
    plan.validate()?;
    Ok(plan)
}
