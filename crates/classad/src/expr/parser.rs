use chumsky::prelude::*;
use std::ops::Range;

use crate::common::CharParser;
use crate::expr::ast::{BinaryOp, Expr, Function, Literal, UnaryOp};

enum Postfix {
    Index(Expr),
    Attr(String),
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

fn keyword_or_identifier(name: String) -> Result<Expr, String> {
    let expr = match name.as_str() {
        "true" | "True" | "TRUE" => Expr::Literal(Literal::Bool(true)),
        "false" | "False" | "FALSE" => Expr::Literal(Literal::Bool(false)),
        "undefined" | "UNDEFINED" | "None" => Expr::Literal(Literal::Undefined),
        "and" | "or" | "not" | "in" => return Err(format!("Unexpected keyword `{name}`")),
        _ => Expr::Ident(name),
    };
    Ok(expr)
}

fn resolve_call(name: &str, args: Vec<Expr>) -> Result<Expr, String> {
    let function =
        Function::lookup(name).ok_or_else(|| format!("Unknown function `{name}`"))?;
    let (min, max) = function.arity();
    if args.len() < min || args.len() > max {
        return Err(format!(
            "Function `{name}` takes {} argument(s), {} given",
            if min == max {
                min.to_string()
            } else {
                format!("{min}-{max}")
            },
            args.len()
        ));
    }
    Ok(Expr::Call(function, args))
}

fn string_literal(quote: char) -> impl Parser<char, String, Error = Simple<char>> + Clone {
    let escape = just('\\').ignore_then(choice((
        just('\\'),
        just('"'),
        just('\''),
        just('n').to('\n'),
        just('t').to('\t'),
    )));
    just(quote)
        .ignore_then(
            filter(move |c: &char| *c != '\\' && *c != quote)
                .or(escape)
                .repeated(),
        )
        .then_ignore(just(quote))
        .collect::<String>()
        .labelled("string")
}

fn number() -> impl Parser<char, Expr, Error = Simple<char>> + Clone {
    text::int(10)
        .then(just('.').ignore_then(text::digits(10)).or_not())
        .try_map(
            |(int, fraction): (String, Option<String>), span: Range<usize>| match fraction {
                None => int
                    .parse::<i64>()
                    .map(|value| Expr::Literal(Literal::Int(value)))
                    .map_err(|error| Simple::custom(span, format!("Invalid integer: {error}"))),
                Some(fraction) => format!("{int}.{fraction}")
                    .parse::<f64>()
                    .map(|value| Expr::Literal(Literal::Real(value)))
                    .map_err(|error| Simple::custom(span, format!("Invalid number: {error}"))),
            },
        )
        .labelled("number")
}

/// Grammar, from the loosest binding:
/// `c ? a : b`, `||`/`or`, `&&`/`and`, `not`, comparisons (`== != < <= > >= =?= =!= in`,
/// `not in`), `+ -`, `* / %`, prefix `- !`, postfix `[index]` and `.attr`, atoms.
pub fn expression_parser() -> impl Parser<char, Expr, Error = Simple<char>> {
    recursive(|expr| {
        let args = expr
            .clone()
            .padded()
            .separated_by(just(','))
            .allow_trailing()
            .delimited_by(just('('), just(')'));

        let identifier = text::ident()
            .then(args.or_not())
            .try_map(
                |(name, args): (String, Option<Vec<Expr>>), span: Range<usize>| {
                    let resolved = match args {
                        Some(args) => resolve_call(&name, args),
                        None => keyword_or_identifier(name),
                    };
                    resolved.map_err(|message| Simple::custom(span, message))
                },
            )
            .labelled("identifier");

        let list = expr
            .clone()
            .padded()
            .separated_by(just(','))
            .allow_trailing()
            .delimited_by(just('['), just(']'))
            .map(Expr::List);

        let parenthesized = expr.clone().padded().delimited_by(just('('), just(')'));

        let atom = choice((
            number(),
            string_literal('"').map(|s| Expr::Literal(Literal::Str(s))),
            string_literal('\'').map(|s| Expr::Literal(Literal::Str(s))),
            list,
            parenthesized,
            identifier,
        ))
        .padded();

        let postfix = choice((
            expr.clone()
                .padded()
                .delimited_by(just('['), just(']'))
                .map(Postfix::Index),
            just('.').ignore_then(text::ident()).map(Postfix::Attr),
        ));
        let access = atom
            .then(postfix.padded().repeated())
            .foldl(|base, postfix| match postfix {
                Postfix::Index(index) => Expr::Index(Box::new(base), Box::new(index)),
                Postfix::Attr(name) => Expr::Attr(Box::new(base), name),
            })
            .boxed();

        let unary = choice((just('-').to(UnaryOp::Neg), just('!').to(UnaryOp::Not)))
            .padded()
            .repeated()
            .then(access)
            .foldr(|op, value| Expr::Unary(op, Box::new(value)))
            .boxed();

        let product_op = choice((
            just('*').to(BinaryOp::Mul),
            just('/').to(BinaryOp::Div),
            just('%').to(BinaryOp::Mod),
        ))
        .padded();
        let product = unary
            .clone()
            .then(product_op.then(unary).repeated())
            .foldl(|lhs, (op, rhs)| binary(op, lhs, rhs))
            .boxed();

        let sum_op = choice((just('+').to(BinaryOp::Add), just('-').to(BinaryOp::Sub))).padded();
        let sum = product
            .clone()
            .then(sum_op.then(product).repeated())
            .foldl(|lhs, (op, rhs)| binary(op, lhs, rhs))
            .boxed();

        let comparison_op = choice((
            just("=?=").to(BinaryOp::Is),
            just("=!=").to(BinaryOp::IsNot),
            just("==").to(BinaryOp::Eq),
            just("!=").to(BinaryOp::Ne),
            just("<=").to(BinaryOp::Le),
            just(">=").to(BinaryOp::Ge),
            just("<").to(BinaryOp::Lt),
            just(">").to(BinaryOp::Gt),
            text::keyword("in").to(BinaryOp::In),
            text::keyword("not")
                .padded()
                .then(text::keyword("in"))
                .to(BinaryOp::NotIn),
        ))
        .padded();
        let comparison = sum
            .clone()
            .then(comparison_op.then(sum).repeated())
            .foldl(|lhs, (op, rhs)| binary(op, lhs, rhs))
            .boxed();

        let negation = text::keyword("not")
            .padded()
            .repeated()
            .then(comparison)
            .foldr(|_, value| Expr::Unary(UnaryOp::Not, Box::new(value)))
            .boxed();

        let and_op = just("&&").ignored().or(text::keyword("and")).padded();
        let conjunction = negation
            .clone()
            .then(and_op.ignore_then(negation).repeated())
            .foldl(|lhs, rhs| binary(BinaryOp::And, lhs, rhs))
            .boxed();

        let or_op = just("||").ignored().or(text::keyword("or")).padded();
        let disjunction = conjunction
            .clone()
            .then(or_op.ignore_then(conjunction).repeated())
            .foldl(|lhs, rhs| binary(BinaryOp::Or, lhs, rhs))
            .boxed();

        disjunction
            .then(
                just('?')
                    .padded()
                    .ignore_then(expr.clone())
                    .then_ignore(just(':').padded())
                    .then(expr)
                    .or_not(),
            )
            .map(|(cond, branches)| match branches {
                Some((then, otherwise)) => {
                    Expr::Cond(Box::new(cond), Box::new(then), Box::new(otherwise))
                }
                None => cond,
            })
            .padded()
    })
}

pub fn parse_expression(input: &str) -> anyhow::Result<Expr> {
    expression_parser().then_ignore(end()).parse_text(input)
}
