use anyhow::anyhow;
use chumsky::Parser;
use chumsky::error::{Simple, SimpleReason};
use colored::Color;
use std::fmt::Write;

/// Parser over characters that reports failures as a rendered, user-facing message.
pub trait CharParser<T>: Parser<char, T, Error = Simple<char>> + Sized {
    fn parse_text(&self, input: &str) -> anyhow::Result<T> {
        self.parse(input)
            .map_err(|errors| anyhow!("{}", format_errors_cli(input, errors)))
    }
}

impl<T, P> CharParser<T> for P where P: Parser<char, T, Error = Simple<char>> {}

#[cfg(not(test))]
fn paint<S: AsRef<str>>(text: S, color: Color) -> String {
    use colored::Colorize;
    text.as_ref().color(color).to_string()
}

#[cfg(test)]
fn paint<S: AsRef<str>>(text: S, _color: Color) -> String {
    text.as_ref().to_string()
}

/// Renders the first parse error with the offending span underlined.
pub fn format_errors_cli(input: &str, errors: Vec<Simple<char>>) -> String {
    let Some(error) = errors.into_iter().next() else {
        return "Unknown parse error".to_string();
    };
    let span = error.span();

    let mut expected: Vec<String> = error
        .expected()
        .map(|item| match item {
            Some(c) => format!("`{c}`"),
            None => "end of input".to_string(),
        })
        .collect();
    expected.sort_unstable();
    let expected = if expected.is_empty() {
        "something else".to_string()
    } else {
        expected
            .into_iter()
            .map(|e| paint(e, Color::Blue))
            .collect::<Vec<_>>()
            .join(" or ")
    };

    let mut output = String::new();
    let _ = write!(
        output,
        "Unexpected {}",
        if error.found().is_some() {
            "token"
        } else {
            "end of input"
        }
    );
    if let Some(label) = error.label() {
        let _ = write!(output, " while parsing {}", paint(label, Color::Yellow));
    }
    let _ = writeln!(output, ", expected {expected}:");

    if input.is_empty() {
        output.push_str("(the input was empty)");
        return output;
    }

    let before: String = input.chars().take(span.start).collect();
    let marked: String = input
        .chars()
        .skip(span.start)
        .take(span.end.saturating_sub(span.start))
        .collect();
    let after: String = input.chars().skip(span.end).collect();
    let _ = writeln!(output, "  {before}{}{after}", paint(marked, Color::Red));

    let padding = " ".repeat(2 + span.start);
    let note = match error.reason() {
        SimpleReason::Custom(message) => message.clone(),
        _ => match error.found() {
            Some(c) => format!("Unexpected token `{c}`"),
            None => "Unexpected end of input".to_string(),
        },
    };
    let _ = writeln!(output, "{padding}{}", paint("^ ", Color::Red) + &paint(note, Color::Red));
    output
}
