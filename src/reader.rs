//! The reader: s-expression parsing from text into [`Value`] trees.
//!
//! Symbols are interned into the caller's package as they are read, so
//! identical spellings in one source produce identical symbol identities.
//! Beyond the usual atoms and lists, the grammar covers float literals,
//! the `nil` keyword, dotted pairs `(a b . c)` (required for variadic
//! lambda lists), the `'x` quote shorthand, and `;` line comments.

use crate::symbol::Package;
use crate::value::{cons, Value};
use crate::{ParseError, ParseErrorKind, MAX_PARSE_DEPTH};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while1},
    character::complete::{char, multispace1},
    combinator::{opt, recognize, value},
    error::ErrorKind,
    multi::many0,
    sequence::pair,
    IResult, Parser,
};

/// Allowed non-alphanumeric characters in symbol names. The dot is
/// excluded: it is the dotted-pair marker.
const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_$";

/// Check if a string is a valid symbol name.
/// Valid: non-empty, no leading digit, no "-digit" prefix.
fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    let first = match chars.next() {
        None => return false,
        Some(c) => c,
    };
    if first.is_ascii_digit() {
        return false;
    }
    if first == '-' {
        if let Some(second) = chars.next() {
            if second.is_ascii_digit() {
                return false;
            }
        }
    }
    name.chars()
        .all(|c| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c))
}

/// Consume whitespace and `;` line comments.
fn ws(input: &str) -> IResult<&str, &str> {
    recognize(many0(alt((
        multispace1,
        recognize(pair(char(';'), take_till(|c| c == '\n'))),
    ))))
    .parse(input)
}

/// Parse a number: decimal integer, decimal float, or `#x` hexadecimal.
fn parse_number(input: &str) -> IResult<&str, Value> {
    alt((parse_hexadecimal, parse_decimal)).parse(input)
}

fn parse_decimal(input: &str) -> IResult<&str, Value> {
    let (rest, text) = recognize(pair(
        opt(char('-')),
        pair(
            take_while1(|c: char| c.is_ascii_digit()),
            opt(pair(char('.'), take_while1(|c: char| c.is_ascii_digit()))),
        ),
    ))
    .parse(input)?;

    if text.contains('.') {
        match text.parse::<f64>() {
            Ok(n) => Ok((rest, Value::Float(n))),
            Err(_) => Err(nom::Err::Error(nom::error::Error::new(
                input,
                ErrorKind::Float,
            ))),
        }
    } else {
        match text.parse::<i64>() {
            Ok(n) => Ok((rest, Value::Int(n))),
            // Overflowing literals are rejected rather than silently wrapped
            Err(_) => Err(nom::Err::Error(nom::error::Error::new(
                input,
                ErrorKind::Digit,
            ))),
        }
    }
}

/// Parse a hexadecimal integer (#x or #X prefix)
fn parse_hexadecimal(input: &str) -> IResult<&str, Value> {
    let (rest, _) = char('#').parse(input)?;
    let (rest, _) = alt((char('x'), char('X'))).parse(rest)?;
    let (rest, digits) = take_while1(|c: char| c.is_ascii_hexdigit()).parse(rest)?;

    match i64::from_str_radix(digits, 16) {
        Ok(n) => Ok((rest, Value::Int(n))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::HexDigit,
        ))),
    }
}

/// Parse a boolean (#t or #f)
fn parse_bool(input: &str) -> IResult<&str, Value> {
    alt((
        value(Value::Bool(true), tag("#t")),
        value(Value::Bool(false), tag("#f")),
    ))
    .parse(input)
}

/// Parse a string literal with escape sequences
fn parse_string(input: &str) -> IResult<&str, Value> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut chars = Vec::new();

    loop {
        let mut iter = remaining.chars();
        match iter.next() {
            Some('"') => {
                return Ok((iter.as_str(), Value::Str(chars.into_iter().collect())));
            }
            Some('\\') => {
                match iter.next() {
                    Some('n') => chars.push('\n'),
                    Some('t') => chars.push('\t'),
                    Some('r') => chars.push('\r'),
                    Some('\\') => chars.push('\\'),
                    Some('"') => chars.push('"'),
                    // Unknown or dangling escapes are errors
                    _ => {
                        return Err(nom::Err::Error(nom::error::Error::new(
                            remaining,
                            ErrorKind::Char,
                        )));
                    }
                }
                remaining = iter.as_str();
            }
            Some(ch) => {
                chars.push(ch);
                remaining = iter.as_str();
            }
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    remaining,
                    ErrorKind::Char,
                )));
            }
        }
    }
}

/// Parse a symbol, interning it into `package`. The spelling `nil` reads
/// as the nil value rather than as a symbol.
fn parse_symbol<'a>(input: &'a str, package: &Package) -> IResult<&'a str, Value> {
    let (rest, candidate) =
        take_while1(|c: char| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c))
            .parse(input)?;

    if !is_valid_symbol(candidate) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        )));
    }
    if candidate == "nil" {
        Ok((rest, Value::Nil))
    } else {
        Ok((rest, Value::Symbol(package.intern(candidate))))
    }
}

/// Parse a list, including dotted tails: `()`, `(a b)`, `(a b . c)`.
fn parse_list<'a>(input: &'a str, package: &Package, depth: usize) -> IResult<&'a str, Value> {
    let (input, _) = char('(').parse(input)?;

    let (input, elements) =
        many0(|i: &'a str| parse_sexpr(i, package, depth + 1)).parse(input)?;

    let (input, _) = ws(input)?;
    let (input, tail) = opt(|i: &'a str| {
        let (i, _) = char('.').parse(i)?;
        parse_sexpr(i, package, depth + 1)
    })
    .parse(input)?;
    let (input, _) = ws(input)?;
    let (input, _) = char(')').parse(input)?;

    if elements.is_empty() {
        if tail.is_some() {
            // (. x) has no cell to hang the tail on
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                ErrorKind::Tag,
            )));
        }
        return Ok((input, Value::Nil));
    }

    let mut result = tail.unwrap_or(Value::Nil);
    for element in elements.into_iter().rev() {
        result = cons(element, result);
    }
    Ok((input, result))
}

/// Parse quoted expression ('expr -> (quote expr))
fn parse_quote<'a>(input: &'a str, package: &Package, depth: usize) -> IResult<&'a str, Value> {
    let (input, _) = char('\'').parse(input)?;
    let (input, expr) = parse_sexpr(input, package, depth + 1)?;
    Ok((
        input,
        cons(
            Value::Symbol(package.intern("quote")),
            cons(expr, Value::Nil),
        ),
    ))
}

/// Parse one S-expression, skipping leading whitespace and comments.
fn parse_sexpr<'a>(input: &'a str, package: &Package, depth: usize) -> IResult<&'a str, Value> {
    if depth >= MAX_PARSE_DEPTH {
        // Failure, not Error: backtracking combinators must not swallow
        // the depth limit and retry another alternative.
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    let (input, _) = ws(input)?;
    alt((
        |i| parse_quote(i, package, depth),
        |i| parse_list(i, package, depth),
        parse_number,
        parse_bool,
        parse_string,
        |i| parse_symbol(i, package),
    ))
    .parse(input)
}

/// Convert nom parsing errors to structured [`ParseError`]s
fn convert_error(error: nom::Err<nom::error::Error<&str>>) -> ParseError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => match e.code {
            ErrorKind::TooLarge => ParseError::from_message(
                ParseErrorKind::TooDeeplyNested,
                format!("expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
            ),
            _ => {
                if e.input.is_empty() {
                    ParseError::from_message(
                        ParseErrorKind::Incomplete,
                        "unexpected end of input",
                    )
                } else {
                    ParseError::with_context(
                        ParseErrorKind::InvalidSyntax,
                        "invalid syntax",
                        e.input,
                    )
                }
            }
        },
        nom::Err::Incomplete(_) => {
            ParseError::from_message(ParseErrorKind::Incomplete, "incomplete input")
        }
    }
}

/// Parse a single complete S-expression from `input`.
pub fn parse(input: &str, package: &Package) -> Result<Value, ParseError> {
    let (rest, expr) = parse_sexpr(input, package, 0).map_err(convert_error)?;
    let (rest, _) = ws(rest).unwrap_or((rest, ""));
    if rest.is_empty() {
        Ok(expr)
    } else {
        Err(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            "unexpected content after expression",
            rest,
        ))
    }
}

/// Parse a whole sequence of S-expressions. An empty or comment-only
/// input yields an empty vector.
pub fn parse_all(input: &str, package: &Package) -> Result<Vec<Value>, ParseError> {
    let mut exprs = Vec::new();
    let mut rest = input;
    loop {
        let (after_ws, _) = ws(rest).unwrap_or((rest, ""));
        if after_ws.is_empty() {
            return Ok(exprs);
        }
        let (next, expr) = parse_sexpr(after_ws, package, 0).map_err(convert_error)?;
        exprs.push(expr);
        rest = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test result variants for reader tests
    #[derive(Debug)]
    enum ParseTestResult {
        /// Parsing should succeed and display as this text
        Success(&'static str),
        /// Parsing should fail with this error kind
        SpecificError(ParseErrorKind),
        /// Parsing should fail (any error)
        Error,
    }
    use ParseTestResult::*;

    fn run_parse_tests(test_cases: Vec<(&str, ParseTestResult)>) {
        let package = Package::new("reader-tests");
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let test_id = format!("Parse test #{}", i + 1);
            let result = parse(input, &package);

            match (result, expected) {
                (Ok(actual), Success(expected_display)) => {
                    let displayed = format!("{actual}");
                    assert_eq!(&displayed, expected_display, "{test_id}: value mismatch");

                    // Round-trip: display -> parse -> display is stable.
                    let reparsed = parse(&displayed, &package).unwrap_or_else(|e| {
                        panic!("{test_id}: round-trip parse failed for '{displayed}': {e:?}")
                    });
                    assert_eq!(
                        displayed,
                        format!("{reparsed}"),
                        "{test_id}: round-trip display mismatch"
                    );
                }
                (Err(_), Error) => {}
                (Err(err), SpecificError(expected_kind)) => {
                    assert_eq!(
                        &err.kind, expected_kind,
                        "{test_id}: wrong error kind ({})",
                        err.message
                    );
                }
                (Ok(actual), Error) | (Ok(actual), SpecificError(_)) => {
                    panic!("{test_id}: expected error, got {actual:?}");
                }
                (Err(err), Success(_)) => {
                    panic!("{test_id}: expected success, got error {err:?}");
                }
            }
        }
    }

    #[test]
    fn test_reader_comprehensive() {
        let test_cases = vec![
            // ===== NUMBERS =====
            ("42", Success("42")),
            ("-5", Success("-5")),
            ("0", Success("0")),
            ("#x1A", Success("26")),
            ("#Xff", Success("255")),
            ("1.5", Success("1.5")),
            ("-0.25", Success("-0.25")),
            // A float with a zero fraction displays in integer shape
            ("2.0", Success("2")),
            ("9223372036854775807", Success("9223372036854775807")),
            ("99999999999999999999", Error),
            ("#x", Error),
            ("#xG", Error),
            // ===== BOOLEANS AND NIL =====
            ("#t", Success("#t")),
            ("#f", Success("#f")),
            ("nil", Success("nil")),
            ("()", Success("nil")),
            ("#true", Error),
            // ===== SYMBOLS =====
            ("foo", Success("foo")),
            ("+", Success("+")),
            ("-", Success("-")),
            ("set!", Success("set!")),
            ("if*", Success("if*")),
            ("null?", Success("null?")),
            ("<=", Success("<=")),
            ("-abc", Success("-abc")),
            ("var123", Success("var123")),
            ("123var", Error),
            ("@invalid", Error),
            // ===== STRINGS =====
            ("\"hello\"", Success("\"hello\"")),
            ("\"\"", Success("\"\"")),
            (r#""a\nb""#, Success(r#""a\nb""#)),
            (r#""quote\"inside""#, Success(r#""quote\"inside""#)),
            (r#""bad\zescape""#, Error),
            (r#""unterminated"#, Error),
            // ===== LISTS =====
            ("(1 2 3)", Success("(1 2 3)")),
            ("(+ 1 2)", Success("(+ 1 2)")),
            ("( a   b\t\nc )", Success("(a b c)")),
            ("((1 2) (3 4))", Success("((1 2) (3 4))")),
            ("(lambda (a b) (+ a b))", Success("(lambda (a b) (+ a b))")),
            ("(1 2", SpecificError(ParseErrorKind::Incomplete)),
            (")", SpecificError(ParseErrorKind::InvalidSyntax)),
            ("(1 2) 3", SpecificError(ParseErrorKind::TrailingContent)),
            // ===== DOTTED PAIRS =====
            ("(a . b)", Success("(a . b)")),
            ("(1 2 . 3)", Success("(1 2 . 3)")),
            ("(lambda (a . rest) rest)", Success("(lambda (a . rest) rest)")),
            ("(. b)", Error),
            ("(a . b c)", Error),
            // ===== QUOTE SHORTHAND =====
            ("'foo", Success("(quote foo)")),
            ("'(1 2)", Success("(quote (1 2))")),
            ("''x", Success("(quote (quote x))")),
            ("(quote foo)", Success("(quote foo)")),
            // ===== COMMENTS =====
            ("; leading comment\n42", Success("42")),
            ("(a ; inline\n b)", Success("(a b)")),
            ("7 ; trailing", Success("7")),
            // ===== EMPTY INPUT =====
            ("", SpecificError(ParseErrorKind::Incomplete)),
            ("   ", SpecificError(ParseErrorKind::Incomplete)),
            ("; only a comment", SpecificError(ParseErrorKind::Incomplete)),
        ];

        run_parse_tests(test_cases);
    }

    #[test]
    fn test_reader_depth_limit() {
        let package = Package::new("reader-tests");

        let under = format!(
            "{}1{}",
            "(".repeat(MAX_PARSE_DEPTH - 1),
            ")".repeat(MAX_PARSE_DEPTH - 1)
        );
        assert!(parse(&under, &package).is_ok());

        let over = format!(
            "{}1{}",
            "(".repeat(MAX_PARSE_DEPTH),
            ")".repeat(MAX_PARSE_DEPTH)
        );
        let err = parse(&over, &package).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeeplyNested);
    }

    #[test]
    fn test_reader_interns_into_the_package() {
        let package = Package::new("reader-tests");
        let a = parse("shared-name", &package).unwrap();
        let b = parse("(shared-name)", &package).unwrap().first();
        // Two reads of the same spelling give the same symbol identity.
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_all() {
        let package = Package::new("reader-tests");
        let exprs = parse_all("1 (2 3) ; done\n4", &package).unwrap();
        assert_eq!(exprs.len(), 3);
        assert_eq!(format!("{}", exprs[1]), "(2 3)");

        assert!(parse_all("", &package).unwrap().is_empty());
        assert!(parse_all("(", &package).is_err());
    }
}
