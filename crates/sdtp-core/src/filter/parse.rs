//! Filter text parsing.
//!
//! Two spellings are accepted and produce the same [`FilterSpec`]:
//! - the JSON wire form, detected by a leading `{`;
//! - the call form, `NAME(arg, ...)`, where `NAME` is one of the six
//!   constructors and arguments are string/number/boolean/null literals,
//!   list literals, or nested constructor calls.
//!
//! Only those constructor names and argument shapes are recognized. Any other
//! identifier, operator or trailing input is a [`FilterSyntaxError`].
use serde_json::{Map, Value as Json};
use snafu::prelude::*;

use super::FilterSpec;

/// Deepest nesting of lists and calls accepted in call form, matching the
/// recursion limit `serde_json` applies to the JSON form.
const MAX_NESTING: usize = 128;

/// Errors raised while parsing filter text.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FilterSyntaxError {
    /// The input looked like JSON but did not decode.
    #[snafu(display("Invalid filter JSON: {source}"))]
    Json {
        /// Underlying JSON decode error.
        source: serde_json::Error,
    },

    /// The call-form expression is malformed.
    #[snafu(display("Invalid filter expression at offset {position}: {message}"))]
    Expression {
        /// Byte offset into the input.
        position: usize,
        /// What was expected.
        message: String,
    },

    /// A filter node is not a JSON object.
    #[snafu(display("Filter node must be an object, found {found}"))]
    NotAnObject {
        /// Rendering of the offending node.
        found: String,
    },

    /// The operator is not one of the six constructors.
    #[snafu(display("Unknown filter operator '{operator}'"))]
    UnknownOperator {
        /// The operator as supplied.
        operator: String,
    },

    /// A required field is absent.
    #[snafu(display("{operator} requires field '{field}'"))]
    MissingField {
        /// Operator of the node.
        operator: String,
        /// Name of the missing field.
        field: String,
    },

    /// A field is present but has the wrong shape.
    #[snafu(display("{operator} field '{field}' must be {expected}"))]
    WrongShape {
        /// Operator of the node.
        operator: String,
        /// Name of the field.
        field: String,
        /// Description of the accepted shape.
        expected: String,
    },

    /// A field that the operator does not take.
    #[snafu(display("{operator} does not accept field '{field}'"))]
    UnexpectedField {
        /// Operator of the node.
        operator: String,
        /// Name of the field.
        field: String,
    },
}

/// Parse filter text in either JSON or call form.
pub fn parse(input: &str) -> Result<FilterSpec, FilterSyntaxError> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') {
        let json: Json = serde_json::from_str(trimmed).context(JsonSnafu)?;
        return parse_json(&json);
    }

    let mut parser = CallParser::new(input);
    let spec = parser.expression()?;
    parser.skip_ws();
    if parser.pos < parser.src.len() {
        return parser.error("unexpected trailing input");
    }
    Ok(spec)
}

/// Interpret a decoded JSON document as a filter tree.
pub fn parse_json(json: &Json) -> Result<FilterSpec, FilterSyntaxError> {
    let Json::Object(obj) = json else {
        return NotAnObjectSnafu {
            found: json.to_string(),
        }
        .fail();
    };

    let operator = match obj.get("operator") {
        Some(Json::String(op)) => op.as_str(),
        Some(_) => {
            return WrongShapeSnafu {
                operator: "filter",
                field: "operator",
                expected: "a string",
            }
            .fail();
        }
        None => {
            return MissingFieldSnafu {
                operator: "filter",
                field: "operator",
            }
            .fail();
        }
    };

    match operator {
        "IN_LIST" => {
            only_fields(obj, operator, &["column", "values"])?;
            let column = string_field(obj, operator, "column")?;
            let values = match obj.get("values") {
                Some(Json::Array(items)) => {
                    items
                        .iter()
                        .map(|v| scalar(v, operator, "values"))
                        .collect::<Result<Vec<_>, _>>()?
                }
                Some(_) => return shape(operator, "values", "a list of scalars"),
                None => return missing(operator, "values"),
            };
            Ok(FilterSpec::InList { column, values })
        }
        "IN_RANGE" => {
            only_fields(obj, operator, &["column", "min_val", "max_val"])?;
            let column = string_field(obj, operator, "column")?;
            let min = optional_scalar(obj, operator, "min_val")?;
            let max = optional_scalar(obj, operator, "max_val")?;
            Ok(FilterSpec::InRange { column, min, max })
        }
        "REGEX_MATCH" => {
            only_fields(obj, operator, &["column", "expression"])?;
            let column = string_field(obj, operator, "column")?;
            let pattern = string_field(obj, operator, "expression")?;
            Ok(FilterSpec::RegexMatch { column, pattern })
        }
        "ALL" | "ANY" | "NONE" => {
            only_fields(obj, operator, &["arguments"])?;
            let children = match obj.get("arguments") {
                Some(Json::Array(items)) => items
                    .iter()
                    .map(parse_json)
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => return shape(operator, "arguments", "a list of filters"),
                None => return missing(operator, "arguments"),
            };
            Ok(combinator(operator, children))
        }
        other => UnknownOperatorSnafu { operator: other }.fail(),
    }
}

fn combinator(operator: &str, children: Vec<FilterSpec>) -> FilterSpec {
    match operator {
        "ALL" => FilterSpec::All(children),
        "ANY" => FilterSpec::Any(children),
        _ => FilterSpec::NoneOf(children),
    }
}

fn shape<T>(operator: &str, field: &str, expected: &str) -> Result<T, FilterSyntaxError> {
    WrongShapeSnafu {
        operator,
        field,
        expected,
    }
    .fail()
}

fn missing<T>(operator: &str, field: &str) -> Result<T, FilterSyntaxError> {
    MissingFieldSnafu { operator, field }.fail()
}

fn only_fields(
    obj: &Map<String, Json>,
    operator: &str,
    allowed: &[&str],
) -> Result<(), FilterSyntaxError> {
    for key in obj.keys() {
        if key != "operator" && !allowed.contains(&key.as_str()) {
            return UnexpectedFieldSnafu {
                operator,
                field: key.as_str(),
            }
            .fail();
        }
    }
    Ok(())
}

fn string_field(
    obj: &Map<String, Json>,
    operator: &str,
    field: &str,
) -> Result<String, FilterSyntaxError> {
    match obj.get(field) {
        Some(Json::String(s)) => Ok(s.clone()),
        Some(_) => shape(operator, field, "a string"),
        None => missing(operator, field),
    }
}

fn scalar(value: &Json, operator: &str, field: &str) -> Result<Json, FilterSyntaxError> {
    match value {
        Json::Array(_) | Json::Object(_) => shape(operator, field, "a scalar"),
        other => Ok(other.clone()),
    }
}

fn optional_scalar(
    obj: &Map<String, Json>,
    operator: &str,
    field: &str,
) -> Result<Option<Json>, FilterSyntaxError> {
    match obj.get(field) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => scalar(v, operator, field).map(Some),
    }
}

/// Argument of a call-form constructor before it is checked against the
/// constructor's signature.
enum Arg {
    Scalar(Json),
    List(Vec<Arg>),
    Filter(FilterSpec),
}

struct CallParser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> CallParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            depth: 0,
        }
    }

    /// Run `f` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, FilterSyntaxError>,
    ) -> Result<T, FilterSyntaxError> {
        if self.depth >= MAX_NESTING {
            return self.error(format!("filter nested too deeply (limit {MAX_NESTING})"));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, FilterSyntaxError> {
        ExpressionSnafu {
            position: self.pos,
            message: message.into(),
        }
        .fail()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), FilterSyntaxError> {
        self.skip_ws();
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            Some(c) => self.error(format!("expected '{want}', found '{c}'")),
            None => self.error(format!("expected '{want}', found end of input")),
        }
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn expression(&mut self) -> Result<FilterSpec, FilterSyntaxError> {
        self.skip_ws();
        let start = self.pos;
        let name = self.identifier();
        if name.is_empty() {
            return self.error("expected a filter constructor");
        }
        if !matches!(
            name,
            "IN_LIST" | "IN_RANGE" | "REGEX_MATCH" | "ALL" | "ANY" | "NONE"
        ) {
            self.pos = start;
            return UnknownOperatorSnafu { operator: name }.fail();
        }

        self.expect('(')?;
        let args = self.arguments(')')?;
        self.build(name, args)
    }

    /// Comma-separated items up to `close`; a trailing comma is allowed.
    fn arguments(&mut self, close: char) -> Result<Vec<Arg>, FilterSyntaxError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(items);
            }
            items.push(self.argument()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(c) if c == close => {
                    self.bump();
                    return Ok(items);
                }
                Some(c) => return self.error(format!("expected ',' or '{close}', found '{c}'")),
                None => return self.error(format!("expected '{close}', found end of input")),
            }
        }
    }

    fn argument(&mut self) -> Result<Arg, FilterSyntaxError> {
        self.skip_ws();
        match self.peek() {
            Some('[') => {
                self.bump();
                self.nested(|p| p.arguments(']')).map(Arg::List)
            }
            Some(q @ ('\'' | '"')) => {
                self.bump();
                self.string(q).map(|s| Arg::Scalar(Json::String(s)))
            }
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => {
                self.number().map(Arg::Scalar)
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos;
                match self.identifier() {
                    "true" | "True" => Ok(Arg::Scalar(Json::Bool(true))),
                    "false" | "False" => Ok(Arg::Scalar(Json::Bool(false))),
                    "null" | "None" => Ok(Arg::Scalar(Json::Null)),
                    _ => {
                        self.pos = start;
                        self.nested(Self::expression).map(Arg::Filter)
                    }
                }
            }
            Some(c) => self.error(format!("unexpected '{c}'")),
            None => self.error("unexpected end of input"),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, FilterSyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                    // Unknown escapes are kept verbatim so regex classes like \d survive.
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return self.error("unterminated string"),
                },
                Some(c) => out.push(c),
                None => return self.error("unterminated string"),
            }
        }
    }

    fn number(&mut self) -> Result<Json, FilterSyntaxError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.bump();
        }
        let text = &self.src[start..self.pos];
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Json::from(i));
        }
        match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            Some(n) => Ok(Json::Number(n)),
            None => {
                self.pos = start;
                self.error(format!("invalid number '{text}'"))
            }
        }
    }

    fn build(&self, name: &str, args: Vec<Arg>) -> Result<FilterSpec, FilterSyntaxError> {
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                self.error(format!("{name} takes {n} argument(s), got {}", args.len()))
            }
        };

        match name {
            "IN_LIST" => {
                arity(2)?;
                let mut args = args.into_iter();
                let column = self.column_arg(name, args.next())?;
                let values = match args.next() {
                    Some(Arg::List(items)) => items
                        .into_iter()
                        .map(|item| match item {
                            Arg::Scalar(v) => Ok(v),
                            _ => shape(name, "values", "a list of scalars"),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return shape(name, "values", "a list of scalars"),
                };
                Ok(FilterSpec::InList { column, values })
            }
            "IN_RANGE" => {
                arity(3)?;
                let mut args = args.into_iter();
                let column = self.column_arg(name, args.next())?;
                let mut bound = |field: &str| match args.next() {
                    Some(Arg::Scalar(Json::Null)) => Ok(None),
                    Some(Arg::Scalar(v)) => Ok(Some(v)),
                    _ => shape(name, field, "a scalar"),
                };
                let min = bound("min_val")?;
                let max = bound("max_val")?;
                Ok(FilterSpec::InRange { column, min, max })
            }
            "REGEX_MATCH" => {
                arity(2)?;
                let mut args = args.into_iter();
                let column = self.column_arg(name, args.next())?;
                let pattern = match args.next() {
                    Some(Arg::Scalar(Json::String(p))) => p,
                    _ => return shape(name, "expression", "a string"),
                };
                Ok(FilterSpec::RegexMatch { column, pattern })
            }
            _ => {
                arity(1)?;
                let children = match args.into_iter().next() {
                    Some(Arg::List(items)) => items
                        .into_iter()
                        .map(|item| match item {
                            Arg::Filter(f) => Ok(f),
                            _ => shape(name, "arguments", "a list of filters"),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return shape(name, "arguments", "a list of filters"),
                };
                Ok(combinator(name, children))
            }
        }
    }

    fn column_arg(&self, name: &str, arg: Option<Arg>) -> Result<String, FilterSyntaxError> {
        match arg {
            Some(Arg::Scalar(Json::String(c))) => Ok(c),
            _ => shape(name, "column", "a string"),
        }
    }
}
