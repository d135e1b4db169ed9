//! Device query predicates.
//!
//! # Grammar
//!
//! ```text
//! query   := ε | or
//! or      := and (("OR" | "||") and)*
//! and     := unary (("AND" | "&&") unary)*
//! unary   := ("NOT" | "!") unary | primary
//! primary := "(" or ")" | "[" or "]" | atom
//! atom    := ["IS"] Capability ["." property [("=" | "==" | "!=") value]]
//! value   := "true" | "false" | integer | decimal | 'text' | "text" | word
//! ```
//!
//! Keywords and capability names are case-insensitive; property names and
//! text values are not.  The empty query matches every device.
//!
//! ```
//! use hwhub_query::Predicate;
//!
//! let p = Predicate::parse("Battery.chargeState = Discharging AND NOT IS Camera").unwrap();
//! assert_eq!(p.to_string(), "(Battery.chargeState == 'Discharging' AND NOT IS Camera)");
//! ```

use std::fmt;

use hwhub_registry::DeviceView;
use hwhub_types::{Capability, PropertyValue};
use thiserror::Error;
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// A malformed query string.  Every variant carries the byte offset at which
/// parsing stopped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected character '{found}' at byte {offset}")]
    UnexpectedChar { found: char, offset: usize },

    #[error("unterminated string starting at byte {offset}")]
    UnterminatedString { offset: usize },

    #[error("expected {expected} but found {found} at byte {offset}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        offset: usize,
    },

    #[error("unexpected end of query at byte {offset}, expected {expected}")]
    UnexpectedEnd { expected: &'static str, offset: usize },

    #[error("unknown capability '{name}' at byte {offset}")]
    UnknownCapability { name: String, offset: usize },

    #[error("query nests deeper than {limit} levels at byte {offset}")]
    TooDeep { limit: usize, offset: usize },
}

impl ParseError {
    pub fn offset(&self) -> usize {
        match self {
            ParseError::UnexpectedChar { offset, .. }
            | ParseError::UnterminatedString { offset }
            | ParseError::UnexpectedToken { offset, .. }
            | ParseError::UnexpectedEnd { offset, .. }
            | ParseError::UnknownCapability { offset, .. }
            | ParseError::TooDeep { offset, .. } => *offset,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Predicate tree
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
}

/// An immutable expression tree over capability existence and property
/// comparisons.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// The empty query: matches every device.
    Always,
    /// A query that failed to parse: matches no device.
    Invalid,
    /// The device implements the capability.
    Is(Capability),
    /// The device implements the capability and has the property.
    Has {
        capability: Capability,
        property: String,
    },
    /// The device implements the capability and the property compares as
    /// requested.  `!=` also matches when the property is absent.
    Compare {
        capability: Capability,
        property: String,
        op: Comparison,
        value: PropertyValue,
    },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Strict parse.
    pub fn parse(query: &str) -> Result<Predicate, ParseError> {
        let tokens = lex(query)?;
        if tokens.is_empty() {
            return Ok(Predicate::Always);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: query.len(),
            nesting: 0,
        };
        let (predicate, _) = parser.or()?;
        match parser.peek() {
            None => Ok(predicate),
            Some(token) => Err(ParseError::UnexpectedToken {
                expected: "end of query",
                found: token.kind.describe(),
                offset: token.offset,
            }),
        }
    }

    /// Lenient parse used for live queries: a malformed query is logged and
    /// becomes [`Predicate::Invalid`].
    pub fn from_query(query: &str) -> Predicate {
        Predicate::parse(query).unwrap_or_else(|err| {
            warn!(query = %query, error = %err, "malformed device query matches nothing");
            Predicate::Invalid
        })
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Predicate::Invalid)
    }

    pub fn matches(&self, device: &dyn DeviceView) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Invalid => false,
            Predicate::Is(capability) => device.capabilities().contains(capability),
            Predicate::Has {
                capability,
                property,
            } => device.capabilities().contains(capability) && device.property(property).is_some(),
            Predicate::Compare {
                capability,
                property,
                op,
                value,
            } => {
                if !device.capabilities().contains(capability) {
                    return false;
                }
                let equal = device
                    .property(property)
                    .is_some_and(|actual| actual.loosely_equals(value));
                match op {
                    Comparison::Equal => equal,
                    Comparison::NotEqual => !equal,
                }
            }
            Predicate::Not(inner) => !inner.matches(device),
            Predicate::And(left, right) => left.matches(device) && right.matches(device),
            Predicate::Or(left, right) => left.matches(device) || right.matches(device),
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &PropertyValue) -> fmt::Result {
    match value {
        PropertyValue::Text(text) => {
            write!(f, "'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
        }
        PropertyValue::Double(d) => write!(f, "{d:?}"),
        other => write!(f, "{other}"),
    }
}

/// Renders canonical query syntax; `Invalid` renders as `<invalid>`.
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => Ok(()),
            Predicate::Invalid => f.write_str("<invalid>"),
            Predicate::Is(capability) => write!(f, "IS {capability}"),
            Predicate::Has {
                capability,
                property,
            } => write!(f, "{capability}.{property}"),
            Predicate::Compare {
                capability,
                property,
                op,
                value,
            } => {
                let op = match op {
                    Comparison::Equal => "==",
                    Comparison::NotEqual => "!=",
                };
                write!(f, "{capability}.{property} {op} ")?;
                write_value(f, value)
            }
            Predicate::Not(inner) => write!(f, "NOT {inner}"),
            Predicate::And(left, right) => write!(f, "({left} AND {right})"),
            Predicate::Or(left, right) => write!(f, "({left} OR {right})"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Lexer
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Open,
    Close,
    Dot,
    Equal,
    NotEqual,
    Not,
    And,
    Or,
    Is,
    Word(String),
    Number(PropertyValue),
    Text(String),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Open => "'('".into(),
            TokenKind::Close => "')'".into(),
            TokenKind::Dot => "'.'".into(),
            TokenKind::Equal => "'=='".into(),
            TokenKind::NotEqual => "'!='".into(),
            TokenKind::Not => "NOT".into(),
            TokenKind::And => "AND".into(),
            TokenKind::Or => "OR".into(),
            TokenKind::Is => "IS".into(),
            TokenKind::Word(w) => format!("'{w}'"),
            TokenKind::Number(n) => format!("'{n}'"),
            TokenKind::Text(t) => format!("string '{t}'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn lex(query: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = query.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' | '[' => {
                chars.next();
                TokenKind::Open
            }
            ')' | ']' => {
                chars.next();
                TokenKind::Close
            }
            '.' => {
                chars.next();
                TokenKind::Dot
            }
            '=' => {
                chars.next();
                chars.next_if(|&(_, c)| c == '=');
                TokenKind::Equal
            }
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    TokenKind::NotEqual
                } else {
                    TokenKind::Not
                }
            }
            '&' | '|' => {
                chars.next();
                if chars.next_if(|&(_, next)| next == c).is_none() {
                    return Err(ParseError::UnexpectedChar { found: c, offset });
                }
                if c == '&' { TokenKind::And } else { TokenKind::Or }
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                text.push(escaped);
                            }
                        }
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => text.push(ch),
                    }
                }
                if !closed {
                    return Err(ParseError::UnterminatedString { offset });
                }
                TokenKind::Text(text)
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                while let Some((_, ch)) = chars.next_if(|&(_, ch)| ch.is_ascii_digit() || ch == '.') {
                    literal.push(ch);
                }
                if let Ok(int) = literal.parse::<i64>() {
                    TokenKind::Number(PropertyValue::Int(int))
                } else if let Ok(double) = literal.parse::<f64>() {
                    TokenKind::Number(PropertyValue::Double(double))
                } else {
                    return Err(ParseError::UnexpectedToken {
                        expected: "a number",
                        found: format!("'{literal}'"),
                        offset,
                    });
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some((_, ch)) = chars.next_if(|&(_, ch)| ch.is_alphanumeric() || ch == '_') {
                    word.push(ch);
                }
                match word.to_ascii_uppercase().as_str() {
                    "AND" => TokenKind::And,
                    "OR" => TokenKind::Or,
                    "NOT" => TokenKind::Not,
                    "IS" => TokenKind::Is,
                    _ => TokenKind::Word(word),
                }
            }
            other => return Err(ParseError::UnexpectedChar { found: other, offset }),
        };
        tokens.push(Token { kind, offset });
    }
    Ok(tokens)
}

// ────────────────────────────────────────────────────────────────────────────
// Parser
// ────────────────────────────────────────────────────────────────────────────

/// Deepest expression tree, and deepest parenthesis/negation nesting, a
/// query may produce.
pub const MAX_DEPTH: usize = 128;

/// Parsed subtree together with its depth.
type Parsed = (Predicate, usize);

fn join(left: usize, right: usize, offset: usize) -> Result<usize, ParseError> {
    let depth = left.max(right) + 1;
    if depth > MAX_DEPTH {
        return Err(ParseError::TooDeep {
            limit: MAX_DEPTH,
            offset,
        });
    }
    Ok(depth)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Byte length of the query, reported for errors at end of input.
    end: usize,
    /// Open parentheses and negations on the current descent.
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, ParseError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ParseError::UnexpectedEnd {
            expected,
            offset: self.end,
        })?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        self.eat_at(kind).is_some()
    }

    /// Consume the next token if it is `kind`, returning its offset.
    fn eat_at(&mut self, kind: &TokenKind) -> Option<usize> {
        let offset = self.peek().filter(|t| &t.kind == kind)?.offset;
        self.pos += 1;
        Some(offset)
    }

    fn descend(&mut self, offset: usize) -> Result<(), ParseError> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(ParseError::TooDeep {
                limit: MAX_DEPTH,
                offset,
            });
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Parsed, ParseError> {
        let (mut left, mut depth) = self.and()?;
        while let Some(offset) = self.eat_at(&TokenKind::Or) {
            let (right, right_depth) = self.and()?;
            depth = join(depth, right_depth, offset)?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok((left, depth))
    }

    fn and(&mut self) -> Result<Parsed, ParseError> {
        let (mut left, mut depth) = self.unary()?;
        while let Some(offset) = self.eat_at(&TokenKind::And) {
            let (right, right_depth) = self.unary()?;
            depth = join(depth, right_depth, offset)?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok((left, depth))
    }

    fn unary(&mut self) -> Result<Parsed, ParseError> {
        if let Some(offset) = self.eat_at(&TokenKind::Not) {
            self.descend(offset)?;
            let (inner, depth) = self.unary()?;
            self.nesting -= 1;
            let depth = join(depth, 0, offset)?;
            return Ok((Predicate::Not(Box::new(inner)), depth));
        }
        if let Some(offset) = self.eat_at(&TokenKind::Open) {
            self.descend(offset)?;
            let inner = self.or()?;
            self.nesting -= 1;
            let close = self.next("')'")?;
            if close.kind != TokenKind::Close {
                return Err(ParseError::UnexpectedToken {
                    expected: "')'",
                    found: close.kind.describe(),
                    offset: close.offset,
                });
            }
            return Ok(inner);
        }
        Ok((self.atom()?, 1))
    }

    fn atom(&mut self) -> Result<Predicate, ParseError> {
        self.eat(&TokenKind::Is);
        let token = self.next("a capability")?;
        let name = match token.kind {
            TokenKind::Word(name) => name,
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "a capability",
                    found: other.describe(),
                    offset: token.offset,
                });
            }
        };
        let capability = name
            .parse::<Capability>()
            .map_err(|_| ParseError::UnknownCapability {
                name: name.clone(),
                offset: token.offset,
            })?;

        if !self.eat(&TokenKind::Dot) {
            return Ok(Predicate::Is(capability));
        }
        let token = self.next("a property name")?;
        let property = match token.kind {
            TokenKind::Word(property) => property,
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "a property name",
                    found: other.describe(),
                    offset: token.offset,
                });
            }
        };

        let op = if self.eat(&TokenKind::Equal) {
            Comparison::Equal
        } else if self.eat(&TokenKind::NotEqual) {
            Comparison::NotEqual
        } else {
            return Ok(Predicate::Has {
                capability,
                property,
            });
        };

        let token = self.next("a value")?;
        let value = match token.kind {
            TokenKind::Number(number) => number,
            TokenKind::Text(text) => PropertyValue::Text(text),
            TokenKind::Word(word) if word.eq_ignore_ascii_case("true") => PropertyValue::Bool(true),
            TokenKind::Word(word) if word.eq_ignore_ascii_case("false") => PropertyValue::Bool(false),
            TokenKind::Word(word) => PropertyValue::Text(word),
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "a value",
                    found: other.describe(),
                    offset: token.offset,
                });
            }
        };
        Ok(Predicate::Compare {
            capability,
            property,
            op,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwhub_types::{CapabilitySet, PropertyMap};

    struct Dev {
        caps: CapabilitySet,
        props: PropertyMap,
    }

    impl DeviceView for Dev {
        fn capabilities(&self) -> &CapabilitySet {
            &self.caps
        }

        fn property(&self, key: &str) -> Option<&PropertyValue> {
            self.props.get(key)
        }
    }

    fn dev(caps: &[Capability], props: &[(&str, PropertyValue)]) -> Dev {
        Dev {
            caps: caps.iter().copied().collect(),
            props: props.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn battery(percent: i64, state: &str) -> Dev {
        dev(
            &[Capability::Battery],
            &[
                ("chargePercent", PropertyValue::Int(percent)),
                ("chargeState", PropertyValue::Text(state.into())),
                ("isPresent", PropertyValue::Bool(true)),
            ],
        )
    }

    #[test]
    fn empty_query_matches_everything() {
        let p = Predicate::parse("   ").unwrap();
        assert_eq!(p, Predicate::Always);
        assert!(p.matches(&dev(&[], &[])));
    }

    #[test]
    fn capability_alone_asserts_existence() {
        let p = Predicate::parse("battery").unwrap();
        assert_eq!(p, Predicate::Is(Capability::Battery));
        assert_eq!(Predicate::parse("IS Battery").unwrap(), p);
        assert!(p.matches(&battery(10, "Charging")));
        assert!(!p.matches(&dev(&[Capability::Processor], &[])));
    }

    #[test]
    fn comparisons_use_typed_values() {
        let b = battery(50, "Discharging");
        assert!(Predicate::parse("Battery.chargePercent = 50").unwrap().matches(&b));
        assert!(Predicate::parse("Battery.chargePercent == 50.0").unwrap().matches(&b));
        assert!(Predicate::parse("Battery.chargeState = 'Discharging'").unwrap().matches(&b));
        assert!(Predicate::parse("Battery.chargeState = Discharging").unwrap().matches(&b));
        assert!(!Predicate::parse("Battery.chargeState = discharging").unwrap().matches(&b));
        assert!(Predicate::parse("Battery.isPresent = TRUE").unwrap().matches(&b));
        assert!(Predicate::parse("Battery.chargePercent != 10").unwrap().matches(&b));
    }

    #[test]
    fn comparison_requires_the_capability() {
        let ac = dev(
            &[Capability::GenericInterface],
            &[("chargePercent", PropertyValue::Int(50))],
        );
        assert!(!Predicate::parse("Battery.chargePercent = 50").unwrap().matches(&ac));
        assert!(!Predicate::parse("Battery.chargePercent != 1").unwrap().matches(&ac));
    }

    #[test]
    fn property_without_value_asserts_presence() {
        let p = Predicate::parse("Battery.serial").unwrap();
        assert!(!p.matches(&battery(1, "Charging")));
        assert!(Predicate::parse("Battery.isPresent").unwrap().matches(&battery(1, "Charging")));
    }

    #[test]
    fn precedence_is_not_and_or() {
        // NOT binds tighter than AND, which binds tighter than OR.
        let p = Predicate::parse("NOT Camera AND Battery OR Processor").unwrap();
        assert_eq!(
            p,
            Predicate::Or(
                Box::new(Predicate::And(
                    Box::new(Predicate::Not(Box::new(Predicate::Is(Capability::Camera)))),
                    Box::new(Predicate::Is(Capability::Battery)),
                )),
                Box::new(Predicate::Is(Capability::Processor)),
            )
        );
        let grouped = Predicate::parse("NOT (Camera OR Battery)").unwrap();
        assert!(!grouped.matches(&battery(1, "Charging")));
        assert!(grouped.matches(&dev(&[Capability::Processor], &[])));
    }

    #[test]
    fn symbolic_aliases_and_brackets() {
        let words = Predicate::parse("Battery AND NOT Camera OR Block").unwrap();
        let symbols = Predicate::parse("[Battery && !Camera] || Block").unwrap();
        assert_eq!(words, symbols);
    }

    #[test]
    fn display_reparses_to_the_same_tree() {
        for query in [
            "Battery.chargeState = 'Fully Charged' OR NOT IS Camera",
            "StorageVolume.size != 1.5 AND (Block OR Battery.serial)",
            r"NetworkShare.url = 'smb:\\\\nas\\share'",
            r"Battery.serial = 'it\'s \\ odd'",
        ] {
            let p = Predicate::parse(query).unwrap();
            assert_eq!(Predicate::parse(&p.to_string()).unwrap(), p);
        }
        assert_eq!(Predicate::Always.to_string(), "");
    }

    #[test]
    fn backslashes_survive_display() {
        let p = Predicate::Compare {
            capability: Capability::Battery,
            property: "serial".into(),
            op: Comparison::Equal,
            value: PropertyValue::Text(r"a\'b\".into()),
        };
        assert_eq!(p.to_string(), r"Battery.serial == 'a\\\'b\\'");
        assert_eq!(Predicate::parse(&p.to_string()).unwrap(), p);
    }

    #[test]
    fn runaway_nesting_is_rejected() {
        assert_eq!(
            Predicate::parse(&"(".repeat(10_000)).unwrap_err(),
            ParseError::TooDeep {
                limit: MAX_DEPTH,
                offset: MAX_DEPTH
            }
        );
        let negations = format!("{}Battery", "NOT ".repeat(10_000));
        assert!(matches!(
            Predicate::parse(&negations),
            Err(ParseError::TooDeep { .. })
        ));
        let chain = format!("{}Battery", "Battery AND ".repeat(10_000));
        assert!(matches!(
            Predicate::parse(&chain),
            Err(ParseError::TooDeep { .. })
        ));
        assert_eq!(Predicate::from_query(&"(".repeat(10_000)), Predicate::Invalid);
    }

    #[test]
    fn nesting_within_the_limit_parses() {
        let depth = MAX_DEPTH - 1;
        let nested = format!("{}Battery{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(Predicate::parse(&nested).unwrap(), Predicate::Is(Capability::Battery));

        let chain = format!("{}Battery", "Battery OR ".repeat(100));
        assert!(Predicate::parse(&chain).unwrap().matches(&battery(10, "Charging")));
    }

    #[test]
    fn malformed_queries_report_offsets() {
        assert_eq!(
            Predicate::parse("((").unwrap_err(),
            ParseError::UnexpectedEnd {
                expected: "a capability",
                offset: 2
            }
        );
        assert_eq!(Predicate::parse("Battery AND Toaster").unwrap_err().offset(), 12);
        assert!(matches!(
            Predicate::parse("Battery.serial = 'abc"),
            Err(ParseError::UnterminatedString { offset: 17 })
        ));
        assert!(matches!(
            Predicate::parse("Battery Camera"),
            Err(ParseError::UnexpectedToken { offset: 8, .. })
        ));
        assert!(matches!(
            Predicate::parse("Battery & Camera"),
            Err(ParseError::UnexpectedChar { found: '&', offset: 8 })
        ));
    }

    #[test]
    fn lenient_parse_turns_errors_into_match_nothing() {
        let p = Predicate::from_query("((");
        assert_eq!(p, Predicate::Invalid);
        assert!(!p.is_valid());
        assert!(!p.matches(&battery(1, "Charging")));
        assert!(!p.matches(&dev(&[], &[])));
    }
}
