//! # Identifying queries
//!
//! Construction of the `FIND` queries used to look up an identifiable in the
//! remote datastore, and a parser for the same subset of the query language.

use crate::error::{Result, SyncError};
use crate::identifiable::{IdentValue, Identifiable};
use crate::model::{RemoteId, Value};

/// Escape a string for use inside a single quoted query literal.
pub fn escape_squoted_text(text: &str) -> String {
    text.replace('\\', r"\\")
        .replace('\'', r"\'")
        .replace('*', r"\*")
}

/// Render a float the way the datastore prints it: always with a fraction.
fn float_literal(value: f64) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{text}.0")
    } else {
        text
    }
}

/// Query literal of a stored value. References render as their id.
pub fn convert_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Double(d) => float_literal(*d),
        Value::Text(text) => escape_squoted_text(text),
        Value::Id(id) => id.to_string(),
        Value::Entity(_) => "None".to_string(),
        Value::List(items) => format!(
            "[{}]",
            items.iter().map(convert_value).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Query literal of an identifying value.
pub fn convert_identifying_value(value: &IdentValue) -> String {
    match value {
        IdentValue::Scalar(scalar) => convert_value(scalar),
        IdentValue::Reference { id: Some(id), .. } => id.to_string(),
        IdentValue::Reference { id: None, .. } => "None".to_string(),
        IdentValue::List(items) => format!(
            "[{}]",
            items
                .iter()
                .map(convert_identifying_value)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn property_clause(name: &str, value: &IdentValue, prefix: Option<usize>) -> String {
    let escaped_name = escape_squoted_text(name);
    if let (Some(length), IdentValue::Scalar(Value::Text(text))) = (prefix, value) {
        if text.chars().count() > length {
            let head: String = text.chars().take(length).collect();
            return format!("'{}' LIKE '{}*'", escaped_name, escape_squoted_text(&head));
        }
    }
    format!("'{}'='{}'", escaped_name, convert_identifying_value(value))
}

/// AND-joined clauses for the identifying properties. With `prefix` set,
/// text values longer than the prefix length are matched with `LIKE`.
pub fn create_property_query(identifiable: &Identifiable, prefix: Option<usize>) -> String {
    let mut query = String::new();
    for (name, value) in &identifiable.properties {
        match value {
            None => {
                query.push_str(&format!("'{}' IS NULL AND ", escape_squoted_text(name)));
            }
            Some(IdentValue::List(items)) => {
                for item in items {
                    query.push_str(&property_clause(name, item, prefix));
                    query.push_str(" AND ");
                }
            }
            Some(value) => {
                query.push_str(&property_clause(name, value, prefix));
                query.push_str(" AND ");
            }
        }
    }
    // drop the last "AND ", keeping the separating blank
    let keep = query.len().saturating_sub(4);
    query.truncate(keep);
    query
}

/// `FIND RECORD '<type>' [WHICH IS REFERENCED BY <id> AND]* WITH name='<name>' AND <properties>`
pub fn create_query_for_identifiable(identifiable: &Identifiable, prefix: Option<usize>) -> String {
    let mut query = String::from("FIND RECORD ");
    if let Some(record_type) = &identifiable.record_type {
        query.push_str(&format!("'{}'", escape_squoted_text(record_type)));
    }
    for backref in &identifiable.backrefs {
        let id = backref
            .map(|id| id.to_string())
            .unwrap_or_else(|| "None".to_string());
        query.push_str(&format!(" WHICH IS REFERENCED BY {id} AND"));
    }
    query.push_str(" WITH ");
    if let Some(name) = &identifiable.name {
        query.push_str(&format!("name='{}'", escape_squoted_text(name)));
        if !identifiable.properties.is_empty() {
            query.push_str(" AND ");
        }
    }
    query.push_str(&create_property_query(identifiable, prefix));

    if let Some(stripped) = query.strip_suffix(" AND WITH ") {
        query = stripped.to_string();
    }
    if let Some(stripped) = query.strip_suffix(" AND ") {
        query = stripped.to_string();
    }
    query
}

/// What a `FIND` query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindTarget {
    Record,
    RecordType,
    Entity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    NameEquals(String),
    Equals { property: String, value: String },
    Like { property: String, prefix: String },
    IsNull { property: String },
}

/// Parsed form of the identifying subset of the query language.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub target: FindTarget,
    pub record_type: Option<String>,
    pub referenced_by: Vec<RemoteId>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted { text: String, wildcard: bool },
    Equals,
}

fn tokenize(query: &str) -> Result<Vec<Token>> {
    let invalid = |message: &str| SyncError::InvalidQuery {
        query: query.to_string(),
        message: message.to_string(),
    };
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '=' {
            chars.next();
            tokens.push(Token::Equals);
        } else if c == '\'' {
            chars.next();
            let mut text = String::new();
            let mut wildcard = false;
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(invalid("dangling escape")),
                    },
                    '\'' => {
                        closed = true;
                        break;
                    }
                    '*' if chars.peek() == Some(&'\'') => wildcard = true,
                    other => text.push(other),
                }
            }
            if !closed {
                return Err(invalid("unterminated literal"));
            }
            tokens.push(Token::Quoted { text, wildcard });
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '=' || c == '\'' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    query: &'a str,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> SyncError {
        SyncError::InvalidQuery {
            query: self.query.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> Result<()> {
        if self.peek_keyword(keyword) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {keyword}")))
        }
    }

    fn literal(&mut self) -> Result<(String, bool)> {
        match self.next() {
            Some(Token::Quoted { text, wildcard }) => Ok((text, wildcard)),
            _ => Err(self.error("expected a quoted literal")),
        }
    }

    fn condition(&mut self) -> Result<Condition> {
        match self.next() {
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("name") => {
                if self.next() != Some(Token::Equals) {
                    return Err(self.error("expected = after name"));
                }
                let (text, wildcard) = self.literal()?;
                Ok(Condition::NameEquals(with_wildcard(text, wildcard)))
            }
            Some(Token::Quoted { text: property, .. }) => match self.next() {
                Some(Token::Equals) => {
                    let (text, wildcard) = self.literal()?;
                    Ok(Condition::Equals {
                        property,
                        value: with_wildcard(text, wildcard),
                    })
                }
                Some(Token::Word(word)) if word.eq_ignore_ascii_case("LIKE") => {
                    let (prefix, _) = self.literal()?;
                    Ok(Condition::Like { property, prefix })
                }
                Some(Token::Word(word)) if word.eq_ignore_ascii_case("IS") => {
                    self.keyword("NULL")?;
                    Ok(Condition::IsNull { property })
                }
                _ => Err(self.error("expected =, LIKE or IS NULL")),
            },
            _ => Err(self.error("expected a condition")),
        }
    }
}

fn with_wildcard(mut text: String, wildcard: bool) -> String {
    if wildcard {
        text.push('*');
    }
    text
}

impl FindQuery {
    pub fn parse(query: &str) -> Result<Self> {
        let mut parser = Parser {
            query,
            tokens: tokenize(query)?,
            position: 0,
        };
        parser.keyword("FIND")?;
        let target = match parser.next() {
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("RECORD") => FindTarget::Record,
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("RECORDTYPE") => {
                FindTarget::RecordType
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("ENTITY") => FindTarget::Entity,
            _ => return Err(parser.error("expected RECORD, RECORDTYPE or ENTITY")),
        };
        let record_type = if matches!(parser.peek(), Some(Token::Quoted { .. })) {
            Some(parser.literal()?.0)
        } else {
            None
        };

        let mut referenced_by = Vec::new();
        while parser.peek_keyword("WHICH") {
            parser.position += 1;
            parser.keyword("IS")?;
            parser.keyword("REFERENCED")?;
            parser.keyword("BY")?;
            let id = match parser.next() {
                Some(Token::Word(word)) => word
                    .parse::<RemoteId>()
                    .map_err(|_| parser.error(format!("invalid id {word}")))?,
                _ => return Err(parser.error("expected an id")),
            };
            referenced_by.push(id);
            if parser.peek_keyword("AND") {
                parser.position += 1;
            }
        }

        let mut conditions = Vec::new();
        if parser.peek_keyword("WITH") {
            parser.position += 1;
            if parser.peek().is_some() {
                conditions.push(parser.condition()?);
                while parser.peek_keyword("AND") {
                    parser.position += 1;
                    conditions.push(parser.condition()?);
                }
            }
        }
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }

        Ok(Self {
            target,
            record_type,
            referenced_by,
            conditions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifiable() -> Identifiable {
        Identifiable {
            record_type: Some("Experiment".into()),
            ..Identifiable::default()
        }
    }

    fn scalar(value: impl Into<Value>) -> Option<IdentValue> {
        Some(IdentValue::Scalar(value.into()))
    }

    #[test]
    fn test_name_only_query() {
        let ident = Identifiable {
            name: Some("x".into()),
            ..identifiable()
        };
        assert_eq!(
            create_query_for_identifiable(&ident, None),
            "FIND RECORD 'Experiment' WITH name='x'"
        );
    }

    #[test]
    fn test_query_with_properties_backrefs_and_null() {
        let ident = Identifiable {
            name: Some("it's".into()),
            properties: vec![
                ("date".into(), scalar("2024-01-01")),
                ("flag".into(), scalar(true)),
                ("temp".into(), scalar(2.0)),
                ("project".into(), Some(IdentValue::Reference { handle: None, id: Some(5) })),
                ("comment".into(), None),
            ],
            backrefs: vec![Some(9)],
            ..identifiable()
        };
        assert_eq!(
            create_query_for_identifiable(&ident, None),
            "FIND RECORD 'Experiment' WHICH IS REFERENCED BY 9 AND WITH name='it\\'s' AND \
             'date'='2024-01-01' AND 'flag'='TRUE' AND 'temp'='2.0' AND 'project'='5' AND \
             'comment' IS NULL "
        );
    }

    #[test]
    fn test_list_values_produce_one_clause_each() {
        let ident = Identifiable {
            properties: vec![(
                "tags".into(),
                Some(IdentValue::List(vec![
                    IdentValue::Scalar(Value::text("a")),
                    IdentValue::Scalar(Value::text("b")),
                ])),
            )],
            ..identifiable()
        };
        assert_eq!(create_property_query(&ident, None), "'tags'='a' AND 'tags'='b' ");
    }

    #[test]
    fn test_only_backrefs_strips_dangling_with() {
        let ident = Identifiable {
            backrefs: vec![Some(4)],
            ..identifiable()
        };
        assert_eq!(
            create_query_for_identifiable(&ident, None),
            "FIND RECORD 'Experiment' WHICH IS REFERENCED BY 4"
        );
    }

    #[test]
    fn test_long_text_uses_prefix_match() {
        let long = "a*".repeat(150);
        let ident = Identifiable {
            properties: vec![("text".into(), scalar(long.as_str()))],
            ..identifiable()
        };
        let exact = create_query_for_identifiable(&ident, None);
        let prefixed = create_query_for_identifiable(&ident, Some(200));
        assert!(exact.contains(&format!("'text'='{}'", escape_squoted_text(&long))));
        let head: String = long.chars().take(200).collect();
        assert!(prefixed.ends_with(&format!("'text' LIKE '{}*' ", escape_squoted_text(&head))));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_squoted_text(r"a'b\c*"), r"a\'b\\c\*");
        assert_eq!(convert_value(&Value::Double(1.25)), "1.25");
        assert_eq!(convert_value(&Value::Bool(false)), "FALSE");
    }

    #[test]
    fn test_parse_round_trip_of_built_query() {
        let ident = Identifiable {
            name: Some("x*".into()),
            properties: vec![
                ("date".into(), scalar("2024")),
                ("comment".into(), None),
            ],
            backrefs: vec![Some(-1), Some(3)],
            ..identifiable()
        };
        let parsed = FindQuery::parse(&create_query_for_identifiable(&ident, None)).unwrap();
        assert_eq!(parsed.target, FindTarget::Record);
        assert_eq!(parsed.record_type.as_deref(), Some("Experiment"));
        assert_eq!(parsed.referenced_by, vec![-1, 3]);
        assert_eq!(
            parsed.conditions,
            vec![
                Condition::NameEquals("x*".into()),
                Condition::Equals {
                    property: "date".into(),
                    value: "2024".into()
                },
                Condition::IsNull {
                    property: "comment".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_like_and_recordtype() {
        let parsed = FindQuery::parse("FIND RECORD 'A' WITH 'p' LIKE 'abc*'").unwrap();
        assert_eq!(
            parsed.conditions,
            vec![Condition::Like {
                property: "p".into(),
                prefix: "abc".into()
            }]
        );
        let parsed = FindQuery::parse("FIND RECORDTYPE 'Experiment'").unwrap();
        assert_eq!(parsed.target, FindTarget::RecordType);
        assert!(parsed.conditions.is_empty());
        let parsed = FindQuery::parse("FIND Entity 'Project' with name='p1'").unwrap();
        assert_eq!(parsed.target, FindTarget::Entity);
        assert!(FindQuery::parse("FIND RECORD 'A' WITH 'p'").is_err());
        assert!(FindQuery::parse("SELECT x").is_err());
    }
}
