use crate::alert::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid use expression '{0}' (expected 'use KEY [and KEY ...]')")]
    InvalidUse(String),
    #[error("invalid find expression '{0}' (expected 'KEY [as ALIAS]')")]
    InvalidFind(String),
    #[error("duplicate find expression for {0}")]
    DuplicateFind(String),
    #[error("invalid expectation rule '{0}'")]
    InvalidRule(String),
    #[error("missing alert clause (', otherwise alert SEVERITY') in rule '{0}'")]
    MissingAlertClause(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
    #[error("invalid finding key '{0}' (only letters and hyphens are allowed)")]
    InvalidKey(String),
}

/// `use KEY1 [and KEY2 ...]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseExpr {
    pub keys: Vec<String>,
}

/// `KEY [as ALIAS]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindExpr {
    pub key: String,
    pub alias: String,
}

/// A step parameter after configuration parsing: either passed through as-is
/// or resolved from the findings registry at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputValue {
    Literal(Value),
    Reference(UseExpr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantifier {
    No,
    Some,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum RuleKind {
    /// `(no|some) [new] SUBJECT`
    Default {
        quantifier: Quantifier,
        new: bool,
        subject: String,
    },
    /// `(no|some|all) LIST1 in LIST2`
    Membership {
        quantifier: Quantifier,
        list1: String,
        list2: String,
    },
    /// `LIST1 [not] equals LIST2`
    Equality {
        negated: bool,
        list1: String,
        list2: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectRule {
    pub text: String,
    pub kind: RuleKind,
    pub severity: Severity,
}

pub fn clean_expression(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_finding_key(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.chars().all(|c| c.is_alphabetic() || c == '-')
}

pub fn is_use_expression(value: &str) -> bool {
    value.starts_with("use ")
}

pub fn parse_use_expression(source: &str) -> Result<UseExpr, ParseError> {
    let cleaned = clean_expression(source);
    let tokens: Vec<&str> = cleaned.split(' ').collect();
    if tokens.len() < 2 || tokens[0] != "use" {
        return Err(ParseError::InvalidUse(cleaned));
    }

    let mut keys = Vec::new();
    for (idx, token) in tokens[1..].iter().enumerate() {
        if idx % 2 == 1 {
            if *token != "and" {
                return Err(ParseError::InvalidUse(cleaned));
            }
            continue;
        }
        if *token == "and" || !is_finding_key(token) {
            return Err(ParseError::InvalidUse(cleaned));
        }
        keys.push(token.to_string());
    }

    // a trailing "and" leaves the expression without its last key
    if tokens.len() % 2 == 1 {
        return Err(ParseError::InvalidUse(cleaned));
    }

    Ok(UseExpr { keys })
}

pub fn parse_find_expression(source: &str) -> Result<FindExpr, ParseError> {
    let cleaned = clean_expression(source);
    let tokens: Vec<&str> = cleaned.split(' ').collect();
    let (key, alias) = match tokens.as_slice() {
        [key] => (*key, *key),
        [key, "as", alias] => (*key, *alias),
        _ => return Err(ParseError::InvalidFind(cleaned)),
    };
    for candidate in [key, alias] {
        if !is_finding_key(candidate) {
            return Err(ParseError::InvalidKey(candidate.to_string()));
        }
    }
    Ok(FindExpr {
        key: key.to_string(),
        alias: alias.to_string(),
    })
}

/// Builds the output-name -> alias mapping of one step, in declaration order.
pub fn parse_find_mapping<S: AsRef<str>>(
    expressions: &[S],
) -> Result<Vec<FindExpr>, ParseError> {
    let mut mapping: Vec<FindExpr> = Vec::with_capacity(expressions.len());
    for raw in expressions {
        let parsed = parse_find_expression(raw.as_ref())?;
        if mapping.iter().any(|existing| existing.key == parsed.key) {
            return Err(ParseError::DuplicateFind(parsed.key));
        }
        mapping.push(parsed);
    }
    Ok(mapping)
}

pub fn parse_expect_rule(source: &str) -> Result<ExpectRule, ParseError> {
    let text = clean_expression(source);
    let tokens = tokenize_rule(&text)?;

    let otherwise = tokens
        .iter()
        .position(|token| token == "otherwise")
        .ok_or_else(|| ParseError::MissingAlertClause(text.clone()))?;

    let clause = &tokens[otherwise + 1..];
    if clause.first().map(String::as_str) != Some("alert") || clause.len() < 2 {
        return Err(ParseError::MissingAlertClause(text.clone()));
    }
    let severity_words = &clause[1..];
    if severity_words
        .iter()
        .any(|word| word == "," || !word.chars().all(char::is_alphabetic))
    {
        return Err(ParseError::InvalidRule(text.clone()));
    }
    let severity = Severity::parse(&severity_words.join(" "))?;

    let mut body: Vec<&str> = tokens[..otherwise].iter().map(String::as_str).collect();
    if body.last() == Some(&",") {
        body.pop();
    }
    if body.contains(&",") {
        return Err(ParseError::InvalidRule(text));
    }

    let kind = parse_rule_body(&body).ok_or_else(|| ParseError::InvalidRule(text.clone()))?;
    for key in kind.referenced_keys() {
        if !is_finding_key(key) {
            return Err(ParseError::InvalidKey(key.to_string()));
        }
    }

    Ok(ExpectRule {
        text,
        kind,
        severity,
    })
}

pub fn parse_expect_rules<S: AsRef<str>>(rules: &[S]) -> Result<Vec<ExpectRule>, ParseError> {
    rules
        .iter()
        .map(|rule| parse_expect_rule(rule.as_ref()))
        .collect()
}

fn parse_rule_body(body: &[&str]) -> Option<RuleKind> {
    let quantifier = |word: &str, allow_all: bool| match word {
        "no" => Some(Quantifier::No),
        "some" => Some(Quantifier::Some),
        "all" if allow_all => Some(Quantifier::All),
        _ => None,
    };

    match body {
        [q, list1, "in", list2] => Some(RuleKind::Membership {
            quantifier: quantifier(q, true)?,
            list1: list1.to_string(),
            list2: list2.to_string(),
        }),
        [list1, "equals", list2] => Some(RuleKind::Equality {
            negated: false,
            list1: list1.to_string(),
            list2: list2.to_string(),
        }),
        [list1, "not", "equals", list2] => Some(RuleKind::Equality {
            negated: true,
            list1: list1.to_string(),
            list2: list2.to_string(),
        }),
        [q, "new", subject] => Some(RuleKind::Default {
            quantifier: quantifier(q, false)?,
            new: true,
            subject: subject.to_string(),
        }),
        [q, subject] => Some(RuleKind::Default {
            quantifier: quantifier(q, false)?,
            new: false,
            subject: subject.to_string(),
        }),
        _ => None,
    }
}

fn tokenize_rule(text: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    for word in text.split(' ') {
        if word == "," {
            tokens.push(",".to_string());
            continue;
        }
        match word.strip_suffix(',') {
            Some(stripped) if !stripped.contains(',') => {
                tokens.push(stripped.to_string());
                tokens.push(",".to_string());
            }
            Some(_) => return Err(ParseError::InvalidRule(text.to_string())),
            None if word.contains(',') => return Err(ParseError::InvalidRule(text.to_string())),
            None => tokens.push(word.to_string()),
        }
    }
    Ok(tokens)
}

impl InputValue {
    pub fn from_config(value: Value) -> Result<Self, ParseError> {
        match value {
            Value::String(text) if is_use_expression(&text) => {
                parse_use_expression(&text).map(InputValue::Reference)
            }
            other => Ok(InputValue::Literal(other)),
        }
    }

    pub fn references(&self) -> &[String] {
        match self {
            InputValue::Reference(expr) => &expr.keys,
            InputValue::Literal(_) => &[],
        }
    }
}

impl RuleKind {
    pub fn referenced_keys(&self) -> Vec<&str> {
        match self {
            RuleKind::Default { subject, .. } => vec![subject.as_str()],
            RuleKind::Membership { list1, list2, .. } | RuleKind::Equality { list1, list2, .. } => {
                vec![list1.as_str(), list2.as_str()]
            }
        }
    }

    /// Pairs of lists whose records get projected onto common attributes.
    pub fn compared_pair(&self) -> Option<(&str, &str)> {
        match self {
            RuleKind::Default { .. } => None,
            RuleKind::Membership { list1, list2, .. } | RuleKind::Equality { list1, list2, .. } => {
                Some((list1.as_str(), list2.as_str()))
            }
        }
    }
}

impl ExpectRule {
    pub fn referenced_keys(&self) -> Vec<&str> {
        self.kind.referenced_keys()
    }
}

impl fmt::Display for UseExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "use {}", self.keys.join(" and "))
    }
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            Quantifier::No => "no",
            Quantifier::Some => "some",
            Quantifier::All => "all",
        };
        f.write_str(word)
    }
}

impl fmt::Display for ExpectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Literal parameters keyed by their normalised input name.
pub fn normalize_input_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

pub fn parse_inputs(
    raw: &serde_json::Map<String, Value>,
) -> Result<BTreeMap<String, InputValue>, ParseError> {
    raw.iter()
        .map(|(name, value)| {
            InputValue::from_config(value.clone()).map(|input| (normalize_input_name(name), input))
        })
        .collect()
}
