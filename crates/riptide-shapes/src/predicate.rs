// Minimal row-predicate evaluation for shape where-clauses.
//
// Shape predicates are opaque SQL fragments as far as identity and
// fingerprinting go, but the consumer needs to decide which replicated rows
// belong to a shape. This module understands the common subset
// `column <op> literal [AND ...]`; anything it cannot parse matches every
// row, so routing over-approximates and never drops a true positive.
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    clauses: Vec<Comparison>,
}

#[derive(Debug, Clone, PartialEq)]
struct Comparison {
    column: String,
    op: CompareOp,
    literal: Literal,
}

impl Predicate {
    /// Parse a where-clause. Returns `None` when the clause falls outside
    /// the supported subset; callers treat that as match-all.
    pub fn parse(clause: &str) -> Option<Predicate> {
        let mut clauses = Vec::new();
        for part in split_on_and(clause) {
            clauses.push(parse_comparison(part.trim())?);
        }
        if clauses.is_empty() {
            return None;
        }
        Some(Predicate { clauses })
    }

    /// Column names the predicate reads.
    pub fn columns(&self) -> Vec<&str> {
        self.clauses.iter().map(|c| c.column.as_str()).collect()
    }

    /// Evaluate against a row record (a JSON object of column values as
    /// decoded text). Rows missing a referenced column are kept: deletes
    /// often carry key columns only, and dropping them would lose data.
    pub fn matches(&self, record: &Value) -> bool {
        let Some(object) = record.as_object() else {
            return true;
        };
        self.clauses.iter().all(|clause| {
            let Some(value) = object.get(&clause.column) else {
                return true;
            };
            clause.matches(value)
        })
    }
}

impl Comparison {
    fn matches(&self, value: &Value) -> bool {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => return false,
            _ => return true,
        };
        match (&self.literal, text.parse::<f64>()) {
            (Literal::Number(rhs), Ok(lhs)) => compare(self.op, lhs, *rhs),
            (Literal::Number(_), Err(_)) => false,
            (Literal::Text(rhs), _) => match self.op {
                CompareOp::Eq => &text == rhs,
                CompareOp::Ne => &text != rhs,
                CompareOp::Lt => &text < rhs,
                CompareOp::Le => &text <= rhs,
                CompareOp::Gt => &text > rhs,
                CompareOp::Ge => &text >= rhs,
            },
        }
    }
}

fn compare(op: CompareOp, lhs: f64, rhs: f64) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::Le => lhs <= rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::Ge => lhs >= rhs,
    }
}

fn split_on_and(clause: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = clause;
    loop {
        match find_and(rest) {
            Some(index) => {
                parts.push(&rest[..index]);
                rest = &rest[index + 3..];
            }
            None => {
                parts.push(rest);
                return parts;
            }
        }
    }
}

// Case-insensitive top-level " AND " outside quotes.
fn find_and(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut in_quotes = false;
    let mut i = 0;
    while i + 3 <= bytes.len() {
        match bytes[i] {
            b'\'' => in_quotes = !in_quotes,
            b'a' | b'A' if !in_quotes => {
                let boundary_before = i == 0 || bytes[i - 1].is_ascii_whitespace();
                let word = &input[i..(i + 3).min(input.len())];
                let boundary_after = bytes
                    .get(i + 3)
                    .map(|b| b.is_ascii_whitespace())
                    .unwrap_or(false);
                if boundary_before && boundary_after && word.eq_ignore_ascii_case("and") {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_comparison(input: &str) -> Option<Comparison> {
    for (token, op) in [
        ("!=", CompareOp::Ne),
        ("<>", CompareOp::Ne),
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
        ("=", CompareOp::Eq),
    ] {
        if let Some(index) = input.find(token) {
            let column = parse_column(input[..index].trim())?;
            let literal = parse_literal(input[index + token.len()..].trim())?;
            return Some(Comparison {
                column,
                op,
                literal,
            });
        }
    }
    None
}

fn parse_column(input: &str) -> Option<String> {
    if let Some(stripped) = input.strip_prefix('"') {
        return stripped.strip_suffix('"').map(str::to_string);
    }
    let starts_with_letter = input
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if starts_with_letter
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Some(input.to_string());
    }
    None
}

fn parse_literal(input: &str) -> Option<Literal> {
    if let Some(stripped) = input.strip_prefix('\'') {
        let inner = stripped.strip_suffix('\'')?;
        if inner.contains('\'') {
            return None;
        }
        return Some(Literal::Text(inner.to_string()));
    }
    input.parse::<f64>().ok().map(Literal::Number)
}
