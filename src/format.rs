//! SQL pretty-printing for display (`formattedSql`).
//!
//! Deterministic: clause keywords are upper-cased and start new lines at the
//! top nesting level; literals and quoted identifiers are kept verbatim;
//! comments are dropped.

use crate::sql_scan::{tokenize, Token};

const KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "in", "is", "null", "as", "on", "join",
    "left", "right", "inner", "outer", "full", "cross", "natural", "group", "by", "order",
    "having", "limit", "offset", "union", "all", "distinct", "case", "when", "then", "else",
    "end", "with", "recursive", "exists", "between", "like", "ilike", "asc", "desc", "true",
    "false", "using", "except", "intersect", "nulls", "first", "last", "over", "partition",
    "filter", "lateral",
];

const CLAUSE_STARTS: &[&str] = &[
    "select", "from", "where", "having", "limit", "offset", "union", "except", "intersect",
];

const JOIN_PREFIXES: &[&str] = &["left", "right", "inner", "full", "cross", "natural", "outer"];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word.to_lowercase().as_str())
}

fn word_at(tokens: &[Token], i: usize) -> Option<String> {
    match tokens.get(i) {
        Some(Token::Word(w)) => Some(w.to_lowercase()),
        _ => None,
    }
}

/// True when the token at `i` begins a top-level clause line
fn starts_clause(tokens: &[Token], i: usize) -> bool {
    let Some(word) = word_at(tokens, i) else {
        return false;
    };
    let previous = i.checked_sub(1).and_then(|p| word_at(tokens, p));

    if CLAUSE_STARTS.contains(&word.as_str()) {
        return true;
    }
    if (word == "group" || word == "order") && word_at(tokens, i + 1).as_deref() == Some("by") {
        return true;
    }
    if word == "join" {
        return !previous
            .as_deref()
            .map(|p| JOIN_PREFIXES.contains(&p))
            .unwrap_or(false);
    }
    if JOIN_PREFIXES.contains(&word.as_str()) {
        let prefixed = previous
            .as_deref()
            .map(|p| JOIN_PREFIXES.contains(&p))
            .unwrap_or(false);
        if prefixed {
            return false;
        }
        let mut j = i + 1;
        while let Some(next) = word_at(tokens, j) {
            if next == "join" {
                return true;
            }
            if !JOIN_PREFIXES.contains(&next.as_str()) {
                break;
            }
            j += 1;
        }
    }
    false
}

pub fn format_sql(sql: &str) -> String {
    let Ok(tokens) = tokenize(sql) else {
        return sql.trim().to_string();
    };
    let mut out = String::new();
    let mut depth: usize = 0;

    for (i, token) in tokens.iter().enumerate() {
        if token.is_symbol(")") {
            depth = depth.saturating_sub(1);
        }

        let at_top = depth == 0 && !out.is_empty();
        let newline = at_top && starts_clause(&tokens, i);
        let continuation = at_top && (token.is_keyword("and") || token.is_keyword("or"));

        if newline {
            out.push('\n');
        } else if continuation {
            out.push_str("\n  ");
        } else if needs_space(&tokens, i, &out) {
            out.push(' ');
        }

        match token {
            Token::Word(w) if is_keyword(w) => out.push_str(&w.to_uppercase()),
            Token::Word(w) => out.push_str(w),
            Token::QuotedIdent(w) => {
                out.push('"');
                out.push_str(w);
                out.push('"');
            }
            Token::Literal(l) => out.push_str(l),
            Token::Symbol(s) => out.push_str(s),
        }

        if token.is_symbol("(") {
            depth += 1;
        }
    }

    out
}

fn needs_space(tokens: &[Token], i: usize, out: &str) -> bool {
    if out.is_empty() || out.ends_with('\n') {
        return false;
    }
    let token = &tokens[i];
    if [")", ",", ".", ";", "::"].iter().any(|s| token.is_symbol(s)) {
        return false;
    }
    let Some(previous) = i.checked_sub(1).map(|p| &tokens[p]) else {
        return false;
    };
    if ["(", ".", "::"].iter().any(|s| previous.is_symbol(s)) {
        return false;
    }
    // function call: name(
    if token.is_symbol("(") {
        if let Token::Word(w) = previous {
            return is_keyword(w);
        }
    }
    true
}
