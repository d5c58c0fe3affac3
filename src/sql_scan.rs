//! Structural SQL Scan
//!
//! Tokens come from the sqlparser tokenizer (Postgres dialect), which copes
//! with escape strings, dollar quoting, comments and partial fragment SQL.
//! Object extraction parses the statement and walks every query in it; SQL
//! that does not parse has no trustworthy object list.

use sqlparser::ast::{
    visit_relations, ObjectName, Query, SetExpr, TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token as SqlToken, Tokenizer};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// SQL token. Whitespace and comments are dropped; literals and symbols keep
/// their source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    QuotedIdent(String),
    Literal(String),
    Symbol(String),
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self, Token::Symbol(s) if s == symbol)
    }
}

/// Table functions that only generate values
pub const ALLOWED_TABLE_FUNCTIONS: &[&str] = &["generate_series", "unnest"];

/// Tokens paired with their byte offset in `sql`
pub fn tokenize_with_offsets(sql: &str) -> Result<Vec<(usize, Token)>, String> {
    let dialect = PostgreSqlDialect {};
    let located = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| e.to_string())?;

    let starts = line_starts(sql);
    let offsets: Vec<usize> = located
        .iter()
        .map(|t| byte_offset(sql, &starts, t.location.line, t.location.column))
        .collect();

    let mut tokens = Vec::new();
    for (i, item) in located.into_iter().enumerate() {
        let start = offsets[i];
        let end = offsets.get(i + 1).copied().unwrap_or(sql.len()).max(start);
        let text = sql.get(start..end).unwrap_or_default().trim_end();

        let token = match item.token {
            SqlToken::Whitespace(_) | SqlToken::EOF => continue,
            SqlToken::Word(word) if word.quote_style.is_some() => Token::QuotedIdent(word.value),
            SqlToken::Word(word) => Token::Word(word.value),
            SqlToken::Number(..) => Token::Word(text.to_string()),
            _ if text.contains('\'') || (text.starts_with('$') && text.len() > 1) => {
                Token::Literal(text.to_string())
            }
            _ => Token::Symbol(text.to_string()),
        };
        tokens.push((start, token));
    }

    Ok(tokens)
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    Ok(tokenize_with_offsets(sql)?
        .into_iter()
        .map(|(_, token)| token)
        .collect())
}

fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Tokenizer locations are 1-based lines and character columns.
fn byte_offset(sql: &str, starts: &[usize], line: u64, column: u64) -> usize {
    let Some(&start) = starts.get((line as usize).saturating_sub(1)) else {
        return sql.len();
    };
    sql[start..]
        .char_indices()
        .nth((column as usize).saturating_sub(1))
        .map(|(i, _)| start + i)
        .unwrap_or(sql.len())
}

/// What a parsed statement reads from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectScan {
    /// Tables and views, lower-cased, in first-appearance order
    pub objects: Vec<String>,
    /// The subset reached through a JOIN
    pub joined: Vec<String>,
    /// Functions used as FROM items
    pub table_functions: Vec<String>,
}

impl ObjectScan {
    pub fn disallowed_functions(&self) -> impl Iterator<Item = &String> {
        self.table_functions
            .iter()
            .filter(|f| !ALLOWED_TABLE_FUNCTIONS.contains(&unqualified(f)))
    }
}

/// Parse `sql` and collect every object any query in it reads. CTE names
/// are excluded only within the scope that declares them.
pub fn scan_objects(sql: &str) -> Result<ObjectScan, String> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| e.to_string())?;

    let mut collector = RelationCollector::default();
    let _ = statements.visit(&mut collector);

    let functions: BTreeSet<&String> = collector.functions.iter().collect();
    Ok(ObjectScan {
        objects: dedup(
            collector
                .objects
                .iter()
                .filter(|o| !functions.contains(o))
                .cloned(),
        ),
        joined: dedup(collector.joined.iter().cloned()),
        table_functions: dedup(collector.functions.iter().cloned()),
    })
}

/// Objects named after FROM/JOIN, for reporting when `sql` does not parse
pub fn fallback_objects(tokens: &[Token]) -> Vec<String> {
    let mut found = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !(token.is_keyword("from") || token.is_keyword("join")) {
            continue;
        }
        let mut parts = Vec::new();
        let mut k = i + 1;
        while let Some(part) = tokens.get(k).and_then(identifier) {
            parts.push(part);
            if !tokens.get(k + 1).map(|t| t.is_symbol(".")).unwrap_or(false) {
                break;
            }
            k += 2;
        }
        if !parts.is_empty() && parts[0] != "select" {
            found.push(parts.join("."));
        }
    }
    dedup(found.into_iter())
}

#[derive(Default)]
struct RelationCollector {
    scopes: Vec<BTreeSet<String>>,
    objects: Vec<String>,
    joined: Vec<String>,
    functions: Vec<String>,
}

impl RelationCollector {
    fn in_scope(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn collect_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table in &select.from {
                    self.collect_table(table);
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_body(left);
                self.collect_body(right);
            }
            _ => {}
        }
    }

    fn collect_table(&mut self, table: &TableWithJoins) {
        self.collect_factor(&table.relation, false);
        for join in &table.joins {
            self.collect_factor(&join.relation, true);
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor, joined: bool) {
        match factor {
            TableFactor::Table {
                name, args: Some(_), ..
            } => self.functions.push(object_name(name)),
            TableFactor::Table { name, .. } => {
                let name = object_name(name);
                if joined && !self.in_scope(&name) {
                    self.joined.push(name);
                }
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.collect_table(table_with_joins),
            // subqueries are visited as queries of their own
            TableFactor::Derived { .. } => {}
            other => {
                let text = other.to_string();
                let name = text.split('(').next().unwrap_or_default().trim().to_lowercase();
                self.functions.push(name);
            }
        }
    }
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let mut declared = BTreeSet::new();
        if let Some(with) = &query.with {
            let names: Vec<String> = with
                .cte_tables
                .iter()
                .map(|cte| cte.alias.name.value.to_lowercase())
                .collect();

            // A non-recursive CTE body cannot see itself or later CTEs, so
            // those names inside it are real tables.
            if !with.recursive {
                for (i, cte) in with.cte_tables.iter().enumerate() {
                    let hidden = &names[i..];
                    let objects = &mut self.objects;
                    let _ = visit_relations(&*cte.query, |relation| {
                        let name = object_name(relation);
                        if hidden.contains(&name) {
                            objects.push(name);
                        }
                        ControlFlow::<()>::Continue(())
                    });
                }
            }
            declared.extend(names);
        }

        self.scopes.push(declared);
        self.collect_body(&query.body);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.scopes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let name = object_name(relation);
        if !self.in_scope(&name) {
            self.objects.push(name);
        }
        ControlFlow::Continue(())
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Number of non-empty statements separated by `;`
pub fn statement_count(tokens: &[Token]) -> usize {
    tokens
        .split(|t| t.is_symbol(";"))
        .filter(|segment| !segment.is_empty())
        .count()
}

pub fn parentheses_balanced(tokens: &[Token]) -> bool {
    let mut depth: i64 = 0;
    for token in tokens {
        if token.is_symbol("(") {
            depth += 1;
        } else if token.is_symbol(")") {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        }
    }
    depth == 0
}

/// First keyword of the statement, ignoring wrapping parentheses
pub fn leading_keyword(tokens: &[Token]) -> Option<String> {
    tokens
        .iter()
        .find(|t| !t.is_symbol("("))
        .and_then(|t| match t {
            Token::Word(w) => Some(w.to_lowercase()),
            _ => None,
        })
}

/// `SELECT *`, `SELECT DISTINCT *`, `t.*` or `, *`; `COUNT(*)` does not count
pub fn has_select_star(tokens: &[Token]) -> bool {
    tokens.windows(2).any(|pair| {
        pair[1].is_symbol("*")
            && (pair[0].is_keyword("select")
                || pair[0].is_keyword("distinct")
                || pair[0].is_symbol(".")
                || pair[0].is_symbol(","))
    })
}

pub fn has_order_by(tokens: &[Token]) -> bool {
    tokens
        .windows(2)
        .any(|pair| pair[0].is_keyword("order") && pair[1].is_keyword("by"))
}

/// `SELECT ... INTO new_table` creates a table
pub fn has_select_into(tokens: &[Token]) -> bool {
    tokens.iter().any(|t| t.is_keyword("into"))
}

/// Byte offset of the first FROM outside parentheses, skipping
/// `IS DISTINCT FROM`
pub fn top_level_from(sql: &str) -> Option<usize> {
    let tokens = tokenize_with_offsets(sql).ok()?;
    let mut depth: usize = 0;

    for (i, (offset, token)) in tokens.iter().enumerate() {
        if token.is_symbol("(") {
            depth += 1;
        } else if token.is_symbol(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && token.is_keyword("from") {
            let distinct = i > 0 && tokens[i - 1].1.is_keyword("distinct");
            if !distinct {
                return Some(*offset);
            }
        }
    }

    None
}

fn identifier(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) | Token::QuotedIdent(w) => Some(w.to_lowercase()),
        _ => None,
    }
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    names.filter(|name| seen.insert(name.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(sql: &str) -> Vec<String> {
        scan_objects(sql).unwrap().objects
    }

    #[test]
    fn test_tokenize_skips_comments_and_keeps_literals() {
        let tokens = tokenize("SELECT 'it''s' -- trailing\n/* block */ FROM t WHERE a >= 1").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("SELECT".to_string()),
                Token::Literal("'it''s'".to_string()),
                Token::Word("FROM".to_string()),
                Token::Word("t".to_string()),
                Token::Word("WHERE".to_string()),
                Token::Word("a".to_string()),
                Token::Symbol(">=".to_string()),
                Token::Word("1".to_string()),
            ]
        );
    }

    #[test]
    fn test_escape_string_does_not_hide_the_rest() {
        let sql = r"SELECT E'\'' AS a FROM secret_table --'";
        let tokens = tokenize(sql).unwrap();
        assert!(tokens.iter().any(|t| t.is_keyword("from")));
        assert_eq!(objects(sql), vec!["secret_table"]);
    }

    #[test]
    fn test_offsets_point_into_source() {
        let sql = "SELECT 'é'\n  FROM t";
        let tokens = tokenize_with_offsets(sql).unwrap();
        let (offset, token) = &tokens[2];
        assert!(token.is_keyword("from"));
        assert_eq!(&sql[*offset..], "FROM t");
    }

    #[test]
    fn test_referenced_objects_from_and_join() {
        let sql = "SELECT d.id FROM llm_student_demographics d \
                   LEFT JOIN llm_student_programs p ON p.student_id = d.student_id \
                   JOIN public.llm_school_directory s ON s.school_id = d.school_id";
        let scan = scan_objects(sql).unwrap();
        assert_eq!(
            scan.objects,
            vec![
                "llm_student_demographics",
                "llm_student_programs",
                "public.llm_school_directory"
            ]
        );
        assert_eq!(
            scan.joined,
            vec!["llm_student_programs", "public.llm_school_directory"]
        );
    }

    #[test]
    fn test_comma_list_walks_past_aliases_and_subqueries() {
        assert_eq!(
            objects("SELECT * FROM students s, schools AS sch WHERE s.school_id = sch.school_id"),
            vec!["students", "schools"]
        );
        assert_eq!(
            objects("SELECT d.id FROM llm_student_demographics AS d(id), secret_table"),
            vec!["llm_student_demographics", "secret_table"]
        );
        assert_eq!(
            objects("SELECT 1 FROM llm_student_demographics d, (SELECT 1) s, secret_table"),
            vec!["llm_student_demographics", "secret_table"]
        );
    }

    #[test]
    fn test_subqueries_in_expressions_are_scanned() {
        let sql = "SELECT id FROM llm_student_demographics \
                   WHERE id IN (SELECT student_id FROM secret_table)";
        assert_eq!(objects(sql), vec!["llm_student_demographics", "secret_table"]);
    }

    #[test]
    fn test_ctes_are_scoped() {
        let sql = "WITH recent AS (SELECT id FROM llm_student_attendance) \
                   SELECT EXTRACT(YEAR FROM r.visit_date), x.n \
                   FROM recent r JOIN (SELECT 1 AS n) x ON true \
                   WHERE r.a IS DISTINCT FROM r.b";
        assert_eq!(objects(sql), vec!["llm_student_attendance"]);

        // a non-recursive CTE body reading its own name reads the real table
        let sql = "WITH secret_table AS (SELECT * FROM secret_table) SELECT * FROM secret_table";
        assert_eq!(objects(sql), vec!["secret_table"]);

        // a CTE does not hide the same name in an outer query
        let sql = "SELECT * FROM secret_table \
                   WHERE 1 IN (WITH secret_table AS (SELECT 1 AS v) SELECT v FROM secret_table)";
        assert_eq!(objects(sql), vec!["secret_table"]);
    }

    #[test]
    fn test_table_functions_reported_separately() {
        let scan = scan_objects("SELECT d FROM generate_series(1, 3) d").unwrap();
        assert!(scan.objects.is_empty());
        assert_eq!(scan.table_functions, vec!["generate_series"]);
        assert_eq!(scan.disallowed_functions().count(), 0);

        let scan = scan_objects("SELECT * FROM pg_catalog.pg_ls_dir('.')").unwrap();
        assert_eq!(scan.table_functions, vec!["pg_catalog.pg_ls_dir"]);
        assert_eq!(
            scan.disallowed_functions().cloned().collect::<Vec<_>>(),
            vec!["pg_catalog.pg_ls_dir"]
        );
    }

    #[test]
    fn test_words_inside_literals_ignored() {
        let sql = "SELECT id FROM students WHERE note = 'moved from lincoln'";
        assert_eq!(objects(sql), vec!["students"]);
    }

    #[test]
    fn test_unparseable_sql_is_an_error() {
        let sql = "SELECT (s.id FROM students s JOIN schools sch ON true";
        assert!(scan_objects(sql).is_err());
        assert_eq!(fallback_objects(&tokenize(sql).unwrap()), vec!["students", "schools"]);
    }

    #[test]
    fn test_top_level_from_skips_nested_from() {
        let sql = "SELECT EXTRACT(YEAR FROM s.birth_date) AS y, s.id FROM students s";
        let offset = top_level_from(sql).unwrap();
        assert_eq!(&sql[offset..], "FROM students s");
        assert_eq!(top_level_from("SELECT 1"), None);
    }

    #[test]
    fn test_statement_shape_helpers() {
        let tokens = tokenize("SELECT COUNT(*) FROM t ORDER BY 1;").unwrap();
        assert_eq!(statement_count(&tokens), 1);
        assert!(parentheses_balanced(&tokens));
        assert!(!has_select_star(&tokens));
        assert!(has_order_by(&tokens));
        assert!(!has_select_into(&tokens));
        assert_eq!(leading_keyword(&tokens), Some("select".to_string()));

        let tokens = tokenize("SELECT t.* FROM t; SELECT 1").unwrap();
        assert_eq!(statement_count(&tokens), 2);
        assert!(has_select_star(&tokens));

        assert!(has_select_into(&tokenize("SELECT * INTO copy FROM t").unwrap()));
        assert!(!parentheses_balanced(&tokenize("SELECT (1").unwrap()));
        assert!(!parentheses_balanced(&tokenize("SELECT 1)").unwrap()));
    }
}
