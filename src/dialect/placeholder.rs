//! Universal `?` placeholder scanning and rewriting.
//!
//! Callers always write `?`. The scanner skips string literals, quoted
//! identifiers and comments, so a `?` inside `'...'` is never rewritten.
//! Engines that treat `\` as an escape inside quoted strings (MySQL by
//! default) scan with `backslash_escapes` set, so `'it\'s'` stays one literal.

use crate::models::QueryParam;

/// Native placeholder syntax of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` (MySQL)
    Question,
    /// `$1, $2, ...` (PostgreSQL)
    Dollar,
    /// `?1, ?2, ...` (SQLite)
    NumberedQuestion,
    /// `:param1, :param2, ...` (Oracle)
    Named,
    /// `@P1, @P2, ...` (SQL Server)
    AtP,
}

impl PlaceholderStyle {
    /// Native placeholder for the 1-based position `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Question => "?".to_string(),
            Self::Dollar => format!("${n}"),
            Self::NumberedQuestion => format!("?{n}"),
            Self::Named => format!(":param{n}"),
            Self::AtP => format!("@P{n}"),
        }
    }
}

/// Query text with native placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenQuery {
    pub sql: String,
    pub placeholders: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment,
}

/// Walk `sql`, calling `on_placeholder` for every `?` outside literals and
/// comments and `on_text` for everything else.
fn scan<F, G>(sql: &str, backslash_escapes: bool, mut on_text: F, mut on_placeholder: G)
where
    F: FnMut(char),
    G: FnMut(),
{
    let mut state = ScanState::Code;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            ScanState::Code => match c {
                '?' => {
                    on_placeholder();
                    continue;
                }
                '\'' => state = ScanState::SingleQuote,
                '"' => state = ScanState::DoubleQuote,
                '`' => state = ScanState::Backtick,
                '-' if chars.peek() == Some(&'-') => state = ScanState::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    on_text(c);
                    if let Some(star) = chars.next() {
                        on_text(star);
                    }
                    state = ScanState::BlockComment;
                    continue;
                }
                _ => {}
            },
            ScanState::SingleQuote | ScanState::DoubleQuote
                if backslash_escapes && c == '\\' =>
            {
                on_text(c);
                if let Some(escaped) = chars.next() {
                    on_text(escaped);
                }
                continue;
            }
            ScanState::SingleQuote if c == '\'' => state = ScanState::Code,
            ScanState::DoubleQuote if c == '"' => state = ScanState::Code,
            ScanState::Backtick if c == '`' => state = ScanState::Code,
            ScanState::LineComment if c == '\n' => state = ScanState::Code,
            ScanState::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                on_text(c);
                if let Some(slash) = chars.next() {
                    on_text(slash);
                }
                state = ScanState::Code;
                continue;
            }
            _ => {}
        }
        on_text(c);
    }
}

/// Count the `?` placeholders in `sql`.
pub fn count_placeholders(sql: &str, backslash_escapes: bool) -> usize {
    let mut count = 0;
    scan(sql, backslash_escapes, |_| {}, || count += 1);
    count
}

/// Rewrite `?` placeholders into `style`, numbering them left to right.
pub fn rewrite_placeholders(
    sql: &str,
    style: PlaceholderStyle,
    backslash_escapes: bool,
) -> RewrittenQuery {
    let out = std::cell::RefCell::new(String::with_capacity(sql.len() + 16));
    let mut n = 0;
    scan(
        sql,
        backslash_escapes,
        |c| out.borrow_mut().push(c),
        || {
            n += 1;
            out.borrow_mut().push_str(&style.placeholder(n));
        },
    );
    RewrittenQuery {
        sql: out.into_inner(),
        placeholders: n,
    }
}

/// Substitute parameters into `sql` as literals, for display only.
///
/// Missing parameters leave the `?` in place; extra parameters are ignored.
pub fn substitute_params(sql: &str, params: &[QueryParam], backslash_escapes: bool) -> String {
    let out = std::cell::RefCell::new(String::with_capacity(sql.len() + params.len() * 8));
    let mut next = params.iter();
    scan(
        sql,
        backslash_escapes,
        |c| out.borrow_mut().push(c),
        || match next.next() {
            Some(p) => out.borrow_mut().push_str(&p.to_sql_literal()),
            None => out.borrow_mut().push('?'),
        },
    );
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_each_style() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(
            rewrite_placeholders(sql, PlaceholderStyle::Dollar, false).sql,
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        assert_eq!(
            rewrite_placeholders(sql, PlaceholderStyle::NumberedQuestion, false).sql,
            "SELECT * FROM t WHERE a = ?1 AND b = ?2"
        );
        assert_eq!(
            rewrite_placeholders(sql, PlaceholderStyle::Named, false).sql,
            "SELECT * FROM t WHERE a = :param1 AND b = :param2"
        );
        assert_eq!(
            rewrite_placeholders(sql, PlaceholderStyle::AtP, false).sql,
            "SELECT * FROM t WHERE a = @P1 AND b = @P2"
        );
        assert_eq!(rewrite_placeholders(sql, PlaceholderStyle::Question, false).sql, sql);
    }

    #[test]
    fn test_literals_and_comments_are_skipped() {
        let sql = "SELECT '?', \"a?\", `b?` FROM t -- why?\nWHERE c = ? /* ? */ AND d = ?";
        let rewritten = rewrite_placeholders(sql, PlaceholderStyle::Dollar, false);
        assert_eq!(rewritten.placeholders, 2);
        assert_eq!(
            rewritten.sql,
            "SELECT '?', \"a?\", `b?` FROM t -- why?\nWHERE c = $1 /* ? */ AND d = $2"
        );
    }

    #[test]
    fn test_escaped_quote_inside_literal() {
        let sql = "SELECT 'it''s ?' FROM t WHERE a = ?";
        assert_eq!(count_placeholders(sql, false), 1);
        assert_eq!(count_placeholders(sql, true), 1);
    }

    #[test]
    fn test_backslash_escaped_quote() {
        let sql = r"SELECT 'it\'s ?' AS a, ? AS b";
        assert_eq!(count_placeholders(sql, true), 1);

        let rewritten = rewrite_placeholders(sql, PlaceholderStyle::Question, true);
        assert_eq!(rewritten.placeholders, 1);
        assert_eq!(rewritten.sql, sql);

        let sql = r#"SELECT "say \"?\"", 'a\\' FROM t WHERE c = ?"#;
        assert_eq!(count_placeholders(sql, true), 1);
        assert_eq!(
            substitute_params(sql, &[QueryParam::Int(3)], true),
            r#"SELECT "say \"?\"", 'a\\' FROM t WHERE c = 3"#
        );
    }

    #[test]
    fn test_backslash_is_literal_without_escapes() {
        // Standard SQL: the backslash is an ordinary character
        let sql = r"SELECT 'C:\' AS dir, ? AS b";
        assert_eq!(count_placeholders(sql, false), 1);
    }

    #[test]
    fn test_substitute_params_in_order() {
        let sql = "INSERT INTO t (a, b, c) VALUES (?, ?, ?)";
        let params = vec![
            QueryParam::Int(1),
            QueryParam::from("x'y"),
            QueryParam::Null,
        ];
        assert_eq!(
            substitute_params(sql, &params, false),
            "INSERT INTO t (a, b, c) VALUES (1, 'x''y', NULL)"
        );
        assert_eq!(
            substitute_params("SELECT ?, ?", &params[..1], false),
            "SELECT 1, ?"
        );
    }
}
