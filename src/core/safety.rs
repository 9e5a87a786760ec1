use crate::core::error::SagaError;

/// Keywords that must never start a top-level statement.
const BANNED: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "CREATE",
];

/// Keywords that can begin the body of a `WITH` statement.
const STATEMENT_STARTERS: &[&str] = &[
    "SELECT", "VALUES", "TABLE", "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE",
    "GRANT", "REVOKE", "CREATE",
];

/// Read-only gate for generated SQL. A statement passes only if its first
/// top-level keyword is `SELECT`, or `WITH` whose terminating statement is a
/// `SELECT`. Keywords inside string literals, comments, and subqueries do
/// not count; keywords at statement boundaries always do, including after a
/// `;` separator.
pub fn check_statement(sql: &str) -> Result<(), SagaError> {
    let cleaned = strip_literals_and_comments(sql);
    let mut checked_any = false;
    for statement in cleaned.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        checked_any = true;
        check_single(statement)?;
    }
    if !checked_any {
        return Err(SagaError::UnsafeStatement("empty statement".to_string()));
    }
    Ok(())
}

fn check_single(statement: &str) -> Result<(), SagaError> {
    let lead = leading_keyword(statement);
    match lead.as_str() {
        "SELECT" => Ok(()),
        "WITH" => match terminating_keyword(statement).as_deref() {
            Some("SELECT") => Ok(()),
            Some(other) => Err(SagaError::UnsafeStatement(format!(
                "WITH statement terminates in {other}"
            ))),
            None => Err(SagaError::UnsafeStatement(
                "WITH statement has no terminating SELECT".to_string(),
            )),
        },
        other if BANNED.contains(&other) => {
            Err(SagaError::UnsafeStatement(format!("{other} is not allowed")))
        }
        other => Err(SagaError::UnsafeStatement(format!(
            "statement must start with SELECT or WITH, got {other}"
        ))),
    }
}

fn leading_keyword(statement: &str) -> String {
    statement
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find(|w| !w.is_empty())
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// The first statement-starting keyword at parenthesis depth zero after the
/// leading `WITH` and its CTE definitions.
fn terminating_keyword(statement: &str) -> Option<String> {
    let mut depth: i32 = 0;
    let mut word = String::new();
    let mut seen_with = false;

    let mut flush = |word: &mut String, seen_with: &mut bool| -> Option<String> {
        if word.is_empty() {
            return None;
        }
        let token = word.to_ascii_uppercase();
        word.clear();
        if !*seen_with {
            *seen_with = true; // the leading WITH itself
            return None;
        }
        if STATEMENT_STARTERS.contains(&token.as_str()) {
            return Some(token);
        }
        None
    };

    for c in statement.chars() {
        match c {
            '(' => {
                if depth == 0 {
                    if let Some(found) = flush(&mut word, &mut seen_with) {
                        return Some(found);
                    }
                }
                depth += 1;
            }
            ')' => depth -= 1,
            _ if depth > 0 => {}
            _ if c.is_ascii_alphanumeric() || c == '_' => word.push(c),
            _ => {
                if let Some(found) = flush(&mut word, &mut seen_with) {
                    return Some(found);
                }
            }
        }
    }
    flush(&mut word, &mut seen_with)
}

/// Blank out string literals, quoted identifiers, and comments so keyword
/// scanning only ever sees structural SQL.
fn strip_literals_and_comments(sql: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
        Line,
        Block,
        Dollar,
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = State::Normal;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Normal => match (c, next) {
                ('\'', _) => {
                    state = State::Single;
                    out.push(' ');
                }
                ('"', _) => {
                    state = State::Double;
                    out.push(' ');
                }
                ('-', Some('-')) => {
                    state = State::Line;
                    i += 1;
                }
                ('/', Some('*')) => {
                    state = State::Block;
                    i += 1;
                }
                ('$', Some('$')) => {
                    state = State::Dollar;
                    i += 1;
                    out.push(' ');
                }
                _ => out.push(c),
            },
            State::Single => {
                if c == '\'' {
                    if next == Some('\'') {
                        i += 1; // escaped quote, stay inside the literal
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Double => {
                if c == '"' {
                    state = State::Normal;
                }
            }
            State::Line => {
                if c == '\n' {
                    state = State::Normal;
                    out.push('\n');
                }
            }
            State::Block => {
                if c == '*' && next == Some('/') {
                    state = State::Normal;
                    i += 1;
                }
            }
            State::Dollar => {
                if c == '$' && next == Some('$') {
                    state = State::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(sql: &str) -> bool {
        check_statement(sql).is_err()
    }

    #[test]
    fn plain_select_passes() {
        assert!(check_statement("SELECT * FROM orders LIMIT 5").is_ok());
        assert!(check_statement("select id from orders").is_ok());
    }

    #[test]
    fn with_select_passes() {
        assert!(check_statement(
            "WITH totals AS (SELECT customer, SUM(amount) AS t FROM orders GROUP BY customer) \
             SELECT * FROM totals ORDER BY t DESC"
        )
        .is_ok());
    }

    #[test]
    fn with_chained_ctes_pass() {
        assert!(check_statement(
            "WITH a AS (SELECT 1), b AS (SELECT 2) SELECT * FROM a JOIN b ON true"
        )
        .is_ok());
    }

    #[test]
    fn mutating_statements_are_rejected() {
        for sql in [
            "DELETE FROM orders",
            "INSERT INTO orders VALUES (1)",
            "UPDATE orders SET total = 0",
            "DROP TABLE orders",
            "ALTER TABLE orders ADD COLUMN x INT",
            "TRUNCATE orders",
            "GRANT ALL ON orders TO public",
            "REVOKE ALL ON orders FROM public",
            "CREATE TABLE copy AS SELECT * FROM orders",
        ] {
            assert!(rejected(sql), "should reject: {sql}");
        }
    }

    #[test]
    fn with_terminating_in_a_write_is_rejected() {
        assert!(rejected(
            "WITH doomed AS (SELECT id FROM orders) DELETE FROM orders WHERE id IN (SELECT id FROM doomed)"
        ));
        assert!(rejected("WITH t AS (SELECT 1) INSERT INTO log SELECT * FROM t"));
    }

    #[test]
    fn trailing_statement_after_semicolon_is_checked() {
        assert!(rejected("SELECT 1; DROP TABLE orders"));
        assert!(check_statement("SELECT 1; SELECT 2").is_ok());
    }

    #[test]
    fn keywords_inside_literals_do_not_count() {
        assert!(check_statement("SELECT 'DELETE FROM orders' AS warning").is_ok());
        assert!(check_statement("SELECT * FROM logs WHERE note = 'DROP TABLE x'").is_ok());
        assert!(check_statement("SELECT 'it''s a DELETE' AS quoted").is_ok());
    }

    #[test]
    fn keywords_inside_comments_do_not_count() {
        assert!(check_statement("SELECT 1 -- DROP TABLE orders").is_ok());
        assert!(check_statement("SELECT /* TRUNCATE orders */ 1").is_ok());
    }

    #[test]
    fn subqueries_stay_read_only() {
        assert!(check_statement(
            "SELECT * FROM (SELECT customer FROM orders) AS sub"
        )
        .is_ok());
    }

    #[test]
    fn banned_identifier_substrings_are_fine() {
        assert!(check_statement("SELECT created_at, updated_at FROM orders").is_ok());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(rejected(""));
        assert!(rejected("   ;  "));
    }

    #[test]
    fn non_sql_text_is_rejected() {
        assert!(rejected("EXPLAIN ANALYZE SELECT 1"));
        assert!(rejected("here is your query"));
    }
}
