//! Small SQL text helpers shared by the providers.

/// Whether a statement is expected to produce a row set.
///
/// Providers use this to choose between the row-returning and the
/// rows-affected execution paths; engines tolerate a wrong guess by
/// returning an empty row set or a zero count.
#[must_use]
pub(crate) fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(
        head.as_str(),
        "select" | "with" | "values" | "show" | "explain" | "pragma" | "describe"
    ) || sql.to_ascii_lowercase().contains(" returning ")
}

/// Rewrite `?` placeholders to `$1 .. $n` for engines that number their
/// parameters. Quoted literals, quoted identifiers, and line comments are
/// left untouched.
#[must_use]
pub(crate) fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut in_comment = false;
    let mut n = 0u32;
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_comment {
            out.push(ch);
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        if let Some(q) = quote {
            out.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                out.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                in_comment = true;
                out.push(ch);
            }
            '?' => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("SELECT 1", true)]
    #[case("  with x as (select 1) select * from x", true)]
    #[case("INSERT INTO t VALUES (1)", false)]
    #[case("insert into t values (1) returning id", true)]
    #[case("UPDATE t SET x = 1", false)]
    #[case("PRAGMA user_version", true)]
    fn row_detection(#[case] sql: &str, #[case] expected: bool) {
        assert_eq!(returns_rows(sql), expected);
    }

    #[rstest]
    #[case("SELECT * FROM t WHERE a = ? AND b = ?", "SELECT * FROM t WHERE a = $1 AND b = $2")]
    #[case("SELECT '?' , c FROM t WHERE x = ?", "SELECT '?' , c FROM t WHERE x = $1")]
    #[case("SELECT c -- is it ?\nFROM t WHERE x = ?", "SELECT c -- is it ?\nFROM t WHERE x = $1")]
    fn placeholder_numbering(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(number_placeholders(input), expected);
    }
}
