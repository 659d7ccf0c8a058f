//! Text preparation and top-level scanning helpers
//!
//! The parser works on whitespace-normalized statement strings and
//! locates keywords with scans that skip anything inside balanced
//! parentheses or quoted strings; that one rule is what makes nested
//! subqueries parse correctly.

/// ASCII-uppercase copy; byte offsets stay aligned with the original.
pub fn ascii_upper(s: &str) -> String {
    s.chars().map(|c| c.to_ascii_uppercase()).collect()
}

/// Remove `--`, `#` and `/* */` comments outside string literals.
pub fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied().unwrap_or(0);
        if !in_single && !in_double {
            if b == b'-' && next == b'-' {
                i += 2;
                while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                    i += 1;
                }
                out.push(b' ');
                continue;
            }
            if b == b'#' {
                i += 1;
                while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                    i += 1;
                }
                out.push(b' ');
                continue;
            }
            if b == b'/' && next == b'*' {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                out.push(b' ');
                continue;
            }
        }
        if b == b'\'' && !in_double {
            in_single = !in_single;
        }
        if b == b'"' && !in_single {
            in_double = !in_double;
        }
        out.push(b);
        i += 1;
    }
    // Only whole ASCII-delimited runs were removed, so the remainder
    // is still valid UTF-8.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Collapse every whitespace run into a single space and trim.
pub fn normalize_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last_space = false;
    for c in sql.chars() {
        if c.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Split a script on `;` at top level (outside quotes), dropping empty
/// statements.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;
    let mut in_double = false;
    for c in script.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
        if c == ';' && !in_single && !in_double {
            if !cur.trim().is_empty() {
                out.push(cur.trim().to_string());
            }
            cur.clear();
        } else {
            cur.push(c);
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}

/// Split on a delimiter at top level: outside parentheses and quotes.
pub fn split_top_level(s: &str, delim: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    for c in s.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = (depth - 1).max(0),
            _ => {}
        }
        if c == delim && depth == 0 && !in_single && !in_double {
            out.push(cur.clone());
            cur.clear();
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Find a keyword at top level in an already-uppercased string,
/// skipping matches inside parentheses or quoted strings.
pub fn find_keyword_top_level(upper: &str, keyword: &str, start: usize) -> Option<usize> {
    let bytes = upper.as_bytes();
    let kw = keyword.as_bytes();
    if kw.is_empty() || kw.len() > bytes.len() {
        return None;
    }
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut i = 0;
    while i + kw.len() <= bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double && !in_backtick => in_single = !in_single,
            '"' if !in_single && !in_backtick => in_double = !in_double,
            '`' if !in_single && !in_double => in_backtick = !in_backtick,
            _ => {}
        }
        if !in_single && !in_double && !in_backtick {
            if c == '(' {
                depth += 1;
            } else if c == ')' {
                depth = (depth - 1).max(0);
            }
            if depth == 0 && i >= start && &bytes[i..i + kw.len()] == kw {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Position of the matching `)` for the `(` at `open`.
pub fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        let c = b as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
        if in_single || in_double {
            continue;
        }
        if c == '(' {
            depth += 1;
        } else if c == ')' {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Strip one layer of matching identifier quotes: backticks, double or
/// single quotes.
pub fn strip_ident_quotes(s: &str) -> &str {
    let s = s.trim();
    let b = s.as_bytes();
    if b.len() >= 2 {
        let (f, l) = (b[0], b[b.len() - 1]);
        if (f == b'`' && l == b'`') || (f == b'"' && l == b'"') || (f == b'\'' && l == b'\'') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Strip one layer of matching value quotes (single or double).
pub fn strip_value_quotes(s: &str) -> &str {
    let s = s.trim();
    let b = s.as_bytes();
    if b.len() >= 2 {
        let (f, l) = (b[0], b[b.len() - 1]);
        if (f == b'\'' && l == b'\'') || (f == b'"' && l == b'"') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Last top-level space in the string, for trailing-alias detection.
pub fn last_top_level_space(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    let mut found = None;
    for (i, c) in s.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = (depth - 1).max(0),
            ' ' if depth == 0 && !in_single && !in_double => found = Some(i),
            _ => {}
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments() {
        let sql = "SELECT a -- trailing\nFROM t /* block */ WHERE b = '#not a comment'";
        let out = strip_comments(sql);
        assert!(!out.contains("trailing"));
        assert!(!out.contains("block"));
        assert!(out.contains("'#not a comment'"));
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(
            normalize_whitespace("  SELECT \t *\n FROM   t "),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn test_split_statements_respects_quotes() {
        let parts = split_statements("INSERT INTO t VALUES('a;b'); SELECT * FROM t;");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "INSERT INTO t VALUES('a;b')");
    }

    #[test]
    fn test_split_top_level_ignores_nested_commas() {
        let parts = split_top_level("a, (b, c), 'd,e'", ',');
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].trim(), "(b, c)");
        assert_eq!(parts[2].trim(), "'d,e'");
    }

    #[test]
    fn test_find_keyword_skips_subqueries() {
        let sql = "SELECT * FROM (SELECT X FROM U WHERE Y = 1) S WHERE Z = 2";
        let upper = ascii_upper(sql);
        let pos = find_keyword_top_level(&upper, " WHERE ", 0).unwrap();
        assert_eq!(&sql[pos..pos + 7], " WHERE ");
        assert!(pos > sql.find(") S").unwrap());
    }

    #[test]
    fn test_find_keyword_skips_strings() {
        let upper = ascii_upper("SELECT * FROM T WHERE A = ' WHERE '");
        let pos = find_keyword_top_level(&upper, " WHERE ", 0).unwrap();
        assert_eq!(pos, 15);
        assert_eq!(find_keyword_top_level(&upper, " WHERE ", pos + 1), None);
    }

    #[test]
    fn test_matching_paren() {
        let s = "(a (b) 'c)' d) e";
        assert_eq!(matching_paren(s, 0), Some(13));
    }

    #[test]
    fn test_quote_stripping() {
        assert_eq!(strip_ident_quotes("`name`"), "name");
        assert_eq!(strip_ident_quotes("\"name\""), "name");
        assert_eq!(strip_value_quotes("'v'"), "v");
        assert_eq!(strip_value_quotes("plain"), "plain");
    }

    #[test]
    fn test_last_top_level_space() {
        assert_eq!(last_top_level_space("COUNT(a b)"), None);
        assert_eq!(last_top_level_space("COUNT(a b) cnt"), Some(10));
    }
}
