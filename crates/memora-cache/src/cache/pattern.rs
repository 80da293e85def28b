//! Glob matching compatible with the subset of Redis `MATCH` syntax the
//! query cache emits: `*`, `?` and `\` escapes.

/// Returns true when `key` matches the glob `pattern`.
#[must_use]
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    // Position after the last `*` and the key index it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p + 1, k));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                k += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == key[k] => {
                p += 2;
                k += 1;
                continue;
            }
            Some(&c) if c != '\\' && c == key[k] => {
                p += 1;
                k += 1;
                continue;
            }
            _ => {}
        }

        match backtrack {
            Some((star_p, star_k)) => {
                p = star_p;
                k = star_k + 1;
                backtrack = Some((star_p, star_k + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Escapes glob metacharacters so `literal` matches only itself.
#[must_use]
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        assert!(glob_match("memora:Ticket:abc", "memora:Ticket:abc"));
        assert!(!glob_match("memora:Ticket:abc", "memora:Ticket:abd"));
        assert!(!glob_match("memora:Ticket", "memora:Ticket:abc"));
    }

    #[test]
    fn test_star() {
        assert!(glob_match("memora:Ticket:*", "memora:Ticket:abc"));
        assert!(glob_match("memora:Ticket:*", "memora:Ticket:"));
        assert!(!glob_match("memora:Ticket:*", "memora:Site:abc"));
        assert!(glob_match("*", ""));
        assert!(glob_match("memora:*:T123:*", "memora:Ticket:T123:status"));
        assert!(!glob_match("memora:*:T123:*", "memora:Ticket:abc"));
    }

    #[test]
    fn test_star_backtracks() {
        assert!(glob_match("a*b*c", "axxbyybzc"));
        assert!(glob_match("*:x", "a:b:x"));
        assert!(!glob_match("a*b", "axxbyy"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("key?", "key1"));
        assert!(!glob_match("key?", "key"));
        assert!(!glob_match("key?", "key12"));
    }

    #[test]
    fn test_escape() {
        let pattern = format!("{}*", escape("a*b"));
        assert!(glob_match(&pattern, "a*bcd"));
        assert!(!glob_match(&pattern, "axbcd"));
    }
}
