//! Redis-style glob matching for key patterns
//!
//! Supports `*`, `?`, `[abc]`, `[a-z]`, `[^x]` and `\` escapes, the same
//! subset `KEYS`/`SCAN MATCH` understand. `*` crosses `:` boundaries.

/// Whether `key` matches the glob `pattern`
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0usize, 0usize);
    // Backtrack point: pattern index after the last '*', key index it matched up to
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi + 1, ki));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ki += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&p, pi, k[ki]) {
                        if matched {
                            pi = next;
                            ki += 1;
                            continue;
                        }
                    } else if k[ki] == '[' {
                        // Unterminated class: literal '['
                        pi += 1;
                        ki += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == k[ki] {
                        pi += 2;
                        ki += 1;
                        continue;
                    }
                }
                c => {
                    if c == k[ki] {
                        pi += 1;
                        ki += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((sp, sk)) => {
                pi = sp;
                ki = sk + 1;
                star = Some((sp, sk + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match `c` against the class starting at `p[start] == '['`.
///
/// Returns (matched, index after the closing `]`), or None if unterminated.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        let lo = if p[i] == '\\' && i + 1 < p.len() {
            i += 1;
            p[i]
        } else {
            p[i]
        };

        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let hi = p[i + 2];
            let (a, b) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if c >= a && c <= b {
                matched = true;
            }
            i += 3;
        } else {
            if c == lo {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

/// Whether `pattern` contains glob metacharacters
pub fn is_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

// =============================================================================
// Tests
// =============================================================================
