//! Custom comparison rules a problem can opt into via `"checker"` in its
//! `data.json`. A checker can only turn a would-be Wrong Answer into an
//! Accepted; it never rejects an exact match.

use std::fmt::Debug;
use std::sync::Arc;

pub trait Checker: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Both sides arrive already normalized
    fn check(&self, actual: &str, expected: &str) -> bool;
}

/// Same multiset of numbers, any order
#[derive(Debug, Clone, Copy, Default)]
pub struct UnorderedNumbers;

/// Same whitespace-separated tokens, ignoring spacing and line breaks
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenMatch;

/// Token-wise comparison, numeric tokens equal within `epsilon`
#[derive(Debug, Clone, Copy)]
pub struct FloatTolerance {
    pub epsilon: f64,
}

fn numbers(text: &str) -> Option<Vec<f64>> {
    text.split_whitespace()
        .map(|token| token.parse::<f64>().ok())
        .collect()
}

impl Checker for UnorderedNumbers {
    fn name(&self) -> &str {
        "unordered-numbers"
    }

    fn check(&self, actual: &str, expected: &str) -> bool {
        let (Some(mut actual), Some(mut expected)) = (numbers(actual), numbers(expected)) else {
            return false;
        };
        if actual.len() != expected.len() {
            return false;
        }
        actual.sort_by(f64::total_cmp);
        expected.sort_by(f64::total_cmp);
        actual == expected
    }
}

impl Checker for TokenMatch {
    fn name(&self) -> &str {
        "tokens"
    }

    fn check(&self, actual: &str, expected: &str) -> bool {
        actual.split_whitespace().eq(expected.split_whitespace())
    }
}

impl Checker for FloatTolerance {
    fn name(&self) -> &str {
        "float"
    }

    fn check(&self, actual: &str, expected: &str) -> bool {
        let actual: Vec<_> = actual.split_whitespace().collect();
        let expected: Vec<_> = expected.split_whitespace().collect();
        if actual.len() != expected.len() {
            return false;
        }
        actual.iter().zip(&expected).all(|(a, e)| {
            if a == e {
                return true;
            }
            match (a.parse::<f64>(), e.parse::<f64>()) {
                (Ok(a), Ok(e)) => (a - e).abs() <= self.epsilon,
                _ => false,
            }
        })
    }
}

/// Resolves a checker named in problem metadata
///
/// Recognised: `unordered-numbers`, `tokens`, `float` (1e-6) and `float:<eps>`.
pub fn builtin(name: &str) -> Option<Arc<dyn Checker>> {
    let name = name.trim();
    match name {
        "unordered-numbers" => Some(Arc::new(UnorderedNumbers)),
        "tokens" => Some(Arc::new(TokenMatch)),
        "float" => Some(Arc::new(FloatTolerance { epsilon: 1e-6 })),
        _ => {
            let epsilon = name.strip_prefix("float:")?.parse::<f64>().ok()?;
            (epsilon.is_finite() && epsilon >= 0.0)
                .then(|| Arc::new(FloatTolerance { epsilon }) as Arc<dyn Checker>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unordered_numbers() {
        let checker = UnorderedNumbers;
        assert!(checker.check("3 1 2", "1 2 3"));
        assert!(checker.check("1\n2\n3", "3 2 1"));
        assert!(!checker.check("1 2", "1 2 3"));
        assert!(!checker.check("1 2 x", "1 2 x"));
        assert!(!checker.check("1 1 2", "1 2 2"));
    }

    #[test]
    fn test_token_match_ignores_layout() {
        assert!(TokenMatch.check("a  b\nc", "a b c"));
        assert!(!TokenMatch.check("a b", "b a"));
    }

    #[test]
    fn test_float_tolerance() {
        let checker = FloatTolerance { epsilon: 1e-3 };
        assert!(checker.check("0.3333", "0.333333"));
        assert!(checker.check("yes 1.0", "yes 1.0004"));
        assert!(!checker.check("0.3", "0.34"));
        assert!(!checker.check("no 1.0", "yes 1.0"));
    }

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(builtin("tokens").unwrap().name(), "tokens");
        assert_eq!(builtin(" unordered-numbers ").unwrap().name(), "unordered-numbers");
        assert!(builtin("float:0.01").unwrap().check("1.005", "1.0"));
        assert!(builtin("float:-1").is_none());
        assert!(builtin("float:abc").is_none());
        assert!(builtin("diff").is_none());
    }
}
