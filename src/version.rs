// src/version.rs

//! Version ordering for package versions
//!
//! Package versions are not semver. A version string is split into a
//! sequence of numeric and alphabetic tokens; any other character only
//! separates tokens. Two versions compare token by token:
//!
//! - numeric tokens compare numerically ("1.9" < "1.10")
//! - alphabetic tokens compare lexically ("1.0a" < "1.0b")
//! - a numeric token sorts above an alphabetic one
//! - the shorter sequence is padded with zeros ("1.0" == "1")
//!
//! The same ordering is used for `version` and `package_version`.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Digits with leading zeros stripped
    Numeric(String),
    Alpha(String),
}

impl Token {
    fn zero() -> Self {
        Token::Numeric(String::new())
    }

    fn compare(&self, other: &Token) -> Ordering {
        match (self, other) {
            (Token::Numeric(a), Token::Numeric(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Token::Alpha(a), Token::Alpha(b)) => a.cmp(b),
            (Token::Numeric(_), Token::Alpha(_)) => Ordering::Greater,
            (Token::Alpha(_), Token::Numeric(_)) => Ordering::Less,
        }
    }
}

/// A parsed, comparable version string
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    tokens: Vec<Token>,
}

impl Version {
    /// Tokenize a version string. Never fails; unusual characters act as separators.
    pub fn new(raw: &str) -> Self {
        let mut tokens = Vec::new();
        let mut chars = raw.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                tokens.push(Token::Numeric(digits.trim_start_matches('0').to_string()));
            } else if c.is_alphabetic() {
                let mut word = String::new();
                while let Some(&a) = chars.peek() {
                    if !a.is_alphabetic() {
                        break;
                    }
                    word.push(a);
                    chars.next();
                }
                tokens.push(Token::Alpha(word));
            } else {
                chars.next();
            }
        }

        Self {
            raw: raw.to_string(),
            tokens,
        }
    }

    /// The original string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Compare two versions token by token
    pub fn compare(&self, other: &Version) -> Ordering {
        let len = self.tokens.len().max(other.tokens.len());
        let zero = Token::zero();

        for i in 0..len {
            let a = self.tokens.get(i).unwrap_or(&zero);
            let b = other.tokens.get(i).unwrap_or(&zero);
            match a.compare(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        Ordering::Equal
    }
}

/// Compare two version strings
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::new(a).compare(&Version::new(b))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_compare_numerically() {
        assert!(Version::new("1.9") < Version::new("1.10"));
        assert!(Version::new("2.0") > Version::new("1.99"));
        assert!(Version::new("10") > Version::new("9"));
    }

    #[test]
    fn test_padding_with_zero() {
        assert_eq!(Version::new("1.0"), Version::new("1"));
        assert_eq!(Version::new("1.0.0"), Version::new("1"));
        assert!(Version::new("1.0.1") > Version::new("1"));
    }

    #[test]
    fn test_leading_zeros_ignored() {
        assert_eq!(Version::new("1.01"), Version::new("1.1"));
        assert!(Version::new("1.010") > Version::new("1.9"));
    }

    #[test]
    fn test_alpha_segments() {
        assert!(Version::new("1.0a") < Version::new("1.0b"));
        assert!(Version::new("1.0beta") < Version::new("1.0"));
        assert!(Version::new("1.0rc1") < Version::new("1.0.1"));
        assert!(Version::new("1.a") < Version::new("1.1"));
    }

    #[test]
    fn test_separators_are_interchangeable() {
        assert_eq!(Version::new("1.2-3"), Version::new("1.2.3"));
        assert_eq!(Version::new("1_2"), Version::new("1.2"));
    }

    #[test]
    fn test_large_numbers() {
        assert!(Version::new("20240101000000000001") > Version::new("20240101000000000000"));
    }

    #[test]
    fn test_compare_helper() {
        assert_eq!(compare("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare("3", "3.0"), Ordering::Equal);
    }

    #[test]
    fn test_display_keeps_raw() {
        assert_eq!(Version::new("1.0-rc1").to_string(), "1.0-rc1");
    }
}
