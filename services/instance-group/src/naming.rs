//! Instance name generation.
//!
//! Names come from a template such as `runner-$random`. Placeholders are
//! written `$name` or `${name}`; `random` expands to a fresh token of
//! lowercase letters and any other placeholder expands to nothing.

use rand::Rng;

/// Length of the token substituted for `$random`.
pub const TOKEN_LEN: usize = 10;

const RANDOM_VAR: &str = "random";
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Produces instance names from a naming template.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    template: String,
}

impl NameGenerator {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the template contains a `random` placeholder.
    ///
    /// Without one every generated name is identical.
    pub fn has_random_placeholder(&self) -> bool {
        let mut found = false;
        expand(&self.template, |var| {
            if var == RANDOM_VAR {
                found = true;
            }
            String::new()
        });
        found
    }

    /// Generate a new name.
    pub fn generate(&self) -> String {
        expand(&self.template, |var| match var {
            RANDOM_VAR => random_token(TOKEN_LEN),
            _ => String::new(),
        })
    }
}

/// Random token of `len` lowercase ASCII letters.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Expand `$var` and `${var}` placeholders through `lookup`.
///
/// A `$` that does not start a placeholder is kept as is.
fn expand(template: &str, mut lookup: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]));
                rest = &braced[end + 1..];
                continue;
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len > 0 {
                out.push_str(&lookup(&after[..len]));
                rest = &after[len..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn is_token(s: &str) -> bool {
        s.len() == TOKEN_LEN && s.bytes().all(|b| b.is_ascii_lowercase())
    }

    #[test]
    fn test_generate_with_prefix() {
        let names = NameGenerator::new("w-$random");
        let name = names.generate();

        let token = name.strip_prefix("w-").unwrap();
        assert!(is_token(token), "unexpected name {name}");
    }

    #[test]
    fn test_generate_braced_placeholder() {
        let names = NameGenerator::new("ci-${random}-vm");
        let name = names.generate();

        let token = name
            .strip_prefix("ci-")
            .and_then(|s| s.strip_suffix("-vm"))
            .unwrap();
        assert!(is_token(token), "unexpected name {name}");
    }

    #[test]
    fn test_generated_names_differ() {
        let names = NameGenerator::new("runner-$random");
        assert_ne!(names.generate(), names.generate());
    }

    #[rstest]
    #[case("runner-$random", true)]
    #[case("${random}", true)]
    #[case("runner-$randomness", false)]
    #[case("runner-$host", false)]
    #[case("runner", false)]
    fn test_has_random_placeholder(#[case] template: &str, #[case] expected: bool) {
        assert_eq!(
            NameGenerator::new(template).has_random_placeholder(),
            expected
        );
    }

    #[rstest]
    #[case("a-$unknown-b", "a--b")]
    #[case("cost$", "cost$")]
    #[case("a$-b", "a$-b")]
    #[case("open${brace", "open${brace")]
    #[case("plain", "plain")]
    fn test_expand_without_random(#[case] template: &str, #[case] expected: &str) {
        assert_eq!(expand(template, |_| String::new()), expected);
    }

    #[test]
    fn test_random_token_alphabet() {
        for _ in 0..32 {
            assert!(is_token(&random_token(TOKEN_LEN)));
        }
    }
}
