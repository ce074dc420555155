//! Pattern content anonymization.
//!
//! Rewrites raw pattern content before it leaves the replica: identifiers
//! become `var_N`, string literals become `str_K`, numbers collapse to `0`,
//! file paths become `/path/to/file`, comments are stripped, and custom
//! regexes redact whatever the operator configures. Replacements are
//! consistent within one pattern (the first occurrence fixes the token) and
//! the full original-to-replacement mapping is reported for debugging but
//! never shipped.

use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Which transformations apply.
#[derive(Debug, Clone)]
pub struct AnonymizerConfig {
    pub replace_identifiers: bool,
    pub replace_string_literals: bool,
    pub replace_numbers: bool,
    pub replace_file_paths: bool,
    pub remove_comments: bool,
    /// Keep `${…}` placeholders inside template strings.
    pub preserve_structure: bool,
    /// Additional regexes whose matches become `[REDACTED]`.
    pub custom_patterns: Vec<String>,
    /// Identifiers never rewritten: language keywords, common standard
    /// types, testing primitives.
    pub reserved_keywords: HashSet<String>,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            replace_identifiers: true,
            replace_string_literals: true,
            replace_numbers: true,
            replace_file_paths: true,
            remove_comments: true,
            preserve_structure: true,
            custom_patterns: Vec::new(),
            reserved_keywords: default_reserved_keywords(),
        }
    }
}

/// The default reserved-keyword set: JS/TS, Rust, and Python keywords,
/// common standard types, and testing primitives.
pub fn default_reserved_keywords() -> HashSet<String> {
    const WORDS: &[&str] = &[
        // JS/TS keywords
        "function", "const", "let", "var", "return", "if", "else", "for", "while", "do",
        "switch", "case", "break", "continue", "new", "delete", "typeof", "instanceof", "this",
        "class", "extends", "super", "import", "export", "default", "async", "await", "try",
        "catch", "finally", "throw", "yield", "static", "get", "set", "of", "in", "null",
        "undefined", "true", "false", "void",
        // Rust keywords
        "fn", "mut", "impl", "pub", "use", "mod", "struct", "enum", "trait", "match", "loop",
        "ref", "self", "Self", "crate", "where", "dyn", "move", "unsafe",
        // Python keywords
        "def", "lambda", "None", "True", "False", "not", "and", "or", "elif", "pass", "with",
        "as", "global", "is", "raise", "from",
        // common standard types and members
        "string", "String", "number", "Number", "boolean", "Boolean", "int", "float", "bool",
        "Object", "object", "Array", "Vec", "Map", "Set", "Promise", "Error", "Option",
        "Result", "JSON", "Math", "console", "length", "push", "pop", "map", "filter",
        "reduce", "forEach", "slice", "split", "join", "keys", "values",
        // testing primitives
        "describe", "it", "test", "expect", "assert", "beforeEach", "afterEach", "beforeAll",
        "afterAll", "mock", "jest", "spyOn", "toBe", "toEqual", "toThrow", "assert_eq",
    ];
    WORDS.iter().map(|w| w.to_string()).collect()
}

/// Per-category replacement counts plus the replacement mapping.
#[derive(Debug, Clone, Default)]
pub struct AnonymizationReport {
    pub identifiers: usize,
    pub strings: usize,
    pub numbers: usize,
    pub paths: usize,
    pub comments: usize,
    pub custom: usize,
    /// Original text to replacement token, for debugging only.
    pub mapping: HashMap<String, String>,
}

struct CompiledRegexes {
    line_comment: Regex,
    block_comment: Regex,
    quoted_path: Regex,
    double_quoted: Regex,
    single_quoted: Regex,
    template: Regex,
    placeholder: Regex,
    any_quoted: Regex,
    number: Regex,
    identifier: Regex,
}

impl CompiledRegexes {
    fn compile() -> Self {
        Self {
            line_comment: Regex::new(r"//[^\n]*").expect("static regex"),
            block_comment: Regex::new(r"(?s)/\*.*?\*/").expect("static regex"),
            quoted_path: Regex::new(r#"["'](?:/[A-Za-z0-9_.\-]+){2,}/?["']"#)
                .expect("static regex"),
            double_quoted: Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("static regex"),
            single_quoted: Regex::new(r"'(?:[^'\\]|\\.)*'").expect("static regex"),
            template: Regex::new(r"`(?:[^`\\]|\\.)*`").expect("static regex"),
            placeholder: Regex::new(r"\$\{[^}]*\}").expect("static regex"),
            any_quoted: Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|`(?:[^`\\]|\\.)*`"#)
                .expect("static regex"),
            number: Regex::new(r"\b\d+(?:\.\d+)?\b").expect("static regex"),
            identifier: Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("static regex"),
        }
    }
}

/// Content anonymizer with compiled transformation regexes.
pub struct Anonymizer {
    config: AnonymizerConfig,
    regexes: CompiledRegexes,
}

impl Anonymizer {
    /// Build an anonymizer for the given configuration.
    pub fn new(config: AnonymizerConfig) -> Self {
        Self {
            config,
            regexes: CompiledRegexes::compile(),
        }
    }

    /// Rewrite `raw` under the configured transformations.
    pub fn anonymize(&self, raw: &str) -> (String, AnonymizationReport) {
        let mut report = AnonymizationReport::default();
        let mut text = raw.to_string();

        if self.config.remove_comments {
            text = self.strip_comments(&text, &mut report);
        }
        if self.config.replace_file_paths {
            text = self.replace_paths(&text, &mut report);
        }
        if self.config.replace_string_literals {
            text = self.replace_strings(&text, &mut report);
        }
        if self.config.replace_numbers || self.config.replace_identifiers {
            text = self.rewrite_code_segments(&text, &mut report);
        }
        for pattern in &self.config.custom_patterns {
            match Regex::new(pattern) {
                Ok(re) => {
                    report.custom += re.find_iter(&text).count();
                    text = re.replace_all(&text, "[REDACTED]").into_owned();
                }
                Err(e) => log::warn!("skipping invalid custom pattern '{pattern}': {e}"),
            }
        }

        (text, report)
    }

    fn strip_comments(&self, text: &str, report: &mut AnonymizationReport) -> String {
        report.comments += self.regexes.block_comment.find_iter(text).count();
        let text = self.regexes.block_comment.replace_all(text, " ");
        report.comments += self.regexes.line_comment.find_iter(&text).count();
        self.regexes.line_comment.replace_all(&text, "").into_owned()
    }

    fn replace_paths(&self, text: &str, report: &mut AnonymizationReport) -> String {
        report.paths += self.regexes.quoted_path.find_iter(text).count();
        self.regexes
            .quoted_path
            .replace_all(text, "\"/path/to/file\"")
            .into_owned()
    }

    fn string_token(
        &self,
        literal: &str,
        counter: &mut usize,
        report: &mut AnonymizationReport,
    ) -> String {
        if let Some(existing) = report.mapping.get(literal) {
            return existing.clone();
        }
        *counter += 1;
        let token = format!("str_{counter}");
        report.mapping.insert(literal.to_string(), token.clone());
        token
    }

    fn replace_strings(&self, text: &str, report: &mut AnonymizationReport) -> String {
        let mut counter = report
            .mapping
            .values()
            .filter(|v| v.starts_with("str_"))
            .count();

        let text = self.regexes.double_quoted.replace_all(text, |caps: &regex::Captures| {
            report.strings += 1;
            let inner = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            // already-rewritten path tokens stay as they are
            if inner == "\"/path/to/file\"" {
                report.strings -= 1;
                return inner.to_string();
            }
            format!("\"{}\"", self.string_token(inner, &mut counter, report))
        });

        let text = self.regexes.single_quoted.replace_all(&text, |caps: &regex::Captures| {
            report.strings += 1;
            let inner = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            format!("'{}'", self.string_token(inner, &mut counter, report))
        });

        let text = self.regexes.template.replace_all(&text, |caps: &regex::Captures| {
            report.strings += 1;
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if !self.config.preserve_structure {
                return format!("`{}`", self.string_token(whole, &mut counter, report));
            }
            // keep ${…} placeholders, tokenize the literal chunks around them
            let inner = &whole[1..whole.len() - 1];
            let mut rebuilt = String::from("`");
            let mut last = 0;
            for m in self.regexes.placeholder.find_iter(inner) {
                let chunk = &inner[last..m.start()];
                if !chunk.is_empty() {
                    rebuilt.push_str(&self.string_token(chunk, &mut counter, report));
                }
                rebuilt.push_str(m.as_str());
                last = m.end();
            }
            let tail = &inner[last..];
            if !tail.is_empty() {
                rebuilt.push_str(&self.string_token(tail, &mut counter, report));
            }
            rebuilt.push('`');
            rebuilt
        });

        text.into_owned()
    }

    /// Apply number and identifier rewrites to the stretches of text that
    /// are not inside a quoted literal.
    fn rewrite_code_segments(&self, text: &str, report: &mut AnonymizationReport) -> String {
        let mut var_counter = report
            .mapping
            .values()
            .filter(|v| v.starts_with("var_"))
            .count();

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in self.regexes.any_quoted.find_iter(text) {
            out.push_str(&self.rewrite_chunk(&text[last..m.start()], &mut var_counter, report));
            out.push_str(m.as_str());
            last = m.end();
        }
        out.push_str(&self.rewrite_chunk(&text[last..], &mut var_counter, report));
        out
    }

    fn rewrite_chunk(
        &self,
        chunk: &str,
        var_counter: &mut usize,
        report: &mut AnonymizationReport,
    ) -> String {
        let mut result = std::borrow::Cow::Borrowed(chunk);

        if self.config.replace_numbers {
            let count = self
                .regexes
                .number
                .find_iter(&result)
                .filter(|m| m.as_str() != "0")
                .count();
            report.numbers += count;
            result = std::borrow::Cow::Owned(
                self.regexes.number.replace_all(&result, "0").into_owned(),
            );
        }

        if self.config.replace_identifiers {
            let rewritten =
                self.regexes
                    .identifier
                    .replace_all(&result, |caps: &regex::Captures| {
                        let word = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                        if word.len() <= 2
                            || self.config.reserved_keywords.contains(word)
                            || is_replacement_token(word)
                        {
                            return word.to_string();
                        }
                        report.identifiers += 1;
                        if let Some(existing) = report.mapping.get(word) {
                            return existing.clone();
                        }
                        *var_counter += 1;
                        let token = format!("var_{var_counter}");
                        report.mapping.insert(word.to_string(), token.clone());
                        token
                    });
            result = std::borrow::Cow::Owned(rewritten.into_owned());
        }

        result.into_owned()
    }
}

fn is_replacement_token(word: &str) -> bool {
    for prefix in ["var_", "str_"] {
        if let Some(rest) = word.strip_prefix(prefix) {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymizer() -> Anonymizer {
        Anonymizer::new(AnonymizerConfig::default())
    }

    #[test]
    fn test_identifiers_replaced_consistently() {
        let raw = "function computeScore(userName, password123) { const MAGIC = 42; return userName.length; }";
        let (out, report) = anonymizer().anonymize(raw);

        assert_eq!(
            out,
            "function var_1(var_2, var_3) { const var_4 = 0; return var_2.length; }"
        );
        // userName appears twice but maps to one token
        assert_eq!(report.mapping.get("userName"), Some(&"var_2".to_string()));
        assert_eq!(report.identifiers, 5);
        assert_eq!(report.numbers, 1);
    }

    #[test]
    fn test_keywords_and_short_names_survive() {
        let raw = "for (let i = 0; i < max; i++) { return i; }";
        let (out, _) = anonymizer().anonymize(raw);
        assert!(out.contains("for"));
        assert!(out.contains("let"));
        assert!(out.contains("return"));
        assert!(out.contains('i'));
        assert!(!out.contains("max"));
    }

    #[test]
    fn test_string_literals_become_tokens() {
        let raw = r#"login("admin", "admin");"#;
        let (out, report) = anonymizer().anonymize(raw);
        // same literal gets the same token
        assert_eq!(out, r#"var_1("str_1", "str_1");"#);
        assert_eq!(report.strings, 2);
    }

    #[test]
    fn test_template_placeholders_preserved() {
        let raw = "const msg = `Hello ${name}!`;";
        let (out, _) = anonymizer().anonymize(raw);
        assert!(out.contains("${name}"), "placeholder lost: {out}");
        assert!(out.contains("str_"));
    }

    #[test]
    fn test_paths_rewritten() {
        let raw = r#"readFile("/home/alice/secrets.txt")"#;
        let (out, report) = anonymizer().anonymize(raw);
        assert!(out.contains("\"/path/to/file\""));
        assert!(!out.contains("alice"));
        assert_eq!(report.paths, 1);
    }

    #[test]
    fn test_comments_stripped() {
        let raw = "let x = 1; // secret note\n/* block\ncomment */ let y = 2;";
        let (out, report) = anonymizer().anonymize(raw);
        assert!(!out.contains("secret"));
        assert!(!out.contains("block"));
        assert_eq!(report.comments, 2);
    }

    #[test]
    fn test_identifiers_inside_strings_untouched() {
        let config = AnonymizerConfig {
            replace_string_literals: false,
            ..AnonymizerConfig::default()
        };
        let raw = r#"check("internalHostname", retryCount)"#;
        let (out, _) = Anonymizer::new(config).anonymize(raw);
        assert!(out.contains("\"internalHostname\""));
        assert!(!out.contains("retryCount"));
    }

    #[test]
    fn test_custom_patterns_redact() {
        let config = AnonymizerConfig {
            replace_identifiers: false,
            replace_string_literals: false,
            custom_patterns: vec![r"secret-\w+".to_string()],
            ..AnonymizerConfig::default()
        };
        let raw = "token = secret-abc123x";
        let (out, report) = Anonymizer::new(config).anonymize(raw);
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("secret-abc"));
        assert_eq!(report.custom, 1);
    }

    #[test]
    fn test_numbers_collapse_to_zero() {
        let config = AnonymizerConfig {
            replace_identifiers: false,
            ..AnonymizerConfig::default()
        };
        let raw = "retry(3, 1500, 0.25)";
        let (out, report) = Anonymizer::new(config).anonymize(raw);
        assert_eq!(out, "retry(0, 0, 0)");
        assert_eq!(report.numbers, 3);
    }
}
