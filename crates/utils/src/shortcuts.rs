//! Detection of `[name]` project shortcut tokens in free text

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SHORTCUT_REGEX: Regex =
        Regex::new(r"\[(\w+)\]").expect("shortcut pattern is a valid regex");
}

/// Every distinct shortcut in `text`, bracketed, in order of first appearance
pub fn detect_shortcuts(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in SHORTCUT_REGEX.captures_iter(text) {
        let token = format!("[{}]", &caps[1]);
        if !found.contains(&token) {
            found.push(token);
        }
    }
    found
}

/// `text` with every shortcut token removed and whitespace collapsed
pub fn strip_shortcuts(text: &str) -> String {
    SHORTCUT_REGEX
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_in_order_without_duplicates() {
        let found = detect_shortcuts("[tech] fix login, then sync [techzip] and [tech] again");
        assert_eq!(found, vec!["[tech]", "[techzip]"]);
    }

    #[test]
    fn test_ignores_non_word_tokens() {
        assert!(detect_shortcuts("see [a b] and [] and [x-y]").is_empty());
        assert_eq!(detect_shortcuts("[web_app]"), vec!["[web_app]"]);
    }

    #[test]
    fn test_strip() {
        assert_eq!(strip_shortcuts("[tech]  add   tests"), "add tests");
    }
}
