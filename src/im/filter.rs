//! Content Filter - dictionary-based, pluggable
//!
//! Three actions per matched word, checked in severity order:
//! Block stops the message, Replace masks the match with asterisks
//! preserving rune length, Audit passes it through with a log line.
//! Matching is case-folded over unicode scalars; a disabled filter
//! is a no-op.

use tracing::info;

use crate::config::FilterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Block,
    Replace,
    Audit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Nothing matched (or the filter is disabled)
    Clean,
    /// A block-listed word matched; the message must not route
    Blocked { word: String },
    /// Replace-listed words were masked; route the new content
    Replaced { content: String },
}

struct Entry {
    action: FilterAction,
    /// Case-folded scalars of the dictionary word
    folded: Vec<char>,
    original: String,
}

pub struct WordFilter {
    enabled: bool,
    entries: Vec<Entry>,
}

/// One-to-one case fold per scalar. Multi-char expansions keep their
/// first char so content indices stay aligned for replacement.
fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn fold_str(s: &str) -> Vec<char> {
    s.chars().map(fold).collect()
}

/// All start offsets of `needle` in `haystack`
fn find_all(haystack: &[char], needle: &[char]) -> Vec<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return Vec::new();
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| haystack[i..i + needle.len()] == *needle)
        .collect()
}

impl WordFilter {
    pub fn from_config(config: &FilterConfig) -> Self {
        let mut entries = Vec::new();
        // Severity order decides which action wins on overlap
        for (words, action) in [
            (&config.block_words, FilterAction::Block),
            (&config.replace_words, FilterAction::Replace),
            (&config.audit_words, FilterAction::Audit),
        ] {
            for word in words {
                if word.is_empty() {
                    continue;
                }
                entries.push(Entry {
                    action,
                    folded: fold_str(word),
                    original: word.clone(),
                });
            }
        }
        Self {
            enabled: config.enabled,
            entries,
        }
    }

    /// No-op filter
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            entries: Vec::new(),
        }
    }

    pub fn apply(&self, content: &str) -> FilterOutcome {
        if !self.enabled || self.entries.is_empty() || content.is_empty() {
            return FilterOutcome::Clean;
        }

        let folded = fold_str(content);
        let mut chars: Vec<char> = content.chars().collect();
        let mut replaced = false;
        let mut audited: Vec<&str> = Vec::new();

        for entry in &self.entries {
            let hits = find_all(&folded, &entry.folded);
            if hits.is_empty() {
                continue;
            }
            match entry.action {
                FilterAction::Block => {
                    return FilterOutcome::Blocked {
                        word: entry.original.clone(),
                    };
                }
                FilterAction::Replace => {
                    for start in hits {
                        for c in chars.iter_mut().skip(start).take(entry.folded.len()) {
                            *c = '*';
                        }
                    }
                    replaced = true;
                }
                FilterAction::Audit => audited.push(&entry.original),
            }
        }

        if !audited.is_empty() {
            info!(words = ?audited, "Content filter audit match");
        }
        if replaced {
            FilterOutcome::Replaced {
                content: chars.into_iter().collect(),
            }
        } else {
            FilterOutcome::Clean
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(block: &[&str], replace: &[&str], audit: &[&str]) -> WordFilter {
        WordFilter::from_config(&FilterConfig {
            enabled: true,
            block_words: block.iter().map(|s| s.to_string()).collect(),
            replace_words: replace.iter().map(|s| s.to_string()).collect(),
            audit_words: audit.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_disabled_is_noop() {
        let f = WordFilter::disabled();
        assert_eq!(f.apply("anything at all"), FilterOutcome::Clean);
    }

    #[test]
    fn test_block_wins() {
        let f = filter(&["bomb"], &["bomb"], &[]);
        assert_eq!(
            f.apply("a BOMB here"),
            FilterOutcome::Blocked {
                word: "bomb".into()
            }
        );
    }

    #[test]
    fn test_replace_preserves_rune_length() {
        let f = filter(&[], &["秘密"], &[]);
        match f.apply("这是秘密信息") {
            FilterOutcome::Replaced { content } => {
                assert_eq!(content, "这是**信息");
                assert_eq!(content.chars().count(), "这是秘密信息".chars().count());
            }
            other => panic!("expected Replaced, got {other:?}"),
        }
    }

    #[test]
    fn test_replace_case_insensitive_multiple() {
        let f = filter(&[], &["spam"], &[]);
        match f.apply("Spam and SPAM") {
            FilterOutcome::Replaced { content } => assert_eq!(content, "**** and ****"),
            other => panic!("expected Replaced, got {other:?}"),
        }
    }

    #[test]
    fn test_audit_passes_through() {
        let f = filter(&[], &[], &["watchword"]);
        assert_eq!(f.apply("contains watchword here"), FilterOutcome::Clean);
    }

    #[test]
    fn test_clean_content() {
        let f = filter(&["bad"], &["worse"], &[]);
        assert_eq!(f.apply("perfectly fine"), FilterOutcome::Clean);
    }
}
