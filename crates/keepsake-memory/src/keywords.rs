//! Keyword extraction shared by writers (tags), the relation builder and the
//! retrieval engine.
//!
//! Tokens are maximal runs of alphanumeric characters. CJK ideographs count
//! as alphanumeric, so an unsegmented Chinese phrase becomes one token. A
//! token survives when it is longer than one character and is not a
//! stopword. ASCII letters are lower-cased; SQLite's `LIKE` is
//! case-insensitive for ASCII anyway, so tags and queries stay comparable.

/// Maximum number of keywords returned by [`extract_keywords`].
pub const MAX_KEYWORDS: usize = 10;
/// Maximum number of tags persisted with a record.
pub const MAX_TAGS: usize = 5;
/// Maximum number of keywords used for a store lookup.
pub const MAX_QUERY_KEYWORDS: usize = 3;

const STOPWORDS: &[&str] = &[
    // Chinese function words and pronouns
    "我们", "你们", "他们", "她们", "它们", "这个", "那个", "这些", "那些", "什么", "怎么", "为什么",
    "因为", "所以", "但是", "就是", "还是", "可以", "没有", "不是", "一个", "已经", "然后", "如果",
    "的", "了", "和", "是", "在", "我", "你", "他", "她", "它", "这", "那", "有", "就", "都", "也",
    "还", "但", "而", "吗",
    // English
    "the", "and", "is", "are", "was", "were", "be", "been", "am", "im", "it", "its", "to", "of",
    "in", "on", "at", "for", "with", "that", "this", "these", "those", "what", "how", "why",
    "me", "my", "we", "our", "you", "your", "he", "she", "they", "them", "his", "her", "do",
    "did", "does", "as", "an", "or", "so", "but", "not", "just", "have", "has", "had", "will",
    "can", "too", "very", "there", "then", "than", "from", "about", "if", "would", "should",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Split `text` into candidate tokens, in order, with duplicates kept.
pub fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else {
            push_token(&mut out, &mut current);
        }
    }
    push_token(&mut out, &mut current);
    out
}

fn push_token(out: &mut Vec<String>, current: &mut String) {
    if current.chars().count() > 1 && !is_stopword(current) {
        out.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Distinct keywords of `text` in first-seen order, at most [`MAX_KEYWORDS`].
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in tokens(text) {
        if !seen.contains(&token) {
            seen.push(token);
            if seen.len() == MAX_KEYWORDS {
                break;
            }
        }
    }
    seen
}

/// Tags to persist with a record whose content flattens to `text`.
pub fn tags_for(text: &str) -> Vec<String> {
    let mut keywords = extract_keywords(text);
    keywords.truncate(MAX_TAGS);
    keywords
}

/// Keywords to use when looking up memories related to `query`.
pub fn query_keywords(query: &str) -> Vec<String> {
    let mut keywords = extract_keywords(query);
    keywords.truncate(MAX_QUERY_KEYWORDS);
    keywords
}
