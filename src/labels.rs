//! Label normalization for Chinese financial line-item labels.

const OPEN_BRACKETS: &[char] = &['(', '（', '[', '【', '{', '〔', '［'];
const CLOSE_BRACKETS: &[char] = &[')', '）', ']', '】', '}', '〕', '］'];
const QUOTES: &[char] = &[
    '"', '\'', '“', '”', '‘', '’', '「', '」', '『', '』', '《', '》', '〈', '〉',
];
const PUNCTUATION: &[char] = &[
    ',', '，', '.', '。', '、', ':', '：', ';', '；', '!', '！', '?', '？', '-', '－', '—', '–', '_',
    '/', '／', '\\', '·', '•', '*', '＊', '#', '＃', '~', '～', '…',
];
const UNIT_WORDS: &[&str] = &["万元", "万", "元"];

/// Reduces a raw label to its comparison form.
///
/// Lowercases, drops bracketed asides with their content (nesting aware), quote
/// characters, punctuation, all whitespace and the currency unit words. The
/// output contains none of the characters it removes, so the function is
/// idempotent.
pub fn normalize_label(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();

    let mut depth = 0usize;
    let mut out = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if OPEN_BRACKETS.contains(&ch) {
            depth += 1;
            continue;
        }
        if CLOSE_BRACKETS.contains(&ch) {
            depth = depth.saturating_sub(1);
            continue;
        }
        if depth > 0 {
            continue;
        }
        if QUOTES.contains(&ch) || PUNCTUATION.contains(&ch) || ch.is_whitespace() {
            continue;
        }
        out.push(ch);
    }

    for unit in UNIT_WORDS {
        out = out.replace(unit, "");
    }
    out
}
