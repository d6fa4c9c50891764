use unicode_normalization::UnicodeNormalization;

/// Question and politeness words stripped from queries before tokenising.
/// Thai has no word spacing, so these are removed as substrings.
const THAI_QUERY_NOISE: &[&str] = &[
    "เท่าไหร่",
    "เท่าไร",
    "อยากได้",
    "ราคา",
    "ขนาด",
    "สเปค",
    "สเป็ค",
    "กี่เส้น",
    "กี่ชิ้น",
    "กี่อัน",
    "กี่แผ่น",
    "ต่อมัด",
    "มัดละ",
    "หน่อย",
    "อะไรบ้าง",
    "อะไร",
    "บ้าง",
    "ครับ",
    "ค่ะ",
    "คะ",
    "ไหม",
    "มั้ย",
    "บาท",
];

/// Request verbs that open a Thai query ("ขอ...", "มี...").
const THAI_LEADING_FILLERS: &[&str] = &["ขอ", "มี", "เอา"];

const ENGLISH_QUERY_NOISE: &[&str] = &[
    "a", "an", "the", "how", "much", "many", "is", "of", "per", "price", "size", "spec", "specs",
    "please", "bundle", "what", "for", "do", "you", "have", "any", "want", "need", "with",
    "dimension", "dimensions", "thick", "thickness",
];

pub fn is_separator(c: char) -> bool {
    c.is_whitespace()
        || c.is_control()
        || c.is_ascii_punctuation()
        || matches!(
            c,
            '\u{200b}'
                | '\u{200c}'
                | '\u{200d}'
                | '\u{feff}'
                | '“'
                | '”'
                | '‘'
                | '’'
                | '«'
                | '»'
                | '…'
                | '–'
                | '—'
                | '•'
                | '·'
                | '・'
                | '、'
                | '。'
                | '฿'
                | '๏'
                | '๚'
                | '๛'
        )
}

fn fold(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

/// Canonical matching form: NFKC, lowercase, separators removed.
///
/// Applied identically to catalog entries and queries; idempotent.
pub fn normalize(text: &str) -> String {
    let folded: String = fold(text).chars().filter(|c| !is_separator(*c)).collect();
    folded.nfkc().collect()
}

/// Splits on separators and at letter/digit boundaries ("ซีลาย26" -> ["ซีลาย", "26"]).
fn split_tokens(folded: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for piece in folded.split(is_separator).filter(|p| !p.is_empty()) {
        let mut current = String::new();
        let mut current_is_digit: Option<bool> = None;
        for c in piece.chars() {
            let is_digit = c.is_ascii_digit();
            if current_is_digit.is_some_and(|d| d != is_digit) {
                tokens.push(std::mem::take(&mut current));
            }
            current.push(c);
            current_is_digit = Some(is_digit);
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
}

/// Drops a leading filler only when the rest is empty or still carries a
/// meaningful word, so "มีด" and "ขอบ" survive.
fn strip_leading_filler(piece: &str) -> &str {
    for filler in THAI_LEADING_FILLERS {
        if let Some(rest) = piece.strip_prefix(filler) {
            if rest.is_empty() || rest.chars().count() >= 2 {
                return rest;
            }
        }
    }
    piece
}

/// Tokens of a free-text query in matching form, with question words removed.
pub fn query_tokens(text: &str) -> Vec<String> {
    let mut folded = fold(text);
    for noise in THAI_QUERY_NOISE {
        let noise = fold(noise);
        if folded.contains(&noise) {
            folded = folded.replace(&noise, " ");
        }
    }
    let folded = folded
        .split(is_separator)
        .map(strip_leading_filler)
        .collect::<Vec<_>>()
        .join(" ");
    split_tokens(&folded)
        .into_iter()
        .map(|t| normalize(&t))
        .filter(|t| !t.is_empty() && !ENGLISH_QUERY_NOISE.contains(&t.as_str()))
        .collect()
}

/// Numeric tokens and tokens of at least two characters carry meaning.
pub fn is_meaningful_token(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii_digit()) || token.chars().count() >= 2
}

/// First token of a display name, used as its coarse topic group.
pub fn leading_token(name: &str) -> Option<String> {
    split_tokens(&fold(name))
        .into_iter()
        .map(|t| normalize(&t))
        .find(|t| !t.is_empty())
}
