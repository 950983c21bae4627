// 🔤 Name Normalizer - canonical form for territory labels
//
// "la Vila de GrÃ cia", "LA VILA DE GRÀCIA" and "Vila de Gracia" all
// normalize to "vila de gracia".
//
// Steps, in order:
//   1. repair mojibake (UTF-8 read as Latin-1 / Windows-1252)
//   2. lower-case
//   3. fold the Catalan middle dot (l·l → ll) and typographic apostrophes
//   4. strip diacritics (NFD, drop combining marks)
//   5. strip one leading definite article, if something remains
//   6. punctuation → space, collapse whitespace

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Default leading articles (Catalan)
pub const DEFAULT_ARTICLES: &[&str] = &["el", "la", "els", "les", "l'"];

#[derive(Debug, Clone, PartialEq)]
pub struct NameNormalizer {
    /// Leading articles removed from the front of a label
    articles: Vec<String>,
}

impl NameNormalizer {
    pub fn new() -> Self {
        Self::with_articles(DEFAULT_ARTICLES.iter().map(|a| a.to_string()).collect())
    }

    pub fn with_articles(articles: Vec<String>) -> Self {
        let mut articles: Vec<String> = articles
            .into_iter()
            .map(|a| a.trim().to_lowercase().replace('’', "'"))
            .filter(|a| !a.is_empty())
            .collect();
        // Longest first so "els" wins over "el"
        articles.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        articles.dedup();
        NameNormalizer { articles }
    }

    pub fn articles(&self) -> &[String] {
        &self.articles
    }

    /// Normalize a raw territory label. Never fails.
    pub fn normalize(&self, raw: &str) -> String {
        let repaired = match repair_mojibake(raw) {
            Some(text) => text,
            None => return raw.to_lowercase(),
        };

        let lowered = repaired
            .to_lowercase()
            .replace("l·l", "ll")
            .replace("l.l", "ll")
            .replace(['’', '´', '`'], "'");

        let folded = strip_diacritics(&lowered);
        let without_article = self.strip_leading_article(folded.trim());
        collapse_punctuation(&without_article)
    }

    fn strip_leading_article(&self, text: &str) -> String {
        for article in &self.articles {
            let rest = if article.ends_with('\'') {
                text.strip_prefix(article.as_str())
            } else {
                text.strip_prefix(article.as_str())
                    .filter(|r| r.starts_with(char::is_whitespace))
            };

            if let Some(rest) = rest {
                let rest = rest.trim_start();
                if rest.chars().any(char::is_alphanumeric) {
                    return rest.to_string();
                }
            }
        }
        text.to_string()
    }
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_diacritics(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

fn collapse_punctuation(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Undo UTF-8 → Latin-1 mis-decoding.
///
/// Returns the input untouched when it shows no mojibake markers, the
/// repaired text when re-encoding yields valid UTF-8, and `None` when the
/// original bytes are unrecoverable.
fn repair_mojibake(raw: &str) -> Option<String> {
    if raw.contains('\u{FFFD}') {
        return None;
    }

    if !raw.contains(['Ã', 'Â']) {
        return Some(raw.to_string());
    }

    // "à" is C3 A0; the A0 often reaches us already folded to a plain space
    let candidate = raw.replace("Ã ", "Ã\u{a0}");

    let mut bytes = Vec::with_capacity(candidate.len());
    for c in candidate.chars() {
        match cp1252_byte(c) {
            Some(b) => bytes.push(b),
            None => {
                // Mixed text: keep the char as proper UTF-8
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        // "Ã" may be legitimate text; only give up if it looked broken
        Err(_) => Some(raw.to_string()),
    }
}

/// Latin-1 / Windows-1252 byte for a char, if it has one
fn cp1252_byte(c: char) -> Option<u8> {
    let code = c as u32;
    // Latin-1 covers C1 controls too
    if code < 0x100 {
        return Some(code as u8);
    }
    let byte = match c {
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8A,
        '‹' => 0x8B,
        'Œ' => 0x8C,
        'Ž' => 0x8E,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9A,
        '›' => 0x9B,
        'œ' => 0x9C,
        'ž' => 0x9E,
        'Ÿ' => 0x9F,
        _ => return None,
    };
    Some(byte)
}

/// Decode bytes that are not valid UTF-8 as Windows-1252.
///
/// Every byte maps to a char: the five bytes cp1252 leaves undefined fall
/// back to their Latin-1 C1 control.
pub fn decode_cp1252(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| cp1252_char(b)).collect()
}

/// Field text from a raw CSV cell: UTF-8 when valid, otherwise Windows-1252
pub fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => decode_cp1252(bytes),
    }
}

fn cp1252_char(b: u8) -> char {
    match b {
        0x80 => '€',
        0x82 => '‚',
        0x83 => 'ƒ',
        0x84 => '„',
        0x85 => '…',
        0x86 => '†',
        0x87 => '‡',
        0x88 => 'ˆ',
        0x89 => '‰',
        0x8A => 'Š',
        0x8B => '‹',
        0x8C => 'Œ',
        0x8E => 'Ž',
        0x91 => '‘',
        0x92 => '’',
        0x93 => '“',
        0x94 => '”',
        0x95 => '•',
        0x96 => '–',
        0x97 => '—',
        0x98 => '˜',
        0x99 => '™',
        0x9A => 'š',
        0x9B => '›',
        0x9C => 'œ',
        0x9E => 'ž',
        0x9F => 'Ÿ',
        _ => b as char,
    }
}

// ============================================================================
// TESTS
// ============================================================================
