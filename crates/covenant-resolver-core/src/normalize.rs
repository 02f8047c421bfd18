//! Canonicalization of hand-transcribed addition, block, and lot text.
//!
//! All three entry points are total: unparseable input yields an empty key or
//! `None`, never an error. Any change to these rules changes join keys and
//! invalidates every previously built index.

use std::sync::LazyLock;

use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Largest lot range ("1-20") that is expanded into individual lots.
const MAX_LOT_RANGE_SPAN: u64 = 2_000;

#[allow(clippy::expect_used)]
fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("built-in pattern compiles")
}

static ADDIT_ABBREV: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)\baddit\.\s*"));
static ADDN_ABBREV: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)\badd'?n\b\.?"));
static POSSESSIVE_BEFORE: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)'s"));
static POSSESSIVE_AFTER: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)s'"));
static COMMA: LazyLock<Regex> = LazyLock::new(|| pattern(r",\s*"));
static AMPERSAND: LazyLock<Regex> = LazyLock::new(|| pattern(r"\s*&\s*"));
static ORDINAL_ADDITION_TO: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b([a-z]+(?:-[a-z]+)?)\s+addition\s+to\b"));
static RESUBDIVISION: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\bre-?sub(?:division|div|d)?\b\.?"));
static ADDITION_TO_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)(?:^|\s)(?:an\s+)?addition\s+to\s+(?:the\s+city\s+of\s+)?.+"));
static ADDITION_WORD: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)\baddition\b"));
static SUBDIVISION_WORD: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(?:subdivision|subdiv|subd|sub)\b\.?"));
static NUMBER_MARK: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)\bno\s*(\d+)"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| pattern(r"\s+"));

static BLOCK_TOKEN: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)^\s*(?:block|blk)\b\.?\s*"));
static LOT_TOKEN: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)\blots?\b\.?\s*"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| pattern(r"^\d+$"));
static SINGLE_LETTER: LazyLock<Regex> = LazyLock::new(|| pattern(r"^[a-z]$"));
static DASH_RANGE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^(\d+)\s*-\s*(\d+)$"));
static THRU_RANGE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(\d+)\s+(?:thru|through)\s+(\d+)$"));
static FULL_WITH_PARTIAL: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(\d+)\s+(?:por|pt)\.?\s+(?:of\s+)?\d+$"));
static LIST_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"\s*(?:,\s*(?:&|and\b)?|&|\band\b)\s*"));
static NUMBER_THEN_WORD: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^(\d+)\s+\(?([a-z\-]+)\)?$"));
static WORD_THEN_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^\(?([a-z\-]+)\)?\s+\(?(\d+)\)?$"));

const UNIT_WORDS: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];

const TENS_WORDS: [&str; 10] =
    ["", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety"];

const UNIT_ORDINALS: [&str; 20] = [
    "", "first", "second", "third", "fourth", "fifth", "sixth", "seventh", "eighth", "ninth",
    "tenth", "eleventh", "twelfth", "thirteenth", "fourteenth", "fifteenth", "sixteenth",
    "seventeenth", "eighteenth", "nineteenth",
];

const TENS_ORDINALS: [&str; 10] = [
    "", "", "twentieth", "thirtieth", "fortieth", "fiftieth", "sixtieth", "seventieth",
    "eightieth", "ninetieth",
];

/// Which rule produced a block key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockStyle {
    SimpleNum,
    SimpleLetter,
    RepeatedTextNum,
    NoBlock,
}

impl BlockStyle {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SimpleNum => "simple_num",
            Self::SimpleLetter => "simple_letter",
            Self::RepeatedTextNum => "repeated_text_num",
            Self::NoBlock => "no_block",
        }
    }
}

/// Which rule produced a lot set. `NoLot` marks a missing field, as opposed to
/// the literal word "none", which parses with no style at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotStyle {
    SimpleNum,
    SimpleLetter,
    RepeatedTextNum,
    Range,
    ListOfNums,
    FullWithPartial,
    PartialLot,
    #[serde(rename = "none")]
    NoLot,
}

impl LotStyle {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SimpleNum => "simple_num",
            Self::SimpleLetter => "simple_letter",
            Self::RepeatedTextNum => "repeated_text_num",
            Self::Range => "range",
            Self::ListOfNums => "list_of_nums",
            Self::FullWithPartial => "full_with_partial",
            Self::PartialLot => "partial_lot",
            Self::NoLot => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlockParse {
    pub block: Option<String>,
    pub style: Option<BlockStyle>,
}

impl BlockParse {
    fn parsed(block: String, style: BlockStyle) -> Self {
        Self { block: Some(block), style: Some(style) }
    }

    fn unparsed(style: Option<BlockStyle>) -> Self {
        Self { block: None, style }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LotParse {
    /// Ascending numeric order for numeric lots; never empty when present.
    pub lots: Option<Vec<String>>,
    pub style: Option<LotStyle>,
}

impl LotParse {
    fn parsed(lots: Vec<String>, style: LotStyle) -> Self {
        Self { lots: Some(lots), style: Some(style) }
    }

    fn unparsed(style: Option<LotStyle>) -> Self {
        Self { lots: None, style }
    }
}

/// Reduce an addition/plat name to its bare lowercase key, e.g.
/// `"Jane's 2nd Addition"` becomes `"janes 2nd"`.
///
/// An ordinal word directly followed by "Addition To" is rewritten to digit
/// form and the "to ..." tail is kept (`"First Addition To X"` becomes
/// `"1st to x"`), while a bare ordinal word is left as typed. Existing join
/// keys depend on that asymmetry.
///
/// Returns an empty string for missing or blank input.
#[must_use]
pub fn standardize_addition(input: Option<&str>) -> String {
    let Some(raw) = input else {
        return String::new();
    };

    let mut text = raw.replace(['\u{2018}', '\u{2019}', '`'], "'");
    text = ADDIT_ABBREV.replace_all(&text, "addition ").into_owned();
    text = ADDN_ABBREV.replace_all(&text, "addition").into_owned();
    text = POSSESSIVE_BEFORE.replace_all(&text, "s").into_owned();
    text = POSSESSIVE_AFTER.replace_all(&text, "s").into_owned();
    text = COMMA.replace_all(&text, " ").into_owned();
    text = AMPERSAND.replace_all(&text, " and ").into_owned();
    text = ORDINAL_ADDITION_TO
        .replace_all(&text, |caps: &Captures<'_>| match ordinal_word_value(&caps[1]) {
            Some(value) => format!("{} to", digit_ordinal(value)),
            None => caps[0].to_string(),
        })
        .into_owned();
    text = RESUBDIVISION.replace_all(&text, "resubdivision").into_owned();
    text = ADDITION_TO_SUFFIX.replace_all(&text, " ").into_owned();
    text = ADDITION_WORD.replace_all(&text, " ").into_owned();
    text = SUBDIVISION_WORD.replace_all(&text, " ").into_owned();
    text = text.replace('.', "");
    text = NUMBER_MARK.replace_all(&text, "${1}").into_owned();
    text = WHITESPACE.replace_all(&text, " ").into_owned();

    text.trim().to_lowercase()
}

/// Parse a block field into its canonical key: a bare numeral without leading
/// zeros, an upper-cased single letter, or the digit form of a number that is
/// written out and repeated ("six 6", "6 (six)").
#[must_use]
pub fn get_block(input: Option<&str>) -> BlockParse {
    let Some(raw) = input.filter(|value| !value.trim().is_empty()) else {
        return BlockParse::unparsed(Some(BlockStyle::NoBlock));
    };

    let text = BLOCK_TOKEN.replace(raw, "").trim().to_lowercase();

    if text == "none" {
        return BlockParse::unparsed(Some(BlockStyle::NoBlock));
    }

    if DIGITS.is_match(&text) {
        return BlockParse::parsed(strip_leading_zeros(&text), BlockStyle::SimpleNum);
    }

    if SINGLE_LETTER.is_match(&text) {
        return BlockParse::parsed(text.to_uppercase(), BlockStyle::SimpleLetter);
    }

    if let Some(number) = repeated_text_num(&text) {
        return BlockParse::parsed(number, BlockStyle::RepeatedTextNum);
    }

    BlockParse::unparsed(None)
}

/// Parse a lot field into one or more canonical lot keys.
///
/// A field that cannot be read in full (trailing prose, a bad range bound, a
/// partial lot) yields no lots at all rather than a best guess.
#[must_use]
pub fn get_lots(input: Option<&str>) -> LotParse {
    let Some(raw) = input.filter(|value| !value.trim().is_empty()) else {
        return LotParse::unparsed(Some(LotStyle::NoLot));
    };

    if raw.trim().eq_ignore_ascii_case("none") {
        return LotParse::unparsed(None);
    }

    if raw.to_lowercase().contains("partial") {
        return LotParse::unparsed(Some(LotStyle::PartialLot));
    }

    let text = LOT_TOKEN.replace_all(raw, "").trim().to_lowercase();

    if DIGITS.is_match(&text) {
        return LotParse::parsed(vec![strip_leading_zeros(&text)], LotStyle::SimpleNum);
    }

    if SINGLE_LETTER.is_match(&text) {
        return LotParse::parsed(vec![text], LotStyle::SimpleLetter);
    }

    if let Some(number) = repeated_text_num(&text) {
        return LotParse::parsed(vec![number], LotStyle::RepeatedTextNum);
    }

    if let Some(caps) = DASH_RANGE.captures(&text).or_else(|| THRU_RANGE.captures(&text)) {
        return match expand_range(&caps[1], &caps[2]) {
            Some(lots) => LotParse::parsed(lots, LotStyle::Range),
            None => LotParse::unparsed(None),
        };
    }

    if let Some(caps) = FULL_WITH_PARTIAL.captures(&text) {
        return LotParse::parsed(vec![strip_leading_zeros(&caps[1])], LotStyle::FullWithPartial);
    }

    match split_number_list(&text) {
        Some(lots) => LotParse::parsed(lots, LotStyle::ListOfNums),
        None => LotParse::unparsed(None),
    }
}

fn strip_leading_zeros(digits: &str) -> String {
    let stripped = digits.trim_start_matches('0');
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

fn expand_range(start: &str, end: &str) -> Option<Vec<String>> {
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    if start > end || end - start > MAX_LOT_RANGE_SPAN {
        return None;
    }
    Some((start..=end).map(|lot| lot.to_string()).collect())
}

fn split_number_list(text: &str) -> Option<Vec<String>> {
    let tokens = LIST_SEPARATOR.split(text).collect::<Vec<_>>();
    if tokens.len() < 2 || tokens.iter().any(|token| !DIGITS.is_match(token)) {
        return None;
    }

    let mut numbers = tokens
        .iter()
        .filter_map(|token| token.parse::<u64>().ok())
        .collect::<Vec<_>>();
    if numbers.len() != tokens.len() {
        return None;
    }
    numbers.sort_unstable();
    numbers.dedup();
    Some(numbers.into_iter().map(|lot| lot.to_string()).collect())
}

/// "six 6", "6 six", "6 (six)", "six (6)" all read as "6".
fn repeated_text_num(text: &str) -> Option<String> {
    if let Some(caps) = NUMBER_THEN_WORD.captures(text) {
        if spells_number(&caps[2], &caps[1]) {
            return Some(strip_leading_zeros(&caps[1]));
        }
    }

    if let Some(caps) = WORD_THEN_NUMBER.captures(text) {
        if spells_number(&caps[1], &caps[2]) {
            return Some(strip_leading_zeros(&caps[2]));
        }
    }

    None
}

fn spells_number(word: &str, digits: &str) -> bool {
    digits
        .parse::<u32>()
        .ok()
        .and_then(number_to_words)
        .is_some_and(|spelled| spelled == word)
}

fn number_to_words(value: u32) -> Option<String> {
    let index = usize::try_from(value).ok()?;
    match index {
        0..=19 => Some(UNIT_WORDS[index].to_string()),
        20..=99 => {
            let tens = TENS_WORDS[index / 10];
            match index % 10 {
                0 => Some(tens.to_string()),
                unit => Some(format!("{tens}-{}", UNIT_WORDS[unit])),
            }
        }
        _ => None,
    }
}

/// "first" -> 1, "twentieth" -> 20, "twenty-first" -> 21.
fn ordinal_word_value(word: &str) -> Option<u32> {
    let word = word.to_lowercase();
    let position = |table: &[&str], needle: &str| {
        table
            .iter()
            .position(|candidate| !candidate.is_empty() && *candidate == needle)
            .and_then(|index| u32::try_from(index).ok())
    };

    if let Some(unit) = position(&UNIT_ORDINALS, &word) {
        return Some(unit);
    }
    if let Some(tens) = position(&TENS_ORDINALS, &word) {
        return Some(tens * 10);
    }

    let (tens_word, unit_word) = word.split_once('-')?;
    let tens = position(&TENS_WORDS, tens_word)?;
    let unit = position(&UNIT_ORDINALS[..10], unit_word)?;
    Some(tens * 10 + unit)
}

fn digit_ordinal(value: u32) -> String {
    let suffix = match (value % 10, value % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{value}{suffix}")
}
