//! URI identifier scrubbing.
//!
//! A URI is split on `/` and every segment runs through the configured
//! detectors in order; the first match replaces the segment. The FSM
//! detector scores transitions between character classes to separate
//! opaque identifiers from ordinary path words.

use model::UriProcessing;

pub fn scrub_uri(uri: &str, processing: &UriProcessing) -> String {
    let segments: Vec<&str> = uri.split('/').collect();
    let mut result = Vec::with_capacity(segments.len());
    for segment in segments {
        let replacement = replace_segment(segment, processing);
        result.push(replacement.unwrap_or_else(|| segment.to_string()));
    }
    result.join("/")
}

fn replace_segment(segment: &str, processing: &UriProcessing) -> Option<String> {
    if let Some(replacer) = &processing.uuid_replacer {
        if is_uuid(segment) {
            return Some(replacer.clone());
        }
    }
    if let Some(replacer) = &processing.number_replacer {
        if is_number(segment) {
            return Some(replacer.clone());
        }
    }
    if let Some(replacer) = &processing.id_replacer {
        if is_id(segment, processing.id_digit_quantity) {
            return Some(replacer.clone());
        }
    }
    if let Some(replacer) = &processing.fsm_replacer {
        if is_id_fsm(segment, processing.fsm_replacer_limit) {
            return Some(replacer.clone());
        }
    }
    None
}

/// Length 36 with hyphens at positions 8, 13, 18 and 23.
pub fn is_uuid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 36
        && bytes[8] == b'-'
        && bytes[13] == b'-'
        && bytes[18] == b'-'
        && bytes[23] == b'-'
}

/// Optional leading sign followed by decimal digits only.
pub fn is_number(segment: &str) -> bool {
    let digits = segment
        .strip_prefix(|c| c == '-' || c == '+')
        .unwrap_or(segment);
    !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit())
}

/// At least `digit_quantity` decimal digits anywhere in the segment.
pub fn is_id(segment: &str, digit_quantity: usize) -> bool {
    if digit_quantity == 0 {
        return !segment.is_empty() && segment.bytes().any(|byte| byte.is_ascii_digit());
    }
    segment.bytes().filter(|byte| byte.is_ascii_digit()).count() >= digit_quantity
}

#[derive(Clone, Copy, PartialEq)]
enum CharClass {
    Start,
    LowerCase,
    UpperCase,
    Digit,
    Delimiter,
    Other,
}

/// Suspicion-scoring state machine. Transitions between character classes
/// accumulate weight; a final score at or above `limit` classifies the
/// segment as an identifier.
pub fn is_id_fsm(segment: &str, limit: i32) -> bool {
    use CharClass::*;
    let mut state = Start;
    let mut score: i32 = 0;
    let mut digits_and_other = 0;
    for c in segment.chars() {
        if c.is_ascii_lowercase() {
            match state {
                LowerCase => continue,
                UpperCase => score += 1,
                Digit | Other => score += 2,
                _ => {}
            }
            state = LowerCase;
        } else if c.is_ascii_uppercase() {
            match state {
                LowerCase => score += 1,
                Digit | Other => score += 2,
                _ => {}
            }
            state = UpperCase;
        } else if c.is_ascii_digit() {
            digits_and_other += 1;
            match state {
                UpperCase | LowerCase | Delimiter => score += 1,
                Digit => {
                    score += 2;
                    continue;
                }
                Start => score += 5,
                Other => score += 3,
            }
            state = Digit;
        } else if c == '-' || c == '_' || c == '.' {
            if state == LowerCase || state == UpperCase {
                state = Delimiter;
                continue;
            }
            match state {
                Digit => score += 1,
                Start | Other => score += 3,
                Delimiter => score += 2,
                _ => {}
            }
            state = Delimiter;
        } else {
            score += 3;
            digits_and_other += 1;
            state = Other;
        }
    }
    if state == Other || state == Delimiter {
        score += 1;
    }
    if digits_and_other == 0 {
        score -= 5;
    }
    let size = segment.len();
    if size >= 16 && size % 4 == 0 {
        score += 1;
    }
    score >= limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_processing() -> UriProcessing {
        UriProcessing {
            uuid_replacer: Some("_UUID_".to_string()),
            number_replacer: Some("_NUMBER_".to_string()),
            id_replacer: Some("_ID_".to_string()),
            id_digit_quantity: 3,
            fsm_replacer: Some("_FSM_".to_string()),
            fsm_replacer_limit: 10,
        }
    }

    #[test]
    fn scrubs_uuids_and_numbers() {
        let uri = "/api/v1/users/12345678-1234-1234-1234-123456789012/orders/456/items/789";
        assert_eq!(
            scrub_uri(uri, &full_processing()),
            "/api/v1/users/_UUID_/orders/_NUMBER_/items/_NUMBER_"
        );
    }

    #[test]
    fn plain_words_survive() {
        let uri = "/api/v1/users/customers";
        assert_eq!(scrub_uri(uri, &full_processing()), "/api/v1/users/customers");
    }

    #[test]
    fn uuid_detection() {
        assert!(is_uuid("12345678-1234-1234-1234-123456789012"));
        assert!(!is_uuid("not-a-uuid"));
        assert!(!is_uuid("12345678-1234-1234-1234"));
    }

    #[test]
    fn number_detection() {
        assert!(is_number("123"));
        assert!(is_number("-456"));
        assert!(is_number("+789"));
        assert!(!is_number("abc"));
        assert!(!is_number("12a34"));
        assert!(!is_number(""));
        assert!(!is_number("-"));
    }

    #[test]
    fn id_detection_counts_digits() {
        assert!(is_id("a1b2c3", 3));
        assert!(!is_id("a1b2", 3));
    }

    #[test]
    fn fsm_flags_opaque_identifiers() {
        assert!(is_id_fsm("abc123def456", 10));
        assert!(is_id_fsm("a1f3b2cE", 8));
        assert!(is_id_fsm("ord_20230915_x12", 10));
    }

    #[test]
    fn fsm_passes_ordinary_words() {
        assert!(!is_id_fsm("simple", 20));
        assert!(!is_id_fsm("users", 10));
        assert!(!is_id_fsm("customers", 10));
    }
}
