//! Inline answer-choice extraction from OCR text.
//!
//! Exam scans carry choice markers in several layouts. For each letter A
//! through E the first line-bounded match wins; letters with no match are
//! absent (a 4-of-5 result is valid, not an error).

use examflow_shared::AnswerOption;
use regex::Regex;

const CHOICE_LETTERS: [char; 5] = ['A', 'B', 'C', 'D', 'E'];

/// Encode literal `(C)` / `(c)` so stored body text cannot be mistaken for a
/// choice marker by a later parse.
pub fn escape_choice_markers(text: &str) -> String {
    text.replace("(C)", "&#40;C&#41;").replace("(c)", "&#40;c&#41;")
}

/// Parse inline choice markers from `text`.
///
/// Recognized marker forms per letter: `(A)`, `(a)`, `A.`, `a.`, `A)`.
/// The marker must start a line; the rest of that line becomes the option
/// content. `correct_key` marks the matching option as the recorded answer.
pub fn parse_answer_choices(text: &str, correct_key: Option<char>) -> Vec<AnswerOption> {
    let mut options = Vec::new();

    for letter in CHOICE_LETTERS {
        let lower = letter.to_ascii_lowercase();
        // First line-bounded match for this letter wins.
        let pattern = format!(
            r"(?m)^\s*(?:\({upper}\)|\({lower}\)|{upper}\.|{lower}\.|{upper}\))\s*(\S.*?)\s*$",
            upper = letter,
            lower = lower,
        );
        let re = Regex::new(&pattern).expect("choice marker pattern is valid");

        if let Some(caps) = re.captures(text) {
            let content = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let is_correct = correct_key.is_some_and(|k| k.to_ascii_uppercase() == letter);
            options.push(AnswerOption::new(letter, content, is_correct));
        }
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_both_cases() {
        let text = "Copyright (c) 2023. See figure (C) below.";
        assert_eq!(
            escape_choice_markers(text),
            "Copyright &#40;c&#41; 2023. See figure &#40;C&#41; below."
        );
    }

    #[test]
    fn parses_parenthesized_markers() {
        let text = "2+2=?\n(A) 3\n(B) 4\n(C) 5\n(D) 6\n(E) 7";
        let options = parse_answer_choices(text, Some('B'));
        assert_eq!(options.len(), 5);
        assert_eq!(options[0].key, 'A');
        assert_eq!(options[0].content, "3");
        assert!(options[1].is_correct);
        assert!(!options[0].is_correct);
    }

    #[test]
    fn parses_dotted_and_half_paren_markers() {
        let text = "Which is prime?\nA. 4\nb. 7\nC) 9";
        let options = parse_answer_choices(text, None);
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].content, "4");
        assert_eq!(options[1].key, 'B');
        assert_eq!(options[1].content, "7");
        assert_eq!(options[2].content, "9");
    }

    #[test]
    fn missing_letters_are_absent() {
        let text = "Pick one:\n(A) red\n(B) green\n(C) blue\n(D) black";
        let options = parse_answer_choices(text, None);
        assert_eq!(options.len(), 4);
        assert!(!options.iter().any(|o| o.key == 'E'));
    }

    #[test]
    fn first_match_per_letter_wins() {
        let text = "(A) first\nmore text\n(A) second";
        let options = parse_answer_choices(text, None);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].content, "first");
    }

    #[test]
    fn markers_mid_line_are_ignored() {
        let text = "The answer (A) is hidden here\nB. actual option";
        let options = parse_answer_choices(text, None);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].key, 'B');
    }

    #[test]
    fn no_markers_yields_empty() {
        assert!(parse_answer_choices("just a paragraph of text", None).is_empty());
    }
}
