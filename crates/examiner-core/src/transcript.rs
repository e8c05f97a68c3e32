//! Examiner transcript parser
//!
//! The marking service may answer with the examiner's plain-text transcript
//! instead of JSON. A transcript is a sequence of `---`-separated blocks:
//!
//! ```text
//! Question Number: 1.2
//! Question: Name the organelle.
//! Max Marks: 1
//! Student Answer: Nucleus
//! Mark: 1/1
//! Comment: Correct.
//! ---
//! Total Marks: 1/1
//! ```
//!
//! `Student Answer` and `Comment` may continue over several lines.

use crate::error::{ExaminerError, Result};
use crate::remote::{MarkedQuestion, MarkingResult};

const BLOCK_SEPARATOR: &str = "---";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    QuestionNumber,
    Question,
    MaxMarks,
    StudentAnswer,
    Mark,
    Comment,
}

impl Field {
    const LABELS: [(&'static str, Field); 6] = [
        ("Question Number:", Field::QuestionNumber),
        ("Question:", Field::Question),
        ("Max Marks:", Field::MaxMarks),
        ("Student Answer:", Field::StudentAnswer),
        ("Mark:", Field::Mark),
        ("Comment:", Field::Comment),
    ];

    fn continues(self) -> bool {
        matches!(self, Field::StudentAnswer | Field::Comment)
    }

    /// Split a line into its field and inline value
    fn match_line(line: &str) -> Option<(Field, &str)> {
        Self::LABELS
            .iter()
            .find_map(|(label, field)| line.strip_prefix(label).map(|rest| (*field, rest.trim())))
    }
}

/// Parse a transcript into a marking result
///
/// # Errors
/// `ExaminerError::Decode` if the transcript holds neither questions nor a total
pub fn parse(raw: &str) -> Result<MarkingResult> {
    let mut questions = Vec::new();
    let mut total = String::new();

    for block in raw.split(BLOCK_SEPARATOR).map(str::trim).filter(|b| !b.is_empty()) {
        if let Some(value) = total_line(block) {
            total = value.to_string();
            continue;
        }
        if let Some(question) = parse_block(block, &mut total) {
            questions.push(question);
        }
    }

    if questions.is_empty() && total.is_empty() {
        return Err(ExaminerError::decode("transcript contains no marked questions"));
    }

    tracing::debug!(questions = questions.len(), total = %total, "Transcript parsed");
    Ok(MarkingResult { questions, total })
}

fn total_line(block: &str) -> Option<&str> {
    let head = block.get(..12)?;
    if !head.eq_ignore_ascii_case("total marks:") {
        return None;
    }
    Some(block[12..].trim())
}

fn parse_block(block: &str, total: &mut String) -> Option<MarkedQuestion> {
    let mut question = MarkedQuestion {
        question_number: String::new(),
        question_text: String::new(),
        max_marks: String::new(),
        answer_text: String::new(),
        mark: String::new(),
        comment: String::new(),
    };
    let mut recognized = false;
    let mut current: Option<Field> = None;

    for line in block.lines().map(str::trim) {
        if let Some(value) = total_line(line) {
            *total = value.to_string();
            current = None;
        } else if let Some((field, value)) = Field::match_line(line) {
            recognized = true;
            *slot(&mut question, field) = value.to_string();
            current = field.continues().then_some(field);
        } else if let Some(field) = current {
            if line.is_empty() {
                continue;
            }
            let target = slot(&mut question, field);
            if !target.is_empty() {
                target.push(' ');
            }
            target.push_str(line);
        }
    }

    recognized.then_some(question)
}

fn slot(question: &mut MarkedQuestion, field: Field) -> &mut String {
    match field {
        Field::QuestionNumber => &mut question.question_number,
        Field::Question => &mut question.question_text,
        Field::MaxMarks => &mut question.max_marks,
        Field::StudentAnswer => &mut question.answer_text,
        Field::Mark => &mut question.mark,
        Field::Comment => &mut question.comment,
    }
}
