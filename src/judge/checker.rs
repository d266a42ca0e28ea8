use crate::judge::{TestReport, TestStatus};

const INVALID_FIRST_LINE: &str = r#"Checker error: invalid first line (expected "OK" or "WRONG")"#;
const INVALID_SECOND_LINE: &str =
  "Checker error: invalid second line (expected real number in range [0, 100] or empty line)";

/// Parsed checker stderr
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerVerdict {
  pub status: TestStatus,
  pub score: f64,
  pub comment: String,
}

impl From<CheckerVerdict> for TestReport {
  fn from(verdict: CheckerVerdict) -> Self {
    TestReport::new(verdict.status, verdict.comment, verdict.score)
  }
}

/// Split off one line; the last line may lack its `\n`
fn next_line(text: &[u8]) -> (&[u8], &[u8]) {
  match text.iter().position(|&b| b == b'\n') {
    Some(end) => (&text[..end], &text[end + 1..]),
    None => (text, &[]),
  }
}

/// Whether a checker has already committed to a verdict, judging by what it wrote so far
pub(crate) fn has_decided(output: &[u8]) -> bool {
  let (first, _) = next_line(output);
  (first == b"OK" || first == b"WRONG") && output.get(first.len()) == Some(&b'\n')
}

/// Parse the verdict protocol:
///
/// ```text
/// OK|WRONG
/// [score in [0, 100]]
/// [comment, may span lines]
/// ```
///
/// The comment is cut to `max_comment_len` bytes. `WRONG` always scores 0.
pub fn parse_checker_output(output: &[u8], max_comment_len: usize) -> CheckerVerdict {
  let error = |comment: &str| CheckerVerdict {
    status: TestStatus::CheckerError,
    score: 0.0,
    comment: comment.to_string(),
  };

  let (first, rest) = next_line(output);
  let status = match first {
    b"OK" => TestStatus::OK,
    b"WRONG" => TestStatus::WrongAnswer,
    _ => return error(INVALID_FIRST_LINE),
  };

  let (second, rest) = next_line(rest);
  let score = if second.is_empty() {
    1.0
  } else {
    let value = std::str::from_utf8(second)
      .ok()
      .and_then(|text| text.trim().parse::<f64>().ok());
    match value {
      Some(value) if (0.0..=100.0).contains(&value) => value / 100.0,
      _ => return error(INVALID_SECOND_LINE),
    }
  };

  let comment = &rest[..rest.len().min(max_comment_len)];
  CheckerVerdict {
    status,
    score: if status == TestStatus::OK { score } else { 0.0 },
    comment: String::from_utf8_lossy(comment).into_owned(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(text: &str) -> CheckerVerdict {
    parse_checker_output(text.as_bytes(), 512)
  }

  #[test]
  fn bare_ok() {
    let verdict = parse("OK");
    assert_eq!(verdict.status, TestStatus::OK);
    assert_eq!(verdict.score, 1.0);
    assert_eq!(verdict.comment, "");

    assert_eq!(parse("OK\n"), verdict);
    assert_eq!(parse("OK\n\n"), verdict);
  }

  #[test]
  fn score_and_multiline_comment() {
    let verdict = parse("OK\n42.3\nsome comment\neven with\nnewlines");
    assert_eq!(verdict.status, TestStatus::OK);
    assert_eq!(verdict.score, 0.423);
    assert_eq!(verdict.comment, "some comment\neven with\nnewlines");
  }

  #[test]
  fn wrong_always_scores_zero() {
    let verdict = parse("WRONG\n0\nsome comment\neven with\nnewlines");
    assert_eq!(verdict.status, TestStatus::WrongAnswer);
    assert_eq!(verdict.score, 0.0);
    assert_eq!(verdict.comment, "some comment\neven with\nnewlines");

    let verdict = parse("WRONG\n75\n");
    assert_eq!(verdict.status, TestStatus::WrongAnswer);
    assert_eq!(verdict.score, 0.0);

    let verdict = parse("WRONG\n\nabc");
    assert_eq!(verdict.score, 0.0);
    assert_eq!(verdict.comment, "abc");
  }

  #[test]
  fn invalid_lines() {
    for text in ["abc", "", "ok", "OK ", " OK\n", "WRONG!"] {
      let verdict = parse(text);
      assert_eq!(verdict.status, TestStatus::CheckerError, "{:?}", text);
      assert_eq!(verdict.comment, INVALID_FIRST_LINE);
    }
    for text in ["OK\nabc", "OK\n101", "OK\n-1", "WRONG\nNaN\n", "OK\n1e9"] {
      let verdict = parse(text);
      assert_eq!(verdict.status, TestStatus::CheckerError, "{:?}", text);
      assert_eq!(verdict.comment, INVALID_SECOND_LINE);
      assert_eq!(verdict.score, 0.0);
    }
  }

  #[test]
  fn comment_is_cut_at_byte_level() {
    let text = format!("OK\n50\n{:>513}", "ab");
    let verdict = parse(&text);
    assert_eq!(verdict.status, TestStatus::OK);
    assert_eq!(verdict.score, 0.5);
    assert_eq!(verdict.comment, format!("{}a", " ".repeat(511)));
    // Same input, same cut
    assert_eq!(parse(&text), verdict);

    let verdict = parse_checker_output("OK\n\nżółw".as_bytes(), 3);
    assert_eq!(verdict.comment, "ż\u{fffd}");
  }

  #[test]
  fn decision_needs_a_complete_first_line() {
    assert!(has_decided(b"OK\n"));
    assert!(has_decided(b"WRONG\n\nabc"));
    assert!(!has_decided(b"OK"));
    assert!(!has_decided(b"WRO"));
    assert!(!has_decided(b""));
    assert!(!has_decided(b"abc\n"));
  }
}
