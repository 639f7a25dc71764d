/// Verdict Engine - Language-Agnostic Judgment
///
/// **Core Responsibility:**
/// Turn one raw execution outcome (plus expected output and an optional
/// checker) into a final verdict.
///
/// **Critical Properties:**
/// - Knows nothing about sandboxes or language runtimes
/// - Pure function: identical inputs always give the identical verdict
/// - A checker is an extra path to Accepted, never a veto over an exact match
///
/// **Precedence:**
/// 1. TLE / MLE / RTE raw outcomes map straight through
/// 2. Absent expected output is MissingOutputFile, nothing is compared
/// 3. Checker says yes, Accepted
/// 4. Exact equality of normalized text
use arbiter_common::{ExecutionResult, RawOutcome, TestVerdict, Verdict};

use crate::checker::Checker;

/// Canonical form used for comparison
///
/// Line endings become `\n`, trailing whitespace is stripped from every line,
/// trailing blank lines are dropped and the text is trimmed at both ends.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    lines.join("\n").trim().to_string()
}

pub fn judge(
    result: &ExecutionResult,
    expected: Option<&str>,
    checker: Option<&dyn Checker>,
) -> Verdict {
    match result.outcome {
        RawOutcome::Tle => return Verdict::TimeLimitExceeded,
        RawOutcome::Mle => return Verdict::MemoryLimitExceeded,
        RawOutcome::Rte => return Verdict::RuntimeError,
        RawOutcome::Ok => {}
    }

    let Some(expected) = expected else {
        return Verdict::MissingOutputFile;
    };

    let actual = normalize(&result.output);
    let expected = normalize(expected);

    if let Some(checker) = checker {
        if checker.check(&actual, &expected) {
            return Verdict::Accepted;
        }
    }

    if actual == expected {
        Verdict::Accepted
    } else {
        Verdict::WrongAnswer
    }
}

/// Judges a result and packages it for the submission record
pub fn judge_test(
    result: &ExecutionResult,
    expected: Option<&str>,
    checker: Option<&dyn Checker>,
) -> TestVerdict {
    TestVerdict {
        test: result.test_id.clone(),
        verdict: judge(result, expected, checker),
        time_used_secs: result.time_used_secs,
        memory_used_mb: result.memory_used_mb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{TokenMatch, UnorderedNumbers};

    fn result(outcome: RawOutcome, output: &str) -> ExecutionResult {
        ExecutionResult {
            test_id: "1".to_string(),
            outcome,
            output: output.to_string(),
            stderr: String::new(),
            time_used_secs: 0.05,
            memory_used_mb: 3,
            memory_advisory: false,
        }
    }

    #[test]
    fn test_hello_world_accepted() {
        let run = result(RawOutcome::Ok, "Hello, World!");
        assert_eq!(
            judge(&run, Some("Hello, World!\n"), None),
            Verdict::Accepted
        );
    }

    #[test]
    fn test_wrong_answer() {
        let run = result(RawOutcome::Ok, "41");
        assert_eq!(judge(&run, Some("42"), None), Verdict::WrongAnswer);
    }

    #[test]
    fn test_raw_outcomes_skip_comparison() {
        // Output matches, but the raw outcome wins
        for (outcome, verdict) in [
            (RawOutcome::Tle, Verdict::TimeLimitExceeded),
            (RawOutcome::Mle, Verdict::MemoryLimitExceeded),
            (RawOutcome::Rte, Verdict::RuntimeError),
        ] {
            let run = result(outcome, "42");
            assert_eq!(judge(&run, Some("42"), None), verdict);
            assert_eq!(judge(&run, None, None), verdict);
        }
    }

    #[test]
    fn test_missing_expected_output() {
        let run = result(RawOutcome::Ok, "42");
        assert_eq!(judge(&run, None, None), Verdict::MissingOutputFile);
        assert_eq!(
            judge(&run, None, Some(&TokenMatch)),
            Verdict::MissingOutputFile
        );
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize("a  \r\nb\t\r\n\r\n\n"), "a\nb");
        assert_eq!(normalize("\n  x\ny  \n"), "x\ny");
        assert_eq!(normalize("a\rb"), "a\nb");
        // Interior spacing is significant
        assert_ne!(normalize("a  b"), normalize("a b"));

        let run = result(RawOutcome::Ok, "1 2\r\n3   \r\n\r\n");
        assert_eq!(judge(&run, Some("1 2\n3"), None), Verdict::Accepted);
    }

    #[test]
    fn test_unordered_checker_accepts() {
        let run = result(RawOutcome::Ok, "3 1 2");
        assert_eq!(
            judge(&run, Some("1 2 3"), Some(&UnorderedNumbers)),
            Verdict::Accepted
        );
        assert_eq!(judge(&run, Some("1 2 3"), None), Verdict::WrongAnswer);
    }

    #[test]
    fn test_checker_cannot_reject_exact_match() {
        #[derive(Debug)]
        struct Never;
        impl Checker for Never {
            fn name(&self) -> &str {
                "never"
            }
            fn check(&self, _: &str, _: &str) -> bool {
                false
            }
        }

        let run = result(RawOutcome::Ok, "42");
        assert_eq!(judge(&run, Some("42"), Some(&Never)), Verdict::Accepted);
        assert_eq!(judge(&run, Some("43"), Some(&Never)), Verdict::WrongAnswer);
    }

    #[test]
    fn test_judge_is_idempotent() {
        let run = result(RawOutcome::Ok, "3 1 2\n");
        let first = judge(&run, Some("1 2 3"), Some(&UnorderedNumbers));
        for _ in 0..3 {
            assert_eq!(judge(&run, Some("1 2 3"), Some(&UnorderedNumbers)), first);
        }
    }

    #[test]
    fn test_judge_test_carries_measurements() {
        let run = result(RawOutcome::Ok, "ok");
        let verdict = judge_test(&run, Some("ok"), None);
        assert_eq!(verdict.test, "1");
        assert_eq!(verdict.verdict, Verdict::Accepted);
        assert_eq!(verdict.memory_used_mb, 3);
    }
}
