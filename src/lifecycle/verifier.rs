//! Cheap-model verification pass over a completed task's output. Grounded
//! on the Planner's single-call-then-parse shape and `prompt::extract_json_object`'s
//! balanced-brace recovery, reused here for a much smaller response schema.

use crate::domain::Task;
use crate::llm::{CompletionRequest, LlmClient, LlmError, Message};

/// Model used for verification regardless of the task's own tier - the
/// point of the pass is a second, cheaper opinion.
pub const VERIFIER_MODEL: &str = "claude-haiku-4-5-20251001";
const MAX_OUTPUT_TOKENS: u32 = 512;

const SYSTEM_PROMPT: &str = "You are a strict reviewer checking whether a completed task's output actually \
satisfies its verification criteria. Respond with ONLY a JSON object of the form \
{\"outcome\": \"passed\" | \"gaps_found\" | \"human_needed\", \"feedback\": \"...\"}. Use gaps_found when the \
output is fixable with another attempt. Use human_needed when the task itself is ambiguous or the output \
requires a judgment call a model shouldn't make alone.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Passed,
    GapsFound { feedback: String },
    HumanNeeded { feedback: String },
}

pub async fn verify(llm: &dyn LlmClient, task: &Task, output: &str) -> Result<VerificationOutcome, LlmError> {
    let criteria = task.verification_criteria.as_deref().unwrap_or("Output should plausibly accomplish the task description.");
    let user_message = format!(
        "Task: {}\nDescription: {}\nVerification criteria: {}\n\nOutput to review:\n{}",
        task.title, task.description, criteria, output
    );

    let request = CompletionRequest {
        system_prompt: SYSTEM_PROMPT.to_string(),
        messages: vec![Message::user(user_message)],
        tools: vec![],
        max_tokens: MAX_OUTPUT_TOKENS,
        model: Some(VERIFIER_MODEL.to_string()),
    };

    let response = llm.complete(request).await?;
    let text = response.content.unwrap_or_default();
    Ok(parse_outcome(&text))
}

/// Unparseable verifier output is treated as a pass - verification is a
/// secondary signal, never a blocker on its own.
fn parse_outcome(text: &str) -> VerificationOutcome {
    let value = serde_json::from_str::<serde_json::Value>(text).ok().or_else(|| extract_json_object(text).and_then(|s| serde_json::from_str(&s).ok()));

    let Some(value) = value else {
        return VerificationOutcome::Passed;
    };

    let feedback = value.get("feedback").and_then(|v| v.as_str()).unwrap_or("").to_string();
    match value.get("outcome").and_then(|v| v.as_str()) {
        Some("gaps_found") => VerificationOutcome::GapsFound { feedback },
        Some("human_needed") => VerificationOutcome::HumanNeeded { feedback },
        _ => VerificationOutcome::Passed,
    }
}

fn extract_json_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        let ch = b as char;
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_passed_outcome() {
        let outcome = parse_outcome(r#"{"outcome": "passed", "feedback": ""}"#);
        assert_eq!(outcome, VerificationOutcome::Passed);
    }

    #[test]
    fn parses_gaps_found_with_feedback() {
        let outcome = parse_outcome(r#"{"outcome": "gaps_found", "feedback": "missing edge case"}"#);
        assert_eq!(outcome, VerificationOutcome::GapsFound { feedback: "missing edge case".to_string() });
    }

    #[test]
    fn recovers_json_wrapped_in_prose() {
        let outcome = parse_outcome("Here you go:\n```json\n{\"outcome\": \"human_needed\", \"feedback\": \"ambiguous spec\"}\n```");
        assert_eq!(outcome, VerificationOutcome::HumanNeeded { feedback: "ambiguous spec".to_string() });
    }

    #[test]
    fn unparseable_text_coerces_to_passed() {
        assert_eq!(parse_outcome("not json at all"), VerificationOutcome::Passed);
    }
}
