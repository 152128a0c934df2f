//! Planning system prompts and JSON-plan parsing.

use crate::domain::PlanOutput;

/// Controls the Planner's expected output shape: `L1` is a flat task list,
/// `L2` adds phases and open questions, `L3` adds risk assessment and test
/// strategy. Read from a project's `config.planning_rigor`, defaulting to
/// `L2` when absent or unrecognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlanningRigor {
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl PlanningRigor {
    pub fn from_project_config(config: &serde_json::Value) -> Self {
        match config.get("planning_rigor").and_then(|v| v.as_str()) {
            Some("L1") => Self::L1,
            Some("L3") => Self::L3,
            _ => Self::L2,
        }
    }

    pub fn max_output_tokens(&self) -> u32 {
        match self {
            Self::L1 => 4096,
            Self::L2 => 6144,
            Self::L3 => 8192,
        }
    }
}

const PREAMBLE: &str = "You are a project planner for an AI orchestration engine. Your job is to analyze requirements and produce a structured execution plan.

Requirements are numbered [R1], [R2], etc. for traceability.

Task guidelines:
- Break work into small, focused tasks. Each task should be completable in a single AI conversation.
- Keep task descriptions self-contained, with enough context for a fresh AI instance.
- Use \"depends_on\" to reference the exact titles of prerequisite tasks.
- Prefer simple tasks when possible, since they use cheaper models.
- Use task_type \"research\" for information gathering that can run on a free local model.
- Use task_type \"analysis\" for summarization or comparison that can run locally.
- Use task_type \"asset\" for image or visual generation.
- Use task_type \"code\" for writing code or technical implementation.
- Use task_type \"integration\" for combining outputs from other tasks.
- Use task_type \"documentation\" for writing docs, READMEs, etc.
- Order tasks so independent work can run in parallel.
- Include verification_criteria: a concrete check to confirm task completion.
- Include affected_files: a best-guess list of files this task will create or modify.

";

const TASK_SCHEMA: &str = r#"{
      "title": "Short task title",
      "description": "Detailed description...",
      "task_type": "code|research|analysis|asset|integration|documentation",
      "complexity": "simple|medium|complex",
      "depends_on": [],
      "verification_criteria": "How to verify this task was completed correctly",
      "affected_files": ["src/auth.ts", "db/schema.sql"]
    }"#;

fn rigor_suffix(rigor: PlanningRigor) -> String {
    match rigor {
        PlanningRigor::L1 => format!(
            r#"Produce a JSON plan with this exact structure:
{{
  "summary": "Brief summary of what will be built",
  "tasks": [
    {TASK_SCHEMA}
  ]
}}

Aim for 3-15 tasks. Respond with ONLY the JSON plan, no markdown fences or explanation."#
        ),
        PlanningRigor::L2 => format!(
            r#"Produce a JSON plan organized into phases.
{{
  "summary": "Brief summary of what will be built",
  "phases": [
    {{
      "name": "Phase name",
      "description": "What this phase accomplishes",
      "tasks": [
        {TASK_SCHEMA}
      ]
    }}
  ],
  "open_questions": ["An ambiguity or decision in the requirements, with a proposed answer"]
}}

Group related tasks into 2-5 phases; earlier phases must not depend on later ones. Aim for 3-15 total tasks.
Respond with ONLY the JSON plan, no markdown fences or explanation."#
        ),
        PlanningRigor::L3 => format!(
            r#"Produce a thorough JSON plan organized into phases with risk analysis and test strategy.
{{
  "summary": "Brief summary of what will be built",
  "phases": [
    {{
      "name": "Phase name",
      "description": "What this phase accomplishes",
      "tasks": [
        {TASK_SCHEMA}
      ]
    }}
  ],
  "open_questions": ["An ambiguity or decision in the requirements, with a proposed answer"],
  "risks": ["A technical or schedule risk and its mitigation"],
  "test_strategy": "Overall testing approach and coverage notes"
}}

Group related tasks into 2-5 phases; earlier phases must not depend on later ones. Aim for 5-15 total tasks.
Respond with ONLY the JSON plan, no markdown fences or explanation."#
        ),
    }
}

pub fn system_prompt(rigor: PlanningRigor) -> String {
    format!("{PREAMBLE}{}", rigor_suffix(rigor))
}

/// Number requirement lines `[R1] ...`, `[R2] ...` for traceability, as the
/// prompt instructs the model to reference.
pub fn render_requirements(project_title: &str, requirements: &str) -> String {
    let numbered: Vec<String> = requirements
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| format!("[R{}] {}", i + 1, line.trim()))
        .collect();
    let body = if numbered.is_empty() { requirements.to_string() } else { numbered.join("\n") };
    format!("Project: {project_title}\n\nRequirements:\n{body}")
}

/// Parse `text` as a [`PlanOutput`], falling back to a balanced-brace scan
/// of the first `{...}` object when the model wrapped JSON in prose or
/// markdown fences.
pub fn parse_plan_json(text: &str) -> Option<PlanOutput> {
    if let Ok(output) = serde_json::from_str(text) {
        return Some(output);
    }
    let object_text = extract_json_object(text)?;
    serde_json::from_str(&object_text).ok()
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
