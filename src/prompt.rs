//! Prompt text for generation and repair.

use crate::guard::{PatchSet, ValidationLimits};
use crate::jobs::{AgentMode, EXECUTION_PLAN};

/// System instruction shared by every generation call.
pub fn system_instruction(limits: &ValidationLimits) -> String {
    let allowlist = limits
        .allowlist
        .iter()
        .map(|prefix| format!("`{}`", prefix))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are a senior software engineer producing a patch for an existing repository.

Respond with ONLY a JSON object of this exact shape, and nothing else:
{{"files": [{{"path": "src/example.ts", "content": "<full file content>"}}]}}

Rules:
- "path" is relative to the repository root and must start with one of: {allowlist}
- never use absolute paths, ".." segments, or anything under .git
- "content" is the COMPLETE new file, not a diff
- at most {max_files} files, each under {max_bytes} bytes
- list each path once
- preserve the existing coding style"#,
        allowlist = allowlist,
        max_files = limits.max_files,
        max_bytes = limits.max_bytes_per_file,
    )
}

fn plan_section() -> String {
    EXECUTION_PLAN
        .iter()
        .enumerate()
        .map(|(index, step)| {
            format!(
                "{}. {} [{}] - {}",
                index + 1,
                step.phase,
                step.role.as_str(),
                step.details
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First-pass prompt for an instruction.
pub fn build_execution_prompt(instruction: &str, context: Option<&str>, mode: AgentMode) -> String {
    let mut prompt = String::new();

    match mode {
        AgentMode::Solo => {
            prompt.push_str("You are the sole implementer of this change.\n\n");
        }
        AgentMode::Multi => {
            prompt.push_str("You are running an autonomous code-edit workflow.\n\n");
            prompt.push_str("Execution Plan (must follow in order):\n");
            prompt.push_str(&plan_section());
            prompt.push_str("\n\n");
        }
    }

    prompt.push_str("User Request:\n");
    prompt.push_str(instruction.trim());
    prompt.push_str("\n\n");

    if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("Retrieved Repository Context:\n");
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }

    prompt.push_str("Output Requirements:\n");
    prompt.push_str("- return production-ready code\n");
    prompt.push_str("- preserve existing coding style\n");
    prompt.push_str("- answer with the JSON patch object only");
    prompt
}

/// Follow-up prompt after checks failed on `current`.
pub fn build_repair_prompt(instruction: &str, error_context: &str, current: &PatchSet) -> String {
    let mut prompt = format!(
        "The previous patch for this request failed verification.\n\nUser Request:\n{}\n\nVerification Errors:\n{}\n\nPrevious Patch:\n",
        instruction.trim(),
        error_context.trim()
    );

    for file in &current.files {
        prompt.push_str(&format!("--- {}\n{}\n", file.path, file.content));
    }

    prompt.push_str(
        "\nReturn a corrected patch as the same JSON object. Include every file the fix needs, with full content.",
    );
    prompt
}
