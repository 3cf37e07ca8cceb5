//! Prompt assembly for the agent roles
//!
//! Templates stay close to plain text: the pipeline embeds everything the
//! model needs (mission, task, prior failures, workspace state) and the LLM
//! client appends the per-role output contract.

use crate::plan::{Priority, Stage, Story};
use crate::store::Lesson;

use super::context::{IterationContext, Strategy};

/// Keep the last `max` characters of a log, marking the cut.
pub fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max).collect();
    format!("... [Truncated] ...\n{kept}")
}

fn priority_label(p: Priority) -> &'static str {
    match p {
        Priority::Critical => "critical",
        Priority::Standard => "standard",
    }
}

pub fn developer_prompt(
    project: &str,
    stage: &Stage,
    story: &Story,
    ctx: &IterationContext,
) -> String {
    let strategy_note = match ctx.strategy {
        Strategy::Patch => {
            "Strategy: PATCH. Make the smallest change that completes the task; \
             preserve working code."
        }
        Strategy::Rewrite => {
            "Strategy: REWRITE. Previous patches kept failing; rewrite the files \
             involved in this task from scratch instead of patching them again."
        }
    };

    let manual_note = match &ctx.manual_note {
        Some(paths) => format!(
            "\n## MANUAL CHANGES\nUser modified: {paths}\nThese edits are intentional; build on them, never revert them.\n"
        ),
        None => String::new(),
    };

    let lessons_note = if ctx.lessons.is_empty() {
        String::new()
    } else {
        let items: Vec<String> = ctx
            .lessons
            .iter()
            .map(|l: &Lesson| format!("- ({} / {}) {}", l.stage, l.task, l.error))
            .collect();
        format!("\n## FAILURES TO AVOID\n{}\n", items.join("\n"))
    };

    let sources = if ctx.sources.is_empty() {
        "(no source files yet)".to_string()
    } else {
        let blocks: Vec<String> = ctx
            .sources
            .iter()
            .map(|(path, content)| format!("### {path}\n```\n{content}\n```"))
            .collect();
        blocks.join("\n\n")
    };

    format!(
        r#"# ROLE: DEVELOPER

You are the implementing developer on project "{project}".

## STAGE MISSION
{mission}

## CURRENT TASK: {title}
Priority: {priority}

{description}

{strategy_note}
{manual_note}{lessons_note}
## AGENT LOG (recent)
{agent_log}

## CURRENT ACTIVITY
{progress}

## PROJECT TREE
{tree}

## CURRENT SOURCE
{sources}

Complete the task now. When every requirement of the task is met, report it by
writing PROMISE_MET into progress.txt using a file block."#,
        project = project,
        mission = stage.mission,
        title = story.title,
        priority = priority_label(story.priority),
        description = story.description,
        strategy_note = strategy_note,
        manual_note = manual_note,
        lessons_note = lessons_note,
        agent_log = if ctx.agent_log.is_empty() {
            "(empty)"
        } else {
            &ctx.agent_log
        },
        progress = if ctx.progress.is_empty() {
            "(none)"
        } else {
            &ctx.progress
        },
        tree = ctx.tree,
        sources = sources,
    )
}

pub fn reviewer_prompt(mission: &str, story_title: &str, dev_result: &str, tree: &str) -> String {
    format!(
        r#"# ROLE: REVIEWER

Judge whether the developer's work completes the task below.

## STAGE MISSION
{mission}

## TASK
{story_title}

## DEVELOPER RESULT
{dev_result}

## PROJECT TREE (tail)
{tree}"#
    )
}

pub fn self_heal_prompt(original: &str, file: &str, error: &str) -> String {
    format!(
        r#"{original}

## SELF-HEALING
A file you emitted fails syntax validation and must be fixed before review.
File: {file}
Error: {error}

Re-emit the corrected file in full (plus any other files that must change with
it) using file blocks."#
    )
}

pub fn split_prompt(story: &Story) -> String {
    format!(
        r#"The following task is too large to implement in one pass.

Title: {title}
Description:
{description}

Break it into 3-5 sequential subtasks that together accomplish the whole task.
Respond with a JSON array only; each element is an object with "title" and
"description" string fields, ordered so earlier subtasks unblock later ones."#,
        title = story.title,
        description = story.description,
    )
}

pub fn plan_prompt(project: &str, description: &str) -> String {
    format!(
        r#"Design a staged implementation plan for the project described below.

Project name: {project}

## DESCRIPTION
{description}

Respond with a single JSON object of this shape:
{{
  "stages": [
    {{
      "name": "short stage name",
      "mission": "what this stage achieves",
      "stories": [
        {{"title": "task title", "description": "concrete, self-contained instructions", "priority": "critical" | "standard"}}
      ]
    }}
  ]
}}

Stages run strictly in order, stories within a stage in order. Mark a story
"critical" only when the project cannot proceed without it."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::{IterationContext, Strategy};
    use crate::plan::{Stage, Story};

    fn ctx() -> IterationContext {
        IterationContext {
            manual_note: Some("src/a.js".to_string()),
            agent_log: "did things".to_string(),
            progress: "working".to_string(),
            tree: "└── src\n".to_string(),
            sources: vec![("src/a.js".to_string(), "let a;".to_string())],
            lessons: vec![],
            strategy: Strategy::Patch,
        }
    }

    #[test]
    fn developer_prompt_names_the_manual_edits() {
        let stage = Stage {
            name: "S".to_string(),
            mission: "m".to_string(),
            is_completed: false,
            stories: vec![],
        };
        let prompt = developer_prompt("demo", &stage, &Story::new("t", "d"), &ctx());
        assert!(prompt.contains("User modified: src/a.js"));
        assert!(prompt.contains("PROMISE_MET"));
        assert!(prompt.contains("## CURRENT TASK: t"));
    }

    #[test]
    fn tail_marks_the_truncation() {
        let long = "x".repeat(50);
        let tailed = tail(&long, 10);
        assert!(tailed.starts_with("... [Truncated] ...\n"));
        assert!(tailed.ends_with(&"x".repeat(10)));
        assert_eq!(tail("short", 10), "short");
    }

    #[test]
    fn split_prompt_pins_the_array_contract() {
        let prompt = split_prompt(&Story::new("big", "lots of work"));
        assert!(prompt.contains("JSON array"));
        assert!(prompt.contains("3-5"));
    }
}
