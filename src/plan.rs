//! Plan model - staged plan of stories and its progression rules
//!
//! A plan is an ordered list of stages; each stage carries an ordered list of
//! stories. Stages are worked in order, stories within the active stage in
//! order. A story terminates as passed or skipped; a stage is completed once
//! every story in it has terminated. Story identity is positional within its
//! stage, so splits splice in place and never reorder the remainder.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// The full staged plan, persisted pretty-printed as `plans/prd.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// A named group of stories with a mission statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,

    /// Prose goal for the stage, embedded into every developer prompt.
    #[serde(default)]
    pub mission: String,

    #[serde(default)]
    pub is_completed: bool,

    #[serde(default)]
    pub stories: Vec<Story>,
}

/// An atomic unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    /// Terminal success flag. Monotonic: never cleared except by plan replacement.
    #[serde(default)]
    pub passes: bool,

    /// Terminal skip flag, mutually exclusive with `passes`.
    #[serde(default)]
    pub is_skipped: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Set on stories produced by a subtask split, so they are never re-split.
    #[serde(default)]
    pub is_subtasked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    #[default]
    Standard,
}

impl Story {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: Priority::Standard,
            passes: false,
            is_skipped: false,
            skip_reason: None,
            is_subtasked: false,
        }
    }

    /// A story is terminal once either flag is set.
    pub fn is_terminal(&self) -> bool {
        self.passes || self.is_skipped
    }
}

impl Stage {
    /// First story with neither terminal flag, in order.
    pub fn active_story_index(&self) -> Option<usize> {
        self.stories.iter().position(|s| !s.is_terminal())
    }

    /// True iff every contained story has terminated.
    pub fn all_stories_terminal(&self) -> bool {
        self.stories.iter().all(|s| s.is_terminal())
    }

    pub fn passed_count(&self) -> usize {
        self.stories.iter().filter(|s| s.passes).count()
    }
}

impl Plan {
    /// First non-completed stage, in order.
    pub fn active_stage_index(&self) -> Option<usize> {
        self.stages.iter().position(|st| !st.is_completed)
    }

    pub fn is_complete(&self) -> bool {
        self.stages.iter().all(|st| st.is_completed)
    }

    pub fn total_stories(&self) -> usize {
        self.stages.iter().map(|st| st.stories.len()).sum()
    }

    pub fn passed_stories(&self) -> usize {
        self.stages.iter().map(|st| st.passed_count()).sum()
    }

    /// Mark the story at the given position as passed.
    pub fn mark_story_passed(&mut self, stage: usize, story: usize) -> Result<()> {
        let s = self.story_mut(stage, story)?;
        if s.is_skipped {
            bail!("story '{}' is already skipped", s.title);
        }
        s.passes = true;
        self.verify_invariants()
    }

    /// Mark the story at the given position as skipped, recording why.
    pub fn mark_story_skipped(&mut self, stage: usize, story: usize, reason: &str) -> Result<()> {
        let s = self.story_mut(stage, story)?;
        if s.passes {
            bail!("story '{}' has already passed", s.title);
        }
        s.is_skipped = true;
        s.skip_reason = Some(reason.to_string());
        self.verify_invariants()
    }

    /// Set the stage's completion flag iff all of its stories have terminated.
    /// Returns whether the flag was set.
    pub fn mark_stage_complete_if_done(&mut self, stage: usize) -> Result<bool> {
        let st = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| anyhow::anyhow!("no stage at index {stage}"))?;
        if !st.all_stories_terminal() {
            return Ok(false);
        }
        st.is_completed = true;
        self.verify_invariants()?;
        Ok(true)
    }

    /// Splice `subtasks` over the story at the given position, preserving the
    /// order of the surrounding stories. Each subtask starts non-terminal and
    /// is flagged as already split.
    pub fn replace_story(&mut self, stage: usize, story: usize, subtasks: Vec<Story>) -> Result<()> {
        if subtasks.is_empty() {
            bail!("refusing to replace a story with zero subtasks");
        }
        let st = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| anyhow::anyhow!("no stage at index {stage}"))?;
        if story >= st.stories.len() {
            bail!("no story at index {story} in stage '{}'", st.name);
        }
        let subtasks = subtasks.into_iter().map(|mut s| {
            s.passes = false;
            s.is_skipped = false;
            s.skip_reason = None;
            s.is_subtasked = true;
            s
        });
        st.stories.splice(story..story + 1, subtasks);
        self.verify_invariants()
    }

    /// Check the structural invariants: a completed stage has only terminal
    /// stories, and no story carries both terminal flags.
    pub fn verify_invariants(&self) -> Result<()> {
        for st in &self.stages {
            if st.is_completed && !st.all_stories_terminal() {
                bail!(
                    "stage '{}' is marked completed but has pending stories",
                    st.name
                );
            }
            for s in &st.stories {
                if s.passes && s.is_skipped {
                    bail!("story '{}' is both passed and skipped", s.title);
                }
            }
        }
        Ok(())
    }

    fn story_mut(&mut self, stage: usize, story: usize) -> Result<&mut Story> {
        self.stages
            .get_mut(stage)
            .and_then(|st| st.stories.get_mut(story))
            .ok_or_else(|| anyhow::anyhow!("no story at stage {stage}, index {story}"))
    }
}
