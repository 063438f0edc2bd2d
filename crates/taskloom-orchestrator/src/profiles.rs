use crate::quality::RubricConfig;
use taskloom_core::{ModelTier, WorkerKind};

/// Configuration for one specialized worker agent.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    /// Worker kind this profile configures.
    pub kind: WorkerKind,
    /// System prompt handed to the job queue.
    pub system_prompt: String,
    /// Cost tier for generation calls.
    pub tier: ModelTier,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token budget.
    pub max_tokens: u32,
    /// Rubric the quality gate scores this kind against. `None` auto-passes.
    pub rubric: Option<RubricConfig>,
}

/// Default profiles for every known worker kind.
pub fn default_profiles() -> Vec<WorkerProfile> {
    vec![
        research_profile(),
        design_profile(),
        code_profile(),
        media_profile(),
        review_profile(),
    ]
}

fn research_profile() -> WorkerProfile {
    WorkerProfile {
        kind: WorkerKind::Research,
        system_prompt: RESEARCH_PROMPT.to_string(),
        tier: ModelTier::Standard,
        temperature: 0.3,
        max_tokens: 4096,
        rubric: Some(RubricConfig {
            criteria: vec![
                "Claims are supported by named sources".to_string(),
                "Coverage addresses every aspect of the assigned task".to_string(),
                "No fabricated references or statistics".to_string(),
            ],
            min_length: 300,
            ..RubricConfig::default()
        }),
    }
}

fn design_profile() -> WorkerProfile {
    WorkerProfile {
        kind: WorkerKind::Design,
        system_prompt: DESIGN_PROMPT.to_string(),
        tier: ModelTier::Standard,
        temperature: 0.5,
        max_tokens: 4096,
        rubric: Some(RubricConfig {
            criteria: vec![
                "Structure is explicit and navigable".to_string(),
                "Decisions include their rationale".to_string(),
                "Interfaces between sections are defined".to_string(),
            ],
            required_sections: vec!["## Overview".to_string()],
            min_length: 300,
            ..RubricConfig::default()
        }),
    }
}

fn code_profile() -> WorkerProfile {
    WorkerProfile {
        kind: WorkerKind::Code,
        system_prompt: CODE_PROMPT.to_string(),
        tier: ModelTier::Premium,
        temperature: 0.2,
        max_tokens: 8192,
        rubric: Some(RubricConfig {
            criteria: vec![
                "Code is complete and self-consistent".to_string(),
                "Error paths are handled, not ignored".to_string(),
                "Matches the specification it was given".to_string(),
            ],
            min_length: 100,
            ..RubricConfig::default()
        }),
    }
}

fn media_profile() -> WorkerProfile {
    WorkerProfile {
        kind: WorkerKind::Media,
        system_prompt: MEDIA_PROMPT.to_string(),
        tier: ModelTier::Standard,
        temperature: 0.7,
        max_tokens: 2048,
        rubric: Some(RubricConfig {
            criteria: vec![
                "Asset briefs are concrete enough to produce from".to_string(),
                "Dimensions, formats, and tone are specified".to_string(),
            ],
            min_length: 150,
            ..RubricConfig::default()
        }),
    }
}

fn review_profile() -> WorkerProfile {
    WorkerProfile {
        kind: WorkerKind::Review,
        system_prompt: REVIEW_PROMPT.to_string(),
        tier: ModelTier::Standard,
        temperature: 0.3,
        max_tokens: 2048,
        // The reviewer is itself an evaluator; its output is not re-gated.
        rubric: None,
    }
}

/// Default rubric used to gate the integrated document.
pub fn integration_rubric() -> RubricConfig {
    RubricConfig {
        criteria: vec![
            "Every completed worker's contribution is represented".to_string(),
            "The document reads as one coherent piece, not a concatenation".to_string(),
            "No contradictions between sections".to_string(),
        ],
        min_length: 300,
        ..RubricConfig::default()
    }
}

const RESEARCH_PROMPT: &str = "\
You are the Research worker in a multi-agent content pipeline. Gather and \
summarize background material for the assigned task.

Rules:
1. Name your sources; never invent references.
2. Separate established facts from interpretation.
3. Cover the whole task, flagging gaps you could not fill.
4. Output plain Markdown, no tool calls.
";

const DESIGN_PROMPT: &str = "\
You are the Design worker in a multi-agent content pipeline. Produce design \
documents and structural outlines for the assigned task.

Rules:
1. Start with an `## Overview` section.
2. State every decision together with its rationale.
3. Define the interfaces between the parts you outline.
4. Output plain Markdown, no tool calls.
";

const CODE_PROMPT: &str = "\
You are the Code worker in a multi-agent content pipeline. Generate code \
artifacts for the assigned task.

Rules:
1. Follow the design context you are given.
2. Handle error paths; do not leave stubs or TODO placeholders.
3. Put code in fenced blocks with file paths as comments.
4. Output plain Markdown, no tool calls.
";

const MEDIA_PROMPT: &str = "\
You are the Media worker in a multi-agent content pipeline. Produce asset \
briefs (imagery, diagrams, audio) for the assigned task.

Rules:
1. Make each brief concrete: subject, dimensions, format, tone.
2. Tie every asset to the section of the deliverable it supports.
3. Output plain Markdown, no tool calls.
";

const REVIEW_PROMPT: &str = "\
You are the Review worker in a multi-agent content pipeline. Critique the \
material you are given for accuracy, coherence, and completeness.

Rules:
1. List concrete findings, most severe first.
2. Distinguish blocking problems from polish suggestions.
3. Output plain Markdown, no tool calls.
";

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_kind_has_a_profile() {
        let profiles = default_profiles();
        for kind in WorkerKind::known() {
            assert!(
                profiles.iter().any(|p| p.kind == kind),
                "missing profile for {kind}"
            );
        }
    }

    #[test]
    fn test_profiles_have_prompts() {
        for profile in default_profiles() {
            assert!(!profile.system_prompt.is_empty());
        }
    }

    #[test]
    fn test_review_worker_is_not_self_gated() {
        let review = default_profiles()
            .into_iter()
            .find(|p| p.kind == WorkerKind::Review)
            .unwrap();
        assert!(review.rubric.is_none());
    }

    #[test]
    fn test_code_worker_low_temperature() {
        let code = default_profiles()
            .into_iter()
            .find(|p| p.kind == WorkerKind::Code)
            .unwrap();
        assert!(code.temperature <= 0.3);
    }
}
