//! Typed stage outputs and the shared pipeline context.
//!
//! `PipelineContext` accumulates the outputs of completed stages in
//! append-only fashion: each field has a single writer (the orchestrator,
//! between stages) and becomes immutable once published. A stage only ever
//! reads fields produced by stages that precede it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Minimal variables inferred from the user's brief (stage 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Variables {
    pub title: String,
    pub contract_type: String,
    pub jurisdiction: String,
    pub parties: Vec<String>,
}

impl Variables {
    /// Fill in GENERAL defaults for anything the model left out and pad the
    /// party list to exactly two entries.
    pub fn normalized(mut self) -> Self {
        if self.title.trim().is_empty() {
            self.title = "Agreement".to_string();
        }
        if self.contract_type.trim().is_empty() {
            self.contract_type = "Agreement".to_string();
        }
        if self.jurisdiction.trim().is_empty() {
            self.jurisdiction = "Applicable Law".to_string();
        }
        self.parties.retain(|p| !p.trim().is_empty());
        while self.parties.len() < 2 {
            let placeholder = if self.parties.is_empty() {
                "Party A"
            } else {
                "Party B"
            };
            self.parties.push(placeholder.to_string());
        }
        self.parties.truncate(2);
        self
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self {
            title: "Agreement".to_string(),
            contract_type: "Agreement".to_string(),
            jurisdiction: "Applicable Law".to_string(),
            parties: vec!["Party A".to_string(), "Party B".to_string()],
        }
    }
}

/// Private drafting guidance (stage 2). The HTML is model-facing context
/// only; the notes are a short advisory summary kept consistent across all
/// later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    pub html: String,
    #[serde(default)]
    pub notes: String,
}

/// One section descriptor from the outline (stage 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionPlan {
    #[serde(default)]
    pub number: String,
    pub title: String,
    #[serde(default = "default_target_words")]
    pub target_words: u32,
    #[serde(default)]
    pub bullets: Vec<String>,
}

fn default_target_words() -> u32 {
    260
}

impl SectionPlan {
    /// The literal "Definitions" section is never used as the anchor.
    pub fn is_definitions(&self) -> bool {
        self.title.trim().eq_ignore_ascii_case("definitions")
    }
}

/// Front matter, global definitions, and the shared drafting context string
/// (stage 4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstPart {
    pub html: String,
    #[serde(default)]
    pub context: String,
}

/// Immutable read-only context handed to every section drafting task once
/// the anchor section has been published. Section workers may read it
/// concurrently; nothing in it changes after construction.
#[derive(Debug, Clone)]
pub struct SectionContext {
    pub variables: Variables,
    pub guidance_html: String,
    pub first_part_html: String,
    pub shared_context: String,
    /// HTML of the anchor section; empty while drafting the anchor itself.
    pub anchor_html: String,
}

/// Append-only record of everything the pipeline has produced for a job.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub prompt: String,
    variables: Option<Variables>,
    guidance: Option<Guidance>,
    outline: Option<Vec<SectionPlan>>,
    first_part: Option<FirstPart>,
    anchor_index: Option<usize>,
    sections: BTreeMap<usize, String>,
    final_html: Option<String>,
}

impl PipelineContext {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn publish_variables(&mut self, variables: Variables) {
        debug_assert!(self.variables.is_none(), "variables published twice");
        self.variables = Some(variables);
    }

    pub fn publish_guidance(&mut self, guidance: Guidance) {
        debug_assert!(self.guidance.is_none(), "guidance published twice");
        self.guidance = Some(guidance);
    }

    pub fn publish_outline(&mut self, outline: Vec<SectionPlan>) {
        debug_assert!(self.outline.is_none(), "outline published twice");
        self.outline = Some(outline);
    }

    pub fn publish_first_part(&mut self, first_part: FirstPart) {
        debug_assert!(self.first_part.is_none(), "first part published twice");
        self.first_part = Some(first_part);
    }

    /// Record a drafted section by outline position. The anchor is recorded
    /// first; each index is written exactly once.
    pub fn publish_section(&mut self, index: usize, html: String) {
        debug_assert!(
            !self.sections.contains_key(&index),
            "section {index} published twice"
        );
        if self.sections.is_empty() {
            self.anchor_index = Some(index);
        }
        self.sections.insert(index, html);
    }

    pub fn publish_final_html(&mut self, html: String) {
        debug_assert!(self.final_html.is_none(), "final HTML published twice");
        self.final_html = Some(html);
    }

    pub fn variables(&self) -> Option<&Variables> {
        self.variables.as_ref()
    }

    pub fn guidance(&self) -> Option<&Guidance> {
        self.guidance.as_ref()
    }

    pub fn outline(&self) -> Option<&[SectionPlan]> {
        self.outline.as_deref()
    }

    pub fn first_part(&self) -> Option<&FirstPart> {
        self.first_part.as_ref()
    }

    pub fn anchor_index(&self) -> Option<usize> {
        self.anchor_index
    }

    /// Drafted sections keyed by outline position, iterated in outline order.
    pub fn sections(&self) -> &BTreeMap<usize, String> {
        &self.sections
    }

    pub fn final_html(&self) -> Option<&str> {
        self.final_html.as_deref()
    }
}
