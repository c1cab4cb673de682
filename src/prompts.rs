//! Stage instruction templates.
//!
//! Each stage has a fixed system instruction (bound to its agent) and a user
//! template rendered from the request hints, the upstream stage's output and,
//! on refinement passes, the rejected candidate with its deficiencies.

use crate::gateway::Message;
use crate::pipeline::{GenerationRequest, Stage};

// =============================================================================
// Rendering inputs
// =============================================================================

/// The rejected candidate a refinement pass revises.
#[derive(Debug, Clone)]
pub struct RefinementContext<'a> {
    /// Pass being rendered, 2-based (pass 1 never has refinement context).
    pub attempt: u32,
    pub previous: &'a str,
    pub previous_score: f64,
    pub deficiencies: &'a [String],
}

/// Rendered prompt ready for an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub(crate) fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Templates
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct StageTemplate {
    pub stage: Stage,
    pub slug: &'static str,
    pub system: &'static str,
    /// Placeholders: `{brief}`, `{style}`, `{tone}`, `{audience}`, `{genre}`, `{upstream}`.
    pub user: &'static str,
    /// Tag wrapping the upstream text, if the stage consumes one.
    pub upstream_tag: Option<&'static str>,
}

impl StageTemplate {
    /// Render the user prompt. `upstream` is the previous stage's accepted output.
    pub fn render(
        &self,
        request: &GenerationRequest,
        upstream: Option<&str>,
        refinement: Option<&RefinementContext<'_>>,
    ) -> PromptInstance {
        let hint = |v: &Option<String>, fallback: &str| {
            escape_xml_chars(GenerationRequest::hint(v).unwrap_or(fallback))
        };

        let upstream_block = match (self.upstream_tag, upstream) {
            (Some(tag), Some(text)) => {
                format!("<{tag}>\n{}\n</{tag}>", escape_xml_chars(text.trim()))
            }
            _ => String::new(),
        };

        let core = self
            .user
            .replace("{genre}", &hint(&request.genre, "general fiction"))
            .replace("{audience}", &hint(&request.target_audience, "general"))
            .replace("{style}", &hint(&request.style, "clear, vivid"))
            .replace("{tone}", &hint(&request.tone, "consistent"))
            .replace("{brief}", &render_brief(request))
            .replace("{upstream}", &upstream_block);

        let mut parts = vec![core.trim().to_string()];
        if let Some(ctx) = refinement {
            parts.push(render_refinement(ctx));
        }

        PromptInstance {
            template_slug: self.slug,
            system: self.system.to_string(),
            user: parts.join("\n\n"),
        }
    }
}

fn render_brief(request: &GenerationRequest) -> String {
    let mut lines = vec![
        format!("Title: {}", escape_xml_chars(request.display_title())),
        format!(
            "Description: {}",
            escape_xml_chars(request.description.trim())
        ),
    ];
    let hints = [
        ("Genre", &request.genre),
        ("Target audience", &request.target_audience),
        ("Style", &request.style),
        ("Tone", &request.tone),
        ("Length", &request.length),
    ];
    for (label, value) in hints {
        if let Some(v) = GenerationRequest::hint(value) {
            lines.push(format!("{label}: {}", escape_xml_chars(v)));
        }
    }
    format!("<brief>\n{}\n</brief>", lines.join("\n"))
}

fn render_refinement(ctx: &RefinementContext<'_>) -> String {
    let deficiencies = if ctx.deficiencies.is_empty() {
        "- overall quality is below the bar; improve it across the board".to_string()
    } else {
        ctx.deficiencies
            .iter()
            .map(|d| format!("- {}", escape_xml_chars(d)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "This is revision pass {attempt}. Your previous attempt scored {score:.2}/10.\n\
<previous_attempt>\n{previous}\n</previous_attempt>\n\
<deficiencies>\n{deficiencies}\n</deficiencies>\n\
Revise the previous attempt to fix every deficiency while keeping what already works. \
Return only the revised text.",
        attempt = ctx.attempt,
        score = ctx.previous_score,
        previous = escape_xml_chars(ctx.previous.trim()),
    )
}

pub const OUTLINER_TEMPLATE: StageTemplate = StageTemplate {
    stage: Stage::Outliner,
    slug: "outliner_v1",
    system: "You are an expert book outliner. Create a detailed chapter-by-chapter outline \
with character arcs and plot points.",
    user: r#"As a master storyteller, create a detailed outline for a {genre} book from this brief:

{brief}

Include:
1. Story structure (three acts)
2. Major plot points
3. Character arcs
4. Key themes
5. World-building elements"#,
    upstream_tag: None,
};

pub const WRITER_TEMPLATE: StageTemplate = StageTemplate {
    stage: Stage::Writer,
    slug: "writer_v1",
    system: "You are a master writer. Transform this outline into engaging prose with rich \
descriptions and natural dialogue.",
    user: r#"Based on this outline:

{upstream}

{brief}

Write a compelling narrative that:
- Matches a {style} writing style
- Maintains a {tone} tone
- Engages {audience} readers
- Follows the conventions of {genre}"#,
    upstream_tag: Some("outline"),
};

pub const EDITOR_TEMPLATE: StageTemplate = StageTemplate {
    stage: Stage::Editor,
    slug: "editor_v1",
    system: "You are a meticulous editor. Refine this text for perfect pacing, consistency, \
and style.",
    user: r#"Edit this draft. Make the dialogue sound natural and reveal character, keep the plot moving, and hold a {tone} tone throughout.

{upstream}

{brief}

Return the full edited text."#,
    upstream_tag: Some("draft"),
};

pub const CRITIC_TEMPLATE: StageTemplate = StageTemplate {
    stage: Stage::Critic,
    slug: "critic_v1",
    system: "You are a comprehensive literary critic. Review the manuscript and return its \
final, polished form.",
    user: r#"Review and polish this manuscript for:
- Narrative consistency
- Character development
- Pacing and flow
- Emotional impact
- Technical accuracy

{upstream}

{brief}

Return only the final polished manuscript."#,
    upstream_tag: Some("manuscript"),
};

pub const TEMPLATES: &[StageTemplate] = &[
    OUTLINER_TEMPLATE,
    WRITER_TEMPLATE,
    EDITOR_TEMPLATE,
    CRITIC_TEMPLATE,
];

pub fn template_for(stage: Stage) -> &'static StageTemplate {
    match stage {
        Stage::Outliner => &OUTLINER_TEMPLATE,
        Stage::Writer => &WRITER_TEMPLATE,
        Stage::Editor => &EDITOR_TEMPLATE,
        Stage::Critic => &CRITIC_TEMPLATE,
    }
}

pub fn template_by_slug(slug: &str) -> Option<&'static StageTemplate> {
    TEMPLATES.iter().find(|t| t.slug == slug)
}

// =============================================================================
// TESTS
// =============================================================================
