//! Deterministic prompt assembly.
//!
//! One prompt per turn, built from five blocks: system, role, repo
//! facts, inbox, instructions. Identical inputs produce byte-identical
//! output. The header hash (system + role) decides whether a resumed
//! session may receive only the delta (inbox + instructions).

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use ag_domain::{GlobalMode, Node, Run};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding agent inside an orchestrated multi-agent \
run. Work from the incoming messages and the instructions. To invoke a tool, emit one JSON \
object per line: {\"tool_call\":{\"id\":\"…\",\"name\":\"…\",\"args\":{…}}}. Available tools: \
command, read_file, write_file, list_files, delete_file, spawn_node, create_edge, send_handoff.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One rendered inbox item with provenance.
#[derive(Debug, Clone)]
pub struct InboxLine {
    /// Sender display ref: alias or node id, or `user`.
    pub sender: String,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One replayed transcript entry (bounded fallback when the provider
/// cannot resume).
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
}

pub struct PromptContext<'a> {
    pub run: &'a Run,
    pub node: &'a Node,
    pub role_template: Option<&'a str>,
    pub inbox: &'a [InboxLine],
    pub history: &'a [TranscriptEntry],
    /// Auto-mode tick with no new input.
    pub continue_tick: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct PromptBlocks {
    pub system: String,
    pub role: String,
    pub facts: String,
    pub inbox: String,
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct PromptArtifacts {
    pub blocks: PromptBlocks,
    /// All five blocks, used on full sends.
    pub full: String,
    /// Just the fresh input (inbox + instructions), used on resumed
    /// sessions with an unchanged header.
    pub delta: String,
    /// `sha256(system + role)` — header identity across turns.
    pub header_hash: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn build_prompt(ctx: &PromptContext<'_>) -> PromptArtifacts {
    let system = ctx
        .node
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());

    let role = match ctx.role_template {
        Some(template) if !template.trim().is_empty() => {
            format!("## Role\n{}", template.trim())
        }
        _ => String::new(),
    };

    let facts = render_facts(ctx);
    let inbox = render_inbox(ctx);
    let instructions = render_instructions(ctx);

    let header_hash = {
        let mut hasher = Sha256::new();
        hasher.update(system.as_bytes());
        hasher.update(role.as_bytes());
        format!("{:x}", hasher.finalize())
    };

    let full = join_blocks(&[&system, &role, &facts, &inbox, &instructions]);
    let delta = join_blocks(&[&inbox, &instructions]);

    PromptArtifacts {
        blocks: PromptBlocks {
            system,
            role,
            facts,
            inbox,
            instructions,
        },
        full,
        delta,
        header_hash,
    }
}

fn join_blocks(blocks: &[&str]) -> String {
    blocks
        .iter()
        .filter(|b| !b.is_empty())
        .copied()
        .collect::<Vec<&str>>()
        .join("\n\n")
}

fn render_facts(ctx: &PromptContext<'_>) -> String {
    let mut lines = vec!["## Context".to_owned()];
    lines.push(format!("- Working directory: {}", ctx.run.working_dir.display()));
    lines.push(format!(
        "- Mode: {}",
        match ctx.run.global_mode {
            GlobalMode::Planning => "planning (write documents only, no code changes)",
            GlobalMode::Implementation => "implementation",
        }
    ));
    lines.push(format!("- You are: {}", ctx.node.label));
    if let Some(alias) = &ctx.node.alias {
        lines.push(format!("- Your alias: {alias}"));
    }
    lines.join("\n")
}

fn render_inbox(ctx: &PromptContext<'_>) -> String {
    let mut sections = Vec::new();

    if !ctx.history.is_empty() {
        let mut lines = vec!["## Recent conversation".to_owned()];
        for entry in ctx.history {
            lines.push(format!("{}: {}", entry.role, entry.text));
        }
        sections.push(lines.join("\n"));
    }

    if !ctx.inbox.is_empty() {
        let mut lines = vec!["## Incoming messages".to_owned()];
        for item in ctx.inbox {
            lines.push(format!(
                "- [from {} at {}] {}",
                item.sender,
                item.at.to_rfc3339_opts(SecondsFormat::Secs, true),
                item.message
            ));
        }
        sections.push(lines.join("\n"));
    }

    sections.join("\n\n")
}

fn render_instructions(ctx: &PromptContext<'_>) -> String {
    let mut lines = vec!["## Instructions".to_owned()];
    if ctx.continue_tick && ctx.inbox.is_empty() {
        lines.push("Continue working toward the run's goal. If nothing remains, say so briefly.".into());
    } else {
        lines.push("Respond to the incoming messages.".into());
    }
    if ctx.run.global_mode == GlobalMode::Planning {
        lines.push("You are in planning mode: produce plans and documents, do not modify code.".into());
    }
    lines.join("\n")
}
