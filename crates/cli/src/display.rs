//! Plain-text and markdown rendering for runs, chains and memory listings.

use std::fmt::Write as _;

use agent::{ChainReport, RefinementReport};
use proto::{Conversation, MemoryStats, RunRecord};

const RULE: &str = "============================================================";
const PREVIEW_CHARS: usize = 80;

fn banner(out: &mut String, title: &str) {
    let _ = writeln!(out, "{RULE}\n{title}\n{RULE}");
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

fn record_details(out: &mut String, record: &RunRecord) {
    let _ = writeln!(out, "Model: {}", record.model);
    if record.fallback_used {
        let original = record.original_model.as_deref().unwrap_or("unknown");
        let _ = writeln!(out, "⚠️  Fallback: {original} → {}", record.model);
        if let Some(reason) = &record.fallback_reason {
            let _ = writeln!(out, "   Reason: {reason}");
        }
    }
    let _ = writeln!(out, "Duration: {:.0}ms", record.duration_ms);
    let _ = writeln!(
        out,
        "Tokens: {} (prompt {}, completion {})",
        record.total_tokens, record.prompt_tokens, record.completion_tokens
    );
    if !record.log_file.is_empty() {
        let _ = writeln!(out, "Log: {}", record.log_file);
    }
    out.push('\n');
    if let Some(error) = &record.error {
        let _ = writeln!(out, "❌ Error: {error}");
    } else if record.response.trim().is_empty() {
        out.push_str("[No response]\n");
    } else {
        let _ = writeln!(out, "{}", record.response.trim_end());
    }
}

/// Output of `mao run`.
pub fn render_run(record: &RunRecord) -> String {
    let mut out = String::new();
    banner(&mut out, &format!("AGENT: {}", record.agent.to_uppercase()));
    record_details(&mut out, record);
    out
}

/// One chain stage, `index` 1-based.
pub fn render_stage(index: usize, total: usize, record: &RunRecord) -> String {
    let mut out = String::new();
    banner(
        &mut out,
        &format!("STAGE {index}/{total}: {}", record.agent.to_uppercase()),
    );
    record_details(&mut out, record);
    out
}

pub fn render_chain_summary(report: &ChainReport) -> String {
    let mut out = String::new();
    banner(&mut out, "CHAIN SUMMARY");
    let completed = report.stages.iter().filter(|r| !r.is_error()).count();
    let total_ms = report.total_duration_ms();
    let _ = writeln!(out, "Stages completed: {completed}/{}", report.stages.len());
    let _ = writeln!(out, "Total duration: {total_ms:.0}ms ({:.1}s)", total_ms / 1000.0);
    let _ = writeln!(out, "Total tokens: {}", report.total_tokens());
    let errors = report.errors();
    if !errors.is_empty() {
        out.push_str("Errors:\n");
        for (agent, error) in errors {
            let _ = writeln!(out, "  - {agent}: {error}");
        }
    }
    out
}

/// Markdown report written by `mao chain -o`.
pub fn render_chain_markdown(report: &ChainReport) -> String {
    let mut out = String::from("# Chain Execution Report\n\n");
    let _ = writeln!(out, "**Prompt:** {}\n", report.prompt);
    let stages: Vec<&str> = report.stages.iter().map(|r| r.agent.as_str()).collect();
    let _ = writeln!(out, "**Stages:** {}\n", stages.join(" → "));
    let _ = writeln!(out, "**Total tokens:** {}\n", report.total_tokens());
    let _ = writeln!(out, "**Total duration:** {:.0}ms\n", report.total_duration_ms());

    for (i, record) in report.stages.iter().enumerate() {
        let _ = writeln!(out, "---\n\n## Stage {}: {}\n", i + 1, record.agent);
        let _ = writeln!(out, "- **Model:** {}", record.model);
        if let (true, Some(original)) = (record.fallback_used, &record.original_model) {
            let _ = writeln!(out, "- **Fallback from:** {original}");
        }
        let _ = writeln!(out, "- **Duration:** {:.0}ms", record.duration_ms);
        let _ = writeln!(out, "- **Tokens:** {}\n", record.total_tokens);
        match &record.error {
            Some(error) => {
                let _ = writeln!(out, "**Error:** {error}\n");
            }
            None => {
                let _ = writeln!(out, "{}\n", record.response.trim_end());
            }
        }
    }
    out
}

/// Output of `mao refine` after the stages have been printed.
pub fn render_refinement(report: &RefinementReport) -> String {
    let mut out = String::new();
    banner(&mut out, "REFINEMENT SUMMARY");
    if report.iterations.is_empty() {
        out.push_str("Refinement disabled; ran the default chain.\n");
    }
    for iteration in &report.iterations {
        let issues = iteration
            .issues
            .as_deref()
            .map_or(0, agent::convergence::count_issues);
        let _ = writeln!(
            out,
            "Iteration {}: {} critical issue(s). {}",
            iteration.iteration, issues, iteration.decision.reason
        );
    }
    let _ = writeln!(out, "Converged: {}", if report.converged { "yes" } else { "no" });
    let _ = writeln!(out, "Total tokens: {}", report.total_tokens());
    out.push('\n');
    banner(&mut out, "FINAL OUTPUT");
    if report.final_output.trim().is_empty() {
        out.push_str("[No response]\n");
    } else {
        let _ = writeln!(out, "{}", report.final_output.trim_end());
    }
    out
}

pub fn render_stats(stats: &MemoryStats) -> String {
    let mut out = String::new();
    banner(&mut out, "MEMORY STATS");
    let _ = writeln!(out, "Conversations: {}", stats.total_conversations);
    let _ = writeln!(out, "Total tokens: {}", stats.total_tokens);
    let _ = writeln!(out, "Total cost: ${:.4}", stats.total_cost_usd);
    for (title, buckets) in [("By agent", &stats.by_agent), ("By model", &stats.by_model)] {
        if buckets.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{title}:");
        for (name, bucket) in buckets {
            let _ = writeln!(
                out,
                "  {name}: {} conversation(s), {} tokens, ${:.4}",
                bucket.conversations, bucket.tokens, bucket.cost_usd
            );
        }
    }
    out
}

/// One line per conversation.
pub fn render_conversation_list(conversations: &[Conversation]) -> String {
    if conversations.is_empty() {
        return "No conversations found.\n".to_string();
    }
    let mut out = String::new();
    for conv in conversations {
        let _ = writeln!(
            out,
            "#{:<5} {}  {:<20} {}",
            conv.id,
            conv.timestamp.format("%Y-%m-%d %H:%M"),
            conv.agent,
            preview(&conv.prompt, PREVIEW_CHARS)
        );
    }
    out
}

pub fn render_conversation(conv: &Conversation) -> String {
    let mut out = String::new();
    banner(&mut out, &format!("CONVERSATION #{}", conv.id));
    let _ = writeln!(out, "Time: {}", conv.timestamp.to_rfc3339());
    let _ = writeln!(out, "Agent: {}", conv.agent);
    let _ = writeln!(out, "Model: {} ({})", conv.model, conv.provider);
    let _ = writeln!(out, "Tokens: {}  Cost: ${:.4}", conv.total_tokens, conv.cost_usd);
    if let Some(session) = &conv.session_id {
        let _ = writeln!(out, "Session: {session}");
    }
    let _ = writeln!(out, "Embedding: {}", if conv.embedding.is_some() { "yes" } else { "no" });
    let _ = writeln!(out, "\nPrompt:\n{}\n\nResponse:\n{}", conv.prompt, conv.response);
    out
}
