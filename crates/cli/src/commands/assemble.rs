//! `contextloom assemble`: run one pipeline cycle over a session file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use contextloom_config::ContextStrategy;
use contextloom_engine::context::TokenAccountant;
use contextloom_engine::{ContextPipeline, PipelineOutput, RequestFrame};
use contextloom_telemetry::CycleSummary;

use super::{load_config, load_session};

pub struct AssembleOptions {
    pub session: PathBuf,
    pub budget: Option<usize>,
    pub level: u32,
    pub strategy: Option<String>,
    pub json: bool,
}

pub async fn run(config_path: Option<&Path>, options: AssembleOptions) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let snapshot = load_session(&options.session).await?;

    let tokens = TokenAccountant::from_config(&config.tokens, None);
    let frame = RequestFrame::from_config(&config);
    let mut pipeline = ContextPipeline::new(config, tokens);
    if let Some(budget) = options.budget {
        pipeline = pipeline.with_fixed_budget(budget);
    }
    if let Some(strategy) = &options.strategy {
        let strategy: ContextStrategy = strategy.parse().context("Invalid --strategy")?;
        pipeline = pipeline.with_strategy(strategy);
    }

    let output = pipeline
        .build(&snapshot, &frame, options.level, options.level as usize)
        .context("Context assembly failed")?;
    let summary = CycleSummary::from_records(&output.decisions);

    if options.json {
        let report = serde_json::json!({
            "session_id": snapshot.session_id,
            "level": output.level,
            "base_prompt_tokens": output.base_prompt_tokens,
            "context": output.context,
            "analysis": output.analysis,
            "summary": summary,
            "decisions": output.decisions,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&output, &summary);
    }
    Ok(())
}

fn print_report(output: &PipelineOutput, summary: &CycleSummary) {
    let context = &output.context;
    let budget = &context.budget;

    println!("🧵 Context assembly (level {}, {} strategy)", output.level, context.strategy);
    println!("─────────────────────────────────────────────────────");
    println!("  Model limit:    {}", budget.limit);
    println!("  Overhead:       {}", budget.reserved_overhead);
    println!("  Safety margin:  {}", budget.safety_margin);
    println!(
        "  Available:      {}{}",
        budget.available,
        if budget.floored { " (emergency floor)" } else { "" }
    );
    println!(
        "  Used:           {} ({:.1}%)",
        context.total_tokens,
        context.utilization() * 100.0
    );
    if context.bridge_tokens > 0 {
        println!("  Bridges:        {} tokens", context.bridge_tokens);
    }
    if context.budget_override {
        println!("  ⚠️  Active tool chain kept over budget");
    }
    if context.emergency {
        println!("  ⚠️  Emergency budget: history dropped");
    }

    println!();
    println!("{:<10} {:>9} {:>9} {:>10}", "Tier", "Reserved", "Used", "Clusters");
    for tier in &context.tiers {
        println!(
            "{:<10} {:>9} {:>9} {:>6}/{:<3}",
            tier.tier.to_string(),
            tier.reserved,
            tier.tokens,
            tier.clusters_included,
            tier.clusters_total
        );
    }

    println!();
    println!("Included items:");
    for item in &context.items {
        println!(
            "  {:<14} {:<8} {:>6}  {}",
            item.id.as_str(),
            item.priority_tier.to_string(),
            item.token_count,
            preview(&item.text, 60)
        );
    }

    if !context.omissions.is_empty() {
        println!();
        println!("Omitted:");
        for omission in &context.omissions {
            println!(
                "  cluster {:<4} {:>3} items {:>7} tokens  {}",
                omission.cluster,
                omission.item_ids.len(),
                omission.tokens,
                omission.reason
            );
        }
    }

    if !output.analysis.issues.is_empty() {
        println!();
        for issue in &output.analysis.issues {
            println!("  ⚠️  {issue}");
        }
    }

    println!();
    println!("  {summary}");
}

/// First line of `text`, shortened to `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut short: String = line.chars().take(max.saturating_sub(1)).collect();
    short.push('…');
    short
}
