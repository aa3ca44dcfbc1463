//! `contextloom analyze`: show the structure the analyzer and correlator see.

use std::path::Path;

use contextloom_core::item::PriorityTier;
use contextloom_engine::context::{
    ContentPrioritizer, DependencyCorrelator, HistoryAnalyzer, ScoringContext, TokenAccountant,
};

use super::assemble::preview;
use super::{load_config, load_session};

pub async fn run(config_path: Option<&Path>, session: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let snapshot = load_session(session).await?;
    let tokens = TokenAccountant::from_config(&config.tokens, None);

    let mut analysis = HistoryAnalyzer::new(&tokens).analyze(snapshot.turns());
    let query = analysis.current_user_message.as_ref().map(|m| m.content.clone());
    let scoring = ScoringContext::build(&analysis.items, query.as_deref(), analysis.current_turn);
    ContentPrioritizer::new(config.scoring.clone()).prioritize(&mut analysis.items, &scoring);
    let correlation = DependencyCorrelator::new(config.correlation.clone()).correlate(&analysis.items);

    if json {
        let issues: Vec<String> = analysis.issues.iter().map(|e| e.to_string()).collect();
        let report = serde_json::json!({
            "session_id": snapshot.session_id,
            "current_turn": analysis.current_turn,
            "items": analysis.items,
            "tool_chains": analysis.tool_chains,
            "segments": analysis.segments,
            "references": correlation.references,
            "clusters": correlation.clusters,
            "issues": issues,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let total: usize = analysis.items.iter().map(|i| i.token_count).sum();
    println!("🔎 Session {} ({} turns)", snapshot.session_id, snapshot.len());
    println!("─────────────────────────────────────────────────────");
    println!("  Items:          {} ({total} tokens, {})", analysis.items.len(), tokens.strategy());
    println!("  Current turn:   {}", analysis.current_turn);
    if let Some(message) = &analysis.current_user_message {
        println!("  Current query:  {}", preview(&message.content, 60));
    }

    let mut per_tier = [0usize; 5];
    for item in &analysis.items {
        per_tier[item.priority_tier.index()] += 1;
    }
    println!();
    println!("Tiers:");
    for tier in PriorityTier::ALL {
        println!("  {:<10} {:>5}", tier.to_string(), per_tier[tier.index()]);
    }

    println!();
    println!("Tool chains ({}):", analysis.tool_chains.len());
    for chain in &analysis.tool_chains {
        println!(
            "  {:<10} {:<9} turns {}-{}  {}",
            chain.id,
            format!("{:?}", chain.state).to_lowercase(),
            chain.start_turn,
            chain.end_turn,
            chain.tool_names.join(" → ")
        );
    }

    println!();
    println!("Segments ({}):", analysis.segments.len());
    for segment in &analysis.segments {
        println!(
            "  #{:<3} turns {}-{}  {} items{}",
            segment.index,
            segment.start_turn,
            segment.end_turn,
            segment.items.len(),
            if segment.completed { "  (completed)" } else { "" }
        );
    }

    println!();
    println!(
        "Dependencies: {} references, {} clusters",
        correlation.references.len(),
        correlation.clusters.len()
    );
    for cluster in correlation.clusters.iter().filter(|c| c.members.len() > 1) {
        println!(
            "  cluster {:<4} {:<8} {:>3} items {:>7} tokens{}",
            cluster.id,
            cluster.tier.to_string(),
            cluster.members.len(),
            cluster.token_count,
            if cluster.has_active_chain { "  (active chain)" } else { "" }
        );
    }
    if let Some(timeout) = &correlation.timeout {
        println!("  ⚠️  {timeout}");
    }

    for issue in &analysis.issues {
        println!("  ⚠️  {issue}");
    }
    Ok(())
}
