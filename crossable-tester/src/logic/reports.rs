use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use colored::Colorize;
use serde::Serialize;
use std::io::Write;
use std::time::Duration;

use super::{PlayabilityAggregate, PlayabilityRecord, ScenarioResult};
use crate::common::format_cents;

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    scenarios: &'a [ScenarioResult],
    playability: &'a [PlayabilityAggregate],
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[allow(clippy::cast_precision_loss)]
fn success_rate(results: &[ScenarioResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let passed = results.iter().filter(|r| r.passed).count();
    (passed as f64 / results.len() as f64) * 100.0
}

pub fn generate_console_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[ScenarioResult],
    aggregates: &[PlayabilityAggregate],
    total_duration: Duration,
) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", "📊 Logic Test Results Summary".bright_cyan().bold())?;
    writeln!(out, "{}", "==============================".cyan())?;

    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    writeln!(out, "Total runs: {total}")?;
    writeln!(out, "Passed: {}", passed.to_string().green())?;
    writeln!(out, "Failed: {}", (total - passed).to_string().red())?;
    writeln!(out, "Success rate: {:.1}%", success_rate(results))?;
    writeln!(out, "Total time: {total_duration:?}")?;
    writeln!(out)?;

    for result in results {
        let status = if result.passed {
            "✅ PASS".green()
        } else {
            "❌ FAIL".red()
        };
        writeln!(
            out,
            "{status} {} (seed {})",
            result.scenario_name.bold(),
            result.seed
        )?;
        writeln!(
            out,
            "   Iterations: {}/{} successful",
            result.successful_iterations, result.iterations_run
        )?;
        writeln!(out, "   Average time: {:?}", result.average_duration)?;
        if !result.failures.is_empty() {
            writeln!(out, "   Failures:")?;
            for failure in &result.failures {
                writeln!(out, "     • {}", failure.red())?;
            }
        }
        writeln!(out)?;
    }

    if !aggregates.is_empty() {
        writeln!(out, "{}", "🎯 Playability Summary".bright_yellow().bold())?;
        writeln!(out, "{}", "=====================".yellow())?;
        writeln!(
            out,
            "{:<10} {:>6} {:>7} {:>9} {:>8} {:>9} {:>10} {:>9}",
            "difficulty", "target", "rounds", "mean RTP", "std", "expected", "collisions", "steps"
        )?;
        for agg in aggregates {
            writeln!(
                out,
                "{:<10} {:>6} {:>7} {:>9.4} {:>8.4} {:>9.4} {:>9.1}% {:>9.2}",
                agg.difficulty,
                agg.target_steps,
                agg.rounds,
                agg.mean_rtp,
                agg.std_rtp,
                agg.theoretical_rtp,
                agg.collision_rate * 100.0,
                agg.mean_steps
            )?;
        }
    }
    Ok(())
}

pub fn generate_json_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[ScenarioResult],
    aggregates: &[PlayabilityAggregate],
) -> Result<()> {
    let report = JsonReport {
        generated_at: timestamp(),
        scenarios: results,
        playability: aggregates,
    };
    serde_json::to_writer_pretty(&mut *out, &report)?;
    writeln!(out)?;
    Ok(())
}

pub fn generate_markdown_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[ScenarioResult],
    aggregates: &[PlayabilityAggregate],
) -> Result<()> {
    writeln!(out, "# Mission Crossable Logic Test Results\n")?;
    writeln!(out, "_Generated {}_\n", timestamp())?;

    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    writeln!(out, "## Summary\n")?;
    writeln!(out, "- **Total runs**: {total}")?;
    writeln!(out, "- **Passed**: {passed}")?;
    writeln!(out, "- **Failed**: {}", total - passed)?;
    writeln!(out, "- **Success rate**: {:.1}%\n", success_rate(results))?;

    writeln!(out, "## Detailed Results\n")?;
    for result in results {
        let status = if result.passed { "✅" } else { "❌" };
        writeln!(out, "### {status} {} (seed {})\n", result.scenario_name, result.seed)?;
        writeln!(
            out,
            "- **Iterations**: {}/{} successful",
            result.successful_iterations, result.iterations_run
        )?;
        writeln!(out, "- **Average time**: {:?}", result.average_duration)?;
        if !result.failures.is_empty() {
            writeln!(out, "- **Failures**:")?;
            for failure in &result.failures {
                writeln!(out, "  - {failure}")?;
            }
        }
        writeln!(out)?;
    }

    if !aggregates.is_empty() {
        writeln!(out, "## Playability\n")?;
        writeln!(
            out,
            "| Difficulty | Target | Rounds | Mean RTP | Expected RTP | Collision rate | Mean steps |"
        )?;
        writeln!(out, "|---|---:|---:|---:|---:|---:|---:|")?;
        for agg in aggregates {
            writeln!(
                out,
                "| {} | {} | {} | {:.4} | {:.4} | {:.1}% | {:.2} |",
                agg.difficulty,
                agg.target_steps,
                agg.rounds,
                agg.mean_rtp,
                agg.theoretical_rtp,
                agg.collision_rate * 100.0,
                agg.mean_steps
            )?;
        }
    }
    Ok(())
}

pub fn generate_csv_report<W: Write + ?Sized>(
    out: &mut W,
    records: &[PlayabilityRecord],
) -> Result<()> {
    writeln!(
        out,
        "difficulty,target_steps,seed,rounds,staked,returned,rtp,theoretical_rtp,collisions,steps_taken"
    )?;
    for record in records {
        writeln!(
            out,
            "{},{},{},{},{},{},{:.6},{:.6},{},{}",
            record.difficulty,
            record.target_steps,
            record.seed,
            record.rounds,
            format_cents(record.staked),
            format_cents(record.returned),
            record.rtp(),
            record.theoretical_rtp,
            record.collisions,
            record.steps_taken
        )?;
    }
    Ok(())
}
