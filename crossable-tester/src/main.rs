mod common;
mod logic;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use crossable_game::{DifficultyCatalog, standard_catalog};
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

use common::scenario::{get_scenario, list_scenarios, scenario_names};
use common::split_csv;
use logic::{
    LogicTester, PlayabilityAggregate, PlayabilityRecord, ScenarioResult, SeedInfo,
    aggregate_playability, resolve_seed_inputs, run_playability_analysis,
    validate_playability_targets,
};

#[derive(Debug, Parser)]
#[command(name = "crossable-tester", version)]
#[command(about = "Automated QA and return-to-player analysis for the Mission Crossable engine")]
struct Args {
    /// Scenarios to run (comma-separated, or `all`)
    #[arg(long, default_value = "smoke")]
    scenarios: String,

    /// List all available scenarios and exit
    #[arg(long)]
    list_scenarios: bool,

    /// Seeds to run (comma-separated integers, `0x` hex, or `random`)
    #[arg(long, default_value = "1337")]
    seeds: String,

    /// Number of iterations per scenario and seed
    #[arg(long, default_value_t = 10)]
    iterations: usize,

    /// Output report format
    #[arg(long, default_value = "console")]
    #[arg(value_parser = ["json", "markdown", "console", "csv"])]
    report: String,

    /// Optional path to write the report output instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Difficulty table to load instead of the built-in one
    #[arg(long)]
    difficulties: Option<PathBuf>,

    /// Skip the return-to-player sweep
    #[arg(long)]
    skip_playability: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if maybe_list_scenarios(&args)? {
        return Ok(());
    }

    announce_banner();

    let start_time = Instant::now();
    let catalog = Arc::new(load_catalog(args.difficulties.as_deref())?);
    let scenarios = expand_scenarios(&args.scenarios);
    let seed_infos = resolve_seed_inputs(&split_csv(&args.seeds))?;
    let logic_seeds: Vec<u64> = seed_infos.iter().map(|s| s.seed).collect();

    let results =
        run_logic_scenarios(&args, &scenarios, &logic_seeds, Arc::clone(&catalog)).await?;

    let (playability_records, playability_aggregates) =
        gather_playability(&args, &catalog, &seed_infos)?;

    write_reports(
        &args,
        &results,
        playability_records.as_deref(),
        playability_aggregates.as_deref(),
        start_time,
    )?;

    if let Some(aggregates) = playability_aggregates.as_ref() {
        let record_slice = playability_records.as_deref().unwrap_or(&[]);
        validate_playability_targets(aggregates, record_slice)?;
    }

    if results.iter().any(|r| !r.passed) {
        std::process::exit(1);
    }

    Ok(())
}

fn maybe_list_scenarios(args: &Args) -> Result<bool> {
    if !args.list_scenarios {
        return Ok(false);
    }
    let mut output_target = OutputTarget::new(args.output.clone())?;
    writeln!(output_target.writer(), "Available scenarios:")?;
    for (key, description) in list_scenarios() {
        writeln!(output_target.writer(), "  {key:20} - {description}")?;
    }
    output_target.flush_inner()?;
    Ok(true)
}

fn announce_banner() {
    println!("{}", "🐔 Mission Crossable Tester".bright_cyan().bold());
    println!("{}", "===========================".cyan());
}

fn load_catalog(path: Option<&Path>) -> Result<DifficultyCatalog> {
    let Some(path) = path else {
        return Ok(standard_catalog().clone());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let catalog = DifficultyCatalog::from_json(&json)
        .with_context(|| format!("invalid difficulty table in {}", path.display()))?;
    log::info!(
        "loaded {} difficulties from {}",
        catalog.len(),
        path.display()
    );
    Ok(catalog)
}

fn expand_scenarios(scenarios_arg: &str) -> Vec<String> {
    let mut scenarios = split_csv(scenarios_arg);
    if scenarios.iter().any(|s| s.eq_ignore_ascii_case("all")) {
        scenarios.retain(|s| !s.eq_ignore_ascii_case("all"));
        for name in scenario_names() {
            if !scenarios.contains(&name) {
                scenarios.push(name);
            }
        }
    }
    scenarios
}

async fn run_logic_scenarios(
    args: &Args,
    scenarios: &[String],
    logic_seeds: &[u64],
    catalog: Arc<DifficultyCatalog>,
) -> Result<Vec<ScenarioResult>> {
    println!("{}", "🧠 Running Logic Tests".bright_yellow().bold());
    println!("{}", "-".repeat(30).yellow());

    let tester = LogicTester::new(catalog, args.verbose);
    let mut tasks = JoinSet::new();

    for (order, scenario_name) in scenarios.iter().enumerate() {
        let Some(scenario) = get_scenario(scenario_name) else {
            eprintln!("⚠️  Unknown scenario: {}", scenario_name.yellow());
            continue;
        };
        let tester = tester.clone();
        let seeds = logic_seeds.to_vec();
        let iterations = args.iterations;
        tasks.spawn_blocking(move || (order, tester.run_scenario(&scenario, &seeds, iterations)));
    }

    let mut batches = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        batches.push(joined.context("scenario worker panicked")?);
    }
    batches.sort_by_key(|(order, _)| *order);
    Ok(batches.into_iter().flat_map(|(_, results)| results).collect())
}

type PlayabilitySummary = (
    Option<Vec<PlayabilityRecord>>,
    Option<Vec<PlayabilityAggregate>>,
);

fn gather_playability(
    args: &Args,
    catalog: &DifficultyCatalog,
    seed_infos: &[SeedInfo],
) -> Result<PlayabilitySummary> {
    if args.skip_playability {
        return Ok((None, None));
    }
    let records = run_playability_analysis(catalog, seed_infos, args.iterations)?;
    let aggregates = aggregate_playability(&records);
    Ok((Some(records), Some(aggregates)))
}

fn write_reports(
    args: &Args,
    results: &[ScenarioResult],
    playability_records: Option<&[PlayabilityRecord]>,
    playability_aggregates: Option<&[PlayabilityAggregate]>,
    start_time: Instant,
) -> Result<()> {
    let mut output_target = OutputTarget::new(args.output.clone())?;
    let aggregates = playability_aggregates.unwrap_or(&[]);

    match args.report.as_str() {
        "json" => logic::reports::generate_json_report(&mut output_target, results, aggregates)?,
        "markdown" => {
            if results.is_empty() && aggregates.is_empty() {
                writeln!(
                    &mut output_target,
                    "# Mission Crossable Logic Test Results\n\n_No scenarios executed._"
                )?;
            } else {
                logic::reports::generate_markdown_report(&mut output_target, results, aggregates)?;
            }
        }
        "csv" => {
            if let Some(records) = playability_records {
                logic::reports::generate_csv_report(&mut output_target, records)?;
            } else {
                writeln!(&mut output_target, "Playability data unavailable.")?;
            }
        }
        _ => {
            if results.is_empty() {
                writeln!(&mut output_target, "No logic scenarios executed.")?;
            }
            if playability_aggregates.is_none() {
                writeln!(&mut output_target, "Playability data unavailable.")?;
            }
            logic::reports::generate_console_report(
                &mut output_target,
                results,
                aggregates,
                start_time.elapsed(),
            )?;
        }
    }

    if matches!(args.report.as_str(), "console" | "markdown") {
        let duration = start_time.elapsed();
        writeln!(&mut output_target)?;
        writeln!(&mut output_target, "🏁 Total time: {duration:?}")?;
    }
    output_target.flush_inner()?;
    Ok(())
}

enum OutputTarget {
    Stdout(BufWriter<std::io::Stdout>),
    File(BufWriter<File>),
}

impl OutputTarget {
    fn new(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Self::File(BufWriter::new(file)))
        } else {
            Ok(Self::Stdout(BufWriter::new(stdout())))
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stdout(w) => w,
            Self::File(w) => w,
        }
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout(w) => w.flush(),
            Self::File(w) => w.flush(),
        }
    }
}

impl Write for OutputTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base_args() -> Args {
        Args {
            scenarios: "smoke".to_string(),
            list_scenarios: false,
            seeds: "1337".to_string(),
            iterations: 1,
            report: "json".to_string(),
            output: None,
            difficulties: None,
            skip_playability: true,
            verbose: false,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("crossable-tester-{}-{name}", std::process::id()))
    }

    fn sample_result(passed: bool) -> ScenarioResult {
        ScenarioResult {
            scenario_name: "smoke".to_string(),
            seed: 1337,
            passed,
            iterations_run: 1,
            successful_iterations: usize::from(passed),
            failures: if passed {
                Vec::new()
            } else {
                vec!["failure".to_string()]
            },
            average_duration: Duration::from_millis(1),
            performance_data: vec![Duration::from_millis(1)],
        }
    }

    fn sample_record() -> PlayabilityRecord {
        PlayabilityRecord {
            difficulty: "Hard".to_string(),
            target_steps: 3,
            seed: 1337,
            rounds: 200,
            staked: 20_000,
            returned: 15_000,
            collisions: 90,
            steps_taken: 450,
            theoretical_rtp: 0.78,
        }
    }

    #[test]
    fn cli_parses_defaults() {
        let args = Args::try_parse_from(["crossable-tester"]).unwrap();
        assert_eq!(args.scenarios, "smoke");
        assert_eq!(args.seeds, "1337");
        assert_eq!(args.iterations, 10);
        assert_eq!(args.report, "console");
        assert!(Args::try_parse_from(["crossable-tester", "--report", "xml"]).is_err());
    }

    #[test]
    fn expands_all_scenarios_keyword() {
        let expanded = expand_scenarios("smoke,all");
        assert_eq!(expanded[0], "smoke");
        assert_eq!(expanded.len(), scenario_names().len());
        assert!(expanded.contains(&"concurrent-cashout".to_string()));
    }

    #[test]
    fn expand_scenarios_without_all_preserves_order() {
        let expanded = expand_scenarios("step-cap,smoke");
        assert_eq!(expanded, vec!["step-cap".to_string(), "smoke".to_string()]);
    }

    #[test]
    fn loads_builtin_and_custom_catalogs() {
        assert_eq!(&load_catalog(None).unwrap(), standard_catalog());

        let path = temp_path("difficulties.json");
        std::fs::write(
            &path,
            r#"{"difficulties":[{"name":"Casual","collision_probability":0.02,"starting_multiplier":1.0,"multiplier_increment":0.05}]}"#,
        )
        .unwrap();
        let catalog = load_catalog(Some(path.as_path())).unwrap();
        assert_eq!(catalog.names(), vec!["Casual".to_string()]);

        std::fs::write(&path, "{not json").unwrap();
        assert!(load_catalog(Some(path.as_path())).is_err());
        assert!(load_catalog(Some(temp_path("missing.json").as_path())).is_err());
    }

    #[test]
    fn runs_logic_scenarios_in_order() {
        let args = base_args();
        let names = vec![
            "terminal-guard".to_string(),
            "nope".to_string(),
            "smoke".to_string(),
        ];
        let results = tokio_test::block_on(run_logic_scenarios(
            &args,
            &names,
            &[3, 4],
            Arc::new(standard_catalog().clone()),
        ))
        .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].scenario_name, "terminal-guard");
        assert_eq!(results[3].scenario_name, "smoke");
        assert!(results.iter().all(|r| r.passed), "{results:?}");
    }

    #[test]
    fn gather_playability_respects_skip_flag() {
        let seeds = vec![SeedInfo::from_numeric(42)];
        let (records, aggregates) =
            gather_playability(&base_args(), standard_catalog(), &seeds).unwrap();
        assert!(records.is_none() && aggregates.is_none());

        let args = Args {
            skip_playability: false,
            ..base_args()
        };
        let (records, aggregates) = gather_playability(&args, standard_catalog(), &seeds).unwrap();
        let records = records.unwrap();
        let aggregates = aggregates.unwrap();
        assert_eq!(records.len(), aggregates.len());
        validate_playability_targets(&aggregates, &records).unwrap();
    }

    #[test]
    fn maybe_list_scenarios_writes_output() {
        let temp = temp_path("scenarios.txt");
        let args = Args {
            list_scenarios: true,
            output: Some(temp.clone()),
            ..base_args()
        };
        assert!(maybe_list_scenarios(&args).unwrap());
        let content = std::fs::read_to_string(temp).unwrap();
        assert!(content.contains("Available scenarios"));
        assert!(content.contains("retry-cashout"));
    }

    #[test]
    fn maybe_list_scenarios_returns_false_when_disabled() {
        assert!(!maybe_list_scenarios(&base_args()).unwrap());
    }

    #[test]
    fn write_reports_emits_json() {
        let temp = temp_path("report.json");
        let args = Args {
            output: Some(temp.clone()),
            ..base_args()
        };
        write_reports(&args, &[sample_result(true)], None, None, Instant::now()).unwrap();
        let content = std::fs::read_to_string(temp).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["scenarios"][0]["scenario_name"], "smoke");
    }

    #[test]
    fn write_reports_markdown_empty_results() {
        let temp = temp_path("report.md");
        let args = Args {
            report: "markdown".to_string(),
            output: Some(temp.clone()),
            ..base_args()
        };
        write_reports(&args, &[], None, None, Instant::now()).unwrap();
        let content = std::fs::read_to_string(temp).unwrap();
        assert!(content.contains("No scenarios executed"));
    }

    #[test]
    fn write_reports_emits_csv() {
        let temp = temp_path("report.csv");
        let args = Args {
            report: "csv".to_string(),
            output: Some(temp.clone()),
            ..base_args()
        };
        write_reports(&args, &[], Some(&[sample_record()]), None, Instant::now()).unwrap();
        let content = std::fs::read_to_string(temp).unwrap();
        assert!(content.starts_with("difficulty,target_steps"));
        assert!(content.contains("Hard,3,1337,200,200.00,150.00"));
    }

    #[test]
    fn write_reports_console_without_playability() {
        let temp = temp_path("report.txt");
        let args = Args {
            report: "console".to_string(),
            output: Some(temp.clone()),
            ..base_args()
        };
        write_reports(&args, &[sample_result(false)], None, None, Instant::now()).unwrap();
        let content = std::fs::read_to_string(temp).unwrap();
        assert!(content.contains("Playability data unavailable"));
        assert!(content.contains("Total time"));
    }

    #[test]
    fn output_target_stdout_writes() {
        let mut target = OutputTarget::new(None).unwrap();
        target.write_all(b"ok").unwrap();
        target.flush().unwrap();
    }
}
