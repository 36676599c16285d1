//! CellVM Simulator CLI
//!
//! Run property scenarios against the biological virtual machine, or replay
//! a JSON protocol on it (or on the timing-only backend with `--dry-run`).

use cellvm_core::{BiologicalVirtualMachine, ParameterTables, VmConfig};
use cellvm_env::{Hardware, TimingHardware};
use cellvm_sim::scenarios::ScenarioId;
use cellvm_sim::{HarnessError, Protocol, ProtocolRun, ScenarioResult, ScenarioRunner, TrajectoryExport};
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// CellVM deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "cellvm-sim")]
#[command(about = "Run deterministic simulation checks for the CellVM biological virtual machine", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (er_stress, starvation, washout_split, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Replay a JSON protocol instead of running scenarios
    #[arg(short, long)]
    protocol: Option<String>,

    /// With --protocol: run on the timing-only backend
    #[arg(long)]
    dry_run: bool,

    /// With --protocol: export per-step vessel snapshots to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// VM configuration JSON
    #[arg(long)]
    config: Option<String>,

    /// Cell-line and compound tables JSON
    #[arg(long)]
    params: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn load_inputs(args: &Args) -> Result<(VmConfig, ParameterTables), HarnessError> {
    let config = match &args.config {
        Some(path) => VmConfig::from_json_file(path)?,
        None => VmConfig::default(),
    };
    let tables = match &args.params {
        Some(path) => ParameterTables::from_json_file(path)?,
        None => ParameterTables::default(),
    };
    Ok((config, tables))
}

/// Replays a protocol file on the VM, or on the timing backend for a dry run.
fn run_protocol(args: &Args, path: &str, seed: u64) -> Result<ProtocolRun, HarnessError> {
    let protocol = Protocol::from_json_file(path)?;
    info!("Protocol '{}' ({} steps)", protocol.name, protocol.steps.len());

    if args.dry_run {
        let mut hw = TimingHardware::new();
        let run = protocol.run(&mut hw)?;
        info!("Dry run on '{}': hands-on {:.2}h", hw.name(), hw.hands_on_h());
        return Ok(run);
    }

    let (config, tables) = load_inputs(args)?;
    let mut vm = BiologicalVirtualMachine::new(VmConfig { seed, ..config }, tables)?;

    match &args.export {
        Some(export_path) => {
            let mut export = TrajectoryExport::new(&protocol.name, &vm);
            let run = protocol.run_observed(&mut vm, |index, record, vm| export.capture(index, record, vm))?;
            export.write_to_file(export_path)?;
            info!("Exported {} frames to {}", export.frames.len(), export_path);
            Ok(run)
        }
        None => protocol.run(&mut vm),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }

    if !args.json {
        info!("CellVM Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    // Handle --protocol mode
    if let Some(path) = &args.protocol {
        return match run_protocol(&args, path, base_seed) {
            Ok(run) => {
                if args.json {
                    match serde_json::to_string_pretty(&run) {
                        Ok(json) => println!("{}", json),
                        Err(e) => {
                            error!("Failed to serialize run: {}", e);
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    for record in &run.records {
                        info!(
                            "  t={:>7.2}h  {:<28} {}",
                            record.clock_h,
                            record.operation,
                            record.vessel_id.as_deref().unwrap_or("-")
                        );
                        for event in &record.events {
                            info!("      ⚠ {}", event);
                        }
                    }
                    info!(
                        "✓ {} steps, clock {:.2}h, hands-on {:.2}h, {} events",
                        run.records.len(),
                        run.final_clock_h,
                        run.total_time_cost_h,
                        run.event_count()
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("✗ Protocol failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if args.export.is_some() || args.dry_run {
        eprintln!("Error: --export and --dry-run require --protocol");
        return ExitCode::from(2);
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<_> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return ExitCode::from(2);
            }
        }
    };

    let (config, tables) = match load_inputs(&args) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("✗ {}", e);
            return ExitCode::from(2);
        }
    };

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_config(config.clone())
            .with_tables(tables.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
