use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use nbe_core::EngineConfig;
use nbe_sim::{init_logging, inspect_store, run_simulator, LogFormat, SimulatorConfig};
use std::path::PathBuf;

fn cli() -> Command {
    Command::new("nbe")
        .version(nbe_sim::VERSION)
        .about("Notebook engine simulator and store inspector")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded workload and check the engine's guarantees")
                .arg(
                    Arg::new("worksheets")
                        .long("worksheets")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Number of worksheets"),
                )
                .arg(
                    Arg::new("cells")
                        .long("cells")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Cells per worksheet"),
                )
                .arg(
                    Arg::new("capacity")
                        .long("capacity")
                        .default_value("2")
                        .value_parser(value_parser!(usize))
                        .help("Backend session pool capacity"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("crash-rate")
                        .long("crash-rate")
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Probability that a cell crashes its session"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Engine configuration (TOML)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("List worksheets and revisions in a store directory")
                .arg(
                    Arg::new("root")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Store root directory"),
                )
                .arg(Arg::new("owner").long("owner").help("Only this user's worksheets"))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn load_engine_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::new());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    EngineConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(if matches.get_flag("log-json") {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                worksheets: args.get_one::<usize>("worksheets").copied().unwrap_or(8),
                cells_per_worksheet: args.get_one::<usize>("cells").copied().unwrap_or(10),
                capacity: args.get_one::<usize>("capacity").copied().unwrap_or(2),
                crash_rate: args.get_one::<f64>("crash-rate").copied().unwrap_or(0.05),
                engine: load_engine_config(args.get_one::<PathBuf>("config"))?,
                ..SimulatorConfig::default()
            };
            let report = run_simulator(config).await.context("simulation aborted")?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.generate_text());
            }
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Some(("inspect", args)) => {
            let Some(root) = args.get_one::<PathBuf>("root") else {
                bail!("store root is required");
            };
            let owner = args.get_one::<String>("owner").map(String::as_str);
            let listing = inspect_store(root, owner)
                .await
                .with_context(|| format!("inspecting {}", root.display()))?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                print!("{}", listing.generate_text());
            }
        }
        _ => bail!("unknown command"),
    }
    Ok(())
}
