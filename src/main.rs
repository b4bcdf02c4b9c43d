use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::info;

use tickframe::config::RuntimeConfig;
use tickframe::runtime::Runtime;
use tickframe::telemetry::init_telemetry;

mod demo;

#[derive(Parser)]
#[command(name = "tickframe")]
#[command(about = "Cooperative lifecycle orchestration for tick-driven applications")]
#[command(long_about = "Tickframe drives modules of rules through setup, dependency injection, \
                       initialization, updates and unload, one tick at a time. Run 'tickframe run' \
                       to watch the bundled demo scene load, tick and unload.")]
struct Cli {
    /// Emit JSON logs and a JSON status tree
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the demo scene for a number of ticks
    Run {
        /// Number of ticks to run
        #[arg(long, default_value = "120", help = "Number of ticks to drive the runtime for")]
        ticks: u64,
        /// Interval between ticks in milliseconds
        #[arg(long, help = "Tick interval in milliseconds (defaults to the configured interval)")]
        tick_ms: Option<u64>,
        /// Unload the scene after this many ticks
        #[arg(long, help = "Request an unload of the scene after this many ticks")]
        unload_after: Option<u64>,
        /// Ticks the loading transition takes to fade in and out
        #[arg(long, default_value = "3")]
        transition_ticks: u32,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    RuntimeConfig::load_env_file()?;
    let mut config = RuntimeConfig::load()?;
    if cli.json {
        config.observability.json = true;
    }

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Run {
            ticks,
            tick_ms,
            unload_after,
            transition_ticks,
        }) => {
            init_telemetry(&config.observability)?;
            let options = RunOptions {
                ticks,
                tick_ms: tick_ms.unwrap_or(config.tick.interval_ms),
                unload_after,
                transition_ticks,
                json: cli.json,
            };
            tokio::runtime::Runtime::new()?.block_on(run_command(config, options))
        }
        None => {
            println!("tickframe: nothing to do");
            println!();
            println!("  → Run the demo scene:   tickframe run --ticks 60");
            println!("  → Show configuration:   tickframe config");
            Ok(())
        }
    }
}

struct RunOptions {
    ticks: u64,
    tick_ms: u64,
    unload_after: Option<u64>,
    transition_ticks: u32,
    json: bool,
}

async fn run_command(config: RuntimeConfig, options: RunOptions) -> Result<()> {
    let fixed_every = config.tick.fixed_every;
    let delta = Duration::from_millis(options.tick_ms.max(1));
    let mut runtime = Runtime::new(config)?;
    runtime.load_module(demo::scene_setup(30, options.transition_ticks, delta * 5));

    let mut interval = tokio::time::interval(delta);
    for tick in 0..options.ticks {
        interval.tick().await;
        runtime.tick(delta);
        if fixed_every > 0 && tick % fixed_every == 0 {
            runtime.fixed_tick();
        }
        runtime.late_tick();

        if options.unload_after == Some(tick) {
            info!(tick, "Unloading demo scene");
            runtime.root_mut().unload_module();
        }
    }

    let failures = runtime.quit();
    let status = runtime.status();
    if options.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        let stats = runtime.stats();
        println!("Orchestrator '{}' is {:?}", status.name, status.state);
        match &status.module {
            Some(module) => println!("  Module: {} ({})", module.name, module.state),
            None => println!("  Module: none"),
        }
        for submodule in &status.submodules {
            println!("  Submodule [{}]: {:?}", submodule.category, submodule.status.state);
        }
        println!(
            "  Ticks: {}  Faults: {}  Stalls: {}",
            stats.ticks, stats.rule_faults, stats.stalls
        );
        if !failures.is_empty() {
            println!("  Quit failures: {}", failures.len());
        }
    }
    Ok(())
}
