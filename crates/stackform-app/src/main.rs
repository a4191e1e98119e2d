//! Composes the stacks of a backend deployment and synthesizes them into a
//! cloud assembly.
//!
//! Configuration is read from `configuration-{environment}.toml`. Run with
//! `RUST_LOG=info` (or `debug` to see every resource) to follow along.
//!
//! ```sh
//! ENVIRONMENT=dev cargo run -p stackform-app -- plan --scenario full
//! cargo run -p stackform-app -- --environment dev synth --scenario vpc-backend
//! cargo run -p stackform-app -- --environment dev synth --scenario backend-cicd --initialize
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use stack::{scenario, synth::Synth, Config, ImageChoice, Scenario};

#[derive(Parser)]
#[command(name = "infra", version, about = "Compose and synthesize backend infrastructure stacks")]
struct Cli {
    /// Deployment environment, selecting `configuration-{environment}.toml`.
    #[arg(long, env = "ENVIRONMENT")]
    environment: String,

    /// Directory holding the configuration files.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the stacks of a scenario and the outputs flowing between them.
    Plan {
        #[arg(long)]
        scenario: Scenario,
    },
    /// Compose a scenario and write its cloud assembly.
    Synth {
        #[arg(long)]
        scenario: Scenario,

        /// Directory the assembly is written to.
        #[arg(long, default_value = "cdk.out")]
        out: PathBuf,

        /// Deploy the public sample image instead of the versioned one, for
        /// the first deployment before the registry holds an image.
        #[arg(long, default_value = "false")]
        initialize: bool,
    },
}

fn plan(config: &Config, scenario: Scenario) -> Result<(), stack::Error> {
    let namespace = config.namespace();
    let descriptors = scenario.descriptors(&namespace);
    let defined = stack::check(&descriptors, &scenario::initial(&namespace))?;

    println!("{} {}", "Scenario:".bold(), scenario);
    for (i, descriptor) in descriptors.iter().enumerate() {
        println!("  {i}. {}", descriptor.name.bold());
        if !descriptor.requires.is_empty() {
            println!("       requires {}", descriptor.requires.join(", ").yellow());
        }
        println!("       produces {}", descriptor.produces.join(", ").green());
    }
    println!(
        "{} {}",
        "Outputs:".bold(),
        defined.into_iter().collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

fn synth(
    config: &Config,
    scenario: Scenario,
    out: &Path,
    initialize: bool,
) -> Result<(), stack::Error> {
    let config = if initialize {
        config.clone().with_image(ImageChoice::Bootstrap)
    } else {
        config.clone()
    };
    log::info!("synthesizing '{scenario}' with the {} image", config.image);

    let mut synth = Synth::new(config.environment());
    let outputs = stack::compose(
        &scenario.stages(&config),
        scenario::initial(&config.namespace()),
        &mut synth,
    )?;
    let assembly = synth.finish();
    let summary = assembly
        .write(out)
        .map_err(|source| stack::Error::Assembly { source })?;

    for name in summary.written.iter() {
        println!("  {} {name}", "synthesized".green());
    }
    for name in summary.unchanged.iter() {
        println!("  {} {name}", "unchanged".dimmed());
    }
    println!("{} {}", "Outputs:".bold(), outputs);
    println!("{} {}", "Manifest:".bold(), summary.manifest.display());
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = Config::load(&cli.environment, &cli.config_dir)
        .map_err(stack::Error::from)
        .and_then(|config| match cli.command {
            Command::Plan { scenario } => plan(&config, scenario),
            Command::Synth {
                scenario,
                out,
                initialize,
            } => synth(&config, scenario, &out, initialize),
        });

    if let Err(err) = result {
        log::error!("{err}");
        match err.stage() {
            Some(stage) => eprintln!("{} in stage '{stage}'", err.kind().red().bold()),
            None => eprintln!("{}", err.kind().red().bold()),
        }
        eprintln!("{err}");
        std::process::exit(1);
    }
}
