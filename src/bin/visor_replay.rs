use std::fs::{self, File};

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use visor_interop::cli::CliOverrides;
use visor_interop::config::VisorConfig;
use visor_interop::replay::{load_fixture, run_fixture, ReplayOutput};

fn main() {
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run_cli(cli) {
        eprintln!("[visor-replay] error: {err:?}");
        std::process::exit(1);
    }
}

fn run_cli(cli: CliOverrides) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => VisorConfig::load(path)?,
        None => VisorConfig::default(),
    };
    let overrides = cli.config_overrides();
    config.apply_overrides(&overrides);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter.as_str()))
        .init();
    if !overrides.is_empty() {
        info!("[visor-replay] command line overrides: {}", overrides.applied_fields().join(", "));
    }
    config.layout.validate().context("layout after command line overrides")?;

    let fixture_path = cli.fixture.as_ref().ok_or_else(|| anyhow!("--fixture is required"))?;
    let fixture = load_fixture(fixture_path)?;
    let output = run_fixture(&fixture, &config.layout, config.intercept)?;

    if let Some(path) = &cli.write_output {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating output directory '{}'", parent.display()))?;
            }
        }
        let file =
            File::create(path).with_context(|| format!("writing replay output to '{}'", path.display()))?;
        serde_json::to_writer_pretty(file, &output).context("serializing replay output")?;
        info!("[visor-replay] wrote {}", path.display());
    }

    if let Some(path) = &cli.golden {
        let file = File::open(path).with_context(|| format!("opening golden file '{}'", path.display()))?;
        let expected: ReplayOutput = serde_json::from_reader(file).context("parsing golden JSON")?;
        if expected != output {
            bail!(
                "golden mismatch for {} (use --write-output to refresh):\nexpected: {}\nactual:   {}",
                fixture_path.display(),
                serde_json::to_string(&expected).unwrap_or_default(),
                serde_json::to_string(&output).unwrap_or_default(),
            );
        }
        info!("[visor-replay] matched golden {}", path.display());
    } else if cli.write_output.is_none() {
        serde_json::to_writer_pretty(std::io::stdout(), &output)?;
        println!();
    }

    Ok(())
}
