use crate::config::VisorConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

/// Command line of the replay tool: `--key value` pairs only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    pub fixture: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub write_output: Option<PathBuf>,
    pub golden: Option<PathBuf>,
    log_filter: Option<String>,
    visor_flag: Option<u8>,
    intercept: Option<bool>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "fixture" => overrides.fixture = Some(PathBuf::from(value)),
                "config" => overrides.config = Some(PathBuf::from(value)),
                "write-output" => overrides.write_output = Some(PathBuf::from(value)),
                "golden" => overrides.golden = Some(PathBuf::from(value)),
                "log-filter" => overrides.log_filter = Some(value),
                "visor-flag" => overrides.visor_flag = Some(parse_mask(&value)?),
                "intercept" => overrides.intercept = Some(parse_bool_flag("intercept", &value)?),
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --fixture, --config, --write-output, --golden, \
                     --log-filter, --visor-flag, --intercept."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn into_config_overrides(self) -> VisorConfigOverrides {
        VisorConfigOverrides { log_filter: self.log_filter, visor_flag: self.visor_flag, intercept: self.intercept }
    }

    pub fn config_overrides(&self) -> VisorConfigOverrides {
        self.clone().into_config_overrides()
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

fn parse_mask(value: &str) -> Result<u8> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse::<u8>(),
    };
    parsed.with_context(|| format!("Invalid visor-flag '{value}'. Use a byte such as 0x40 or 64."))
}
