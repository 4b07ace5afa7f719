use anyhow::{Context, Result};
use burn::config::Config;
use duc_resnet::logging::init_logging;
use duc_resnet::manifest::{ListConfig, build_list};
use log::LevelFilter;
use std::ffi::OsStr;
use std::path::PathBuf;

const HELP: &str = "\
Cityscapes manifest builder

Writes a tab-delimited list of image/label pairs for one dataset split.

USAGE:
    build_list --root <DIR> [OPTIONS]

FLAGS:
    -h, --help                  Show this help message and exit
        --coarse                Use coarse (gtCoarse_labelIds) instead of fine labels
        --no-crop               Emit one row per image instead of 7 horizontal strips

OPTIONS:
    -r, --root <DIR>            Dataset root holding leftImg8bit/ and gtFine/ (or gtCoarse/)
    -s, --split <NAME>          Split to list [default: train]
        --sample-rate <N>       Keep every Nth image [default: 1]
    -o, --output <PATH>         Manifest path [default: <split>.lst]
    -c, --config <PATH>         Load the list config from this json file instead of --split/--coarse
";

#[derive(Debug)]
struct Args {
    root: PathBuf,
    split: String,
    coarse: bool,
    no_crop: bool,
    sample_rate: Option<usize>,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_path(s: &OsStr) -> Result<PathBuf, &'static str> {
    Ok(s.into())
}

impl Args {
    fn parse() -> Result<Self> {
        let mut pargs = pico_args::Arguments::from_env();
        if pargs.contains(["-h", "--help"]) {
            print!("{HELP}");
            std::process::exit(0);
        }

        let args = Args {
            root: pargs.value_from_os_str(["-r", "--root"], parse_path)?,
            split: pargs
                .opt_value_from_str(["-s", "--split"])?
                .unwrap_or_else(|| "train".to_string()),
            sample_rate: pargs.opt_value_from_str("--sample-rate")?,
            output: pargs.opt_value_from_os_str(["-o", "--output"], parse_path)?,
            config: pargs.opt_value_from_os_str(["-c", "--config"], parse_path)?,
            // must parse flags after values
            coarse: pargs.contains("--coarse"),
            no_crop: pargs.contains("--no-crop"),
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            anyhow::bail!("unused arguments: {remaining:?}");
        }
        Ok(args)
    }

    fn list_config(&self) -> Result<ListConfig> {
        let mut config = match &self.config {
            Some(path) => ListConfig::load(path)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("failed to load the list config {path:?}"))?,
            None => ListConfig::cityscapes(&self.split, !self.coarse),
        };
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if self.no_crop {
            config.is_crop = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    init_logging(LevelFilter::Info);
    let args = Args::parse()?;
    let config = args.list_config()?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.lst", args.split)));

    log::debug!("{config}");
    let summary = build_list(&args.root, &output, &config)
        .with_context(|| format!("failed to build the manifest for {:?}", args.root))?;
    println!(
        "{}: {} rows ({} of {} images)",
        output.display(),
        summary.rows,
        summary.kept,
        summary.discovered
    );
    Ok(())
}
