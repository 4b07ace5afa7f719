use anyhow::{Context, Result};
use burn::backend::NdArray;
use duc_resnet::checkpoint::{check_depth, load_checkpoint, match_params};
use duc_resnet::logging::init_logging;
use duc_resnet::resnet::{ResNetConfig, build_symbol};
use log::LevelFilter;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

type Backend = NdArray<f32>;

const HELP: &str = "\
Dilated ResNet graph builder

Builds the dilated backbone, optionally binding the parameters of a pretrained checkpoint
made of <PREFIX>-symbol.json and <PREFIX>-<EPOCH>.params.

USAGE:
    build_graph [OPTIONS]

FLAGS:
    -h, --help                  Show this help message and exit
        --allow-missing         Keep the initial value of parameters absent from the checkpoint
        --memonger              Mark shortcuts as mirror stages in the exported topology

OPTIONS:
    -p, --preset <NAME>         resnet50, resnet101 or resnet152 [default: resnet101]
    -c, --checkpoint <PREFIX>   Checkpoint to bind
    -e, --epoch <N>             Checkpoint epoch [default: 0]
        --height <N>            Input height [default: 800]
        --width <N>             Input width [default: 800]
    -s, --symbol-out <PATH>     Write the topology json of the built graph
";

#[derive(Debug)]
struct Args {
    preset: String,
    checkpoint: Option<PathBuf>,
    epoch: usize,
    height: usize,
    width: usize,
    symbol_out: Option<PathBuf>,
    allow_missing: bool,
    memonger: bool,
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
            preset: pargs
                .opt_value_from_str(["-p", "--preset"])?
                .unwrap_or_else(|| "resnet101".to_string()),
            checkpoint: pargs.opt_value_from_os_str(["-c", "--checkpoint"], parse_path)?,
            epoch: pargs.opt_value_from_str(["-e", "--epoch"])?.unwrap_or(0),
            height: pargs.opt_value_from_str("--height")?.unwrap_or(800),
            width: pargs.opt_value_from_str("--width")?.unwrap_or(800),
            symbol_out: pargs.opt_value_from_os_str(["-s", "--symbol-out"], parse_path)?,
            // must parse flags after values
            allow_missing: pargs.contains("--allow-missing"),
            memonger: pargs.contains("--memonger"),
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            anyhow::bail!("unused arguments: {remaining:?}");
        }
        Ok(args)
    }
}

fn main() -> Result<()> {
    init_logging(LevelFilter::Info);
    let args = Args::parse()?;

    let config = ResNetConfig::preset(&args.preset)?.with_memonger(args.memonger);
    let input_shape = [1, 3, args.height, args.width];
    let (graph, head) = build_symbol(&config, input_shape)?;
    log::info!(
        "built resnet-{} with {} nodes: {:?} -> {:?}",
        config.depth(),
        graph.len(),
        input_shape,
        graph.shape(head)?
    );

    if let Some(path) = &args.symbol_out {
        let symbol = graph.to_symbol_json(&[head])?;
        let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
        let mut writer = BufWriter::new(file);
        symbol.to_writer(&mut writer)?;
        writer.flush()?;
        log::info!("wrote {path:?}");
    }

    let Some(prefix) = &args.checkpoint else {
        return Ok(());
    };
    let checkpoint = load_checkpoint(prefix, args.epoch)
        .with_context(|| format!("failed to load checkpoint {prefix:?}"))?;
    check_depth(&config, &checkpoint.params);

    let report = match_params(&graph.params(), &checkpoint.params)?;
    if !args.allow_missing {
        report.clone().require_complete()?;
    }

    let device = Default::default();
    let net = config.init::<Backend>(&device)?;
    let (net, report) = net.load_checkpoint_params(&checkpoint.params, &device)?;
    report.log();
    println!(
        "bound {} parameters into {} residual units ({} missing, {} unused)",
        report.bound.len(),
        net.num_units(),
        report.missing.len(),
        report.unused.len()
    );
    Ok(())
}
