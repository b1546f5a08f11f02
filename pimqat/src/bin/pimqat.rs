use std::{fs::File, io::Write, path::PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use pimqat::{
    FoldReport, Network, PimContext, QuantPhase, Tensor, TuneEntry, fold_network,
    model::zoo::{Family, ZooConfig, build_network},
    quantization::BIT_WIDTHS,
    threshold::{
        InitPolicy, SEED_ACTI_LOG2_T, SEED_WEIGHT_LOG2_T, Strategy, ThresholdEntry, calibrate,
        profile, seed_constant,
    },
    tune_network,
};
use serde::Serialize;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Folds a zoo network, initializes its thresholds, walks it through the quantization phases
/// and tunes it to an ADC window, reporting how far each phase drifts from float.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// network family, e.g. resnet18 or vgg11
    #[arg(short, long, default_value_t = Family::ResNet18)]
    family: Family,

    #[arg(long, default_value_t = 10)]
    num_classes: usize,

    /// divides every channel count of the network
    #[arg(short, long, default_value_t = 8)]
    width_divisor: usize,

    /// images per random batch
    #[arg(short, long, default_value_t = 2)]
    batch: usize,

    #[arg(long, default_value_t = 32)]
    image_size: usize,

    /// number of calibration batches; only the first one is used
    #[arg(long, default_value_t = 1)]
    calibration_batches: usize,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// seed thresholds with log2(6) / log2(3) instead of calibrating
    #[arg(long)]
    seed_constant: bool,

    #[arg(long, default_value_t = Strategy::Max)]
    weight_init: Strategy,

    #[arg(long, default_value_t = Strategy::Max)]
    bias_init: Strategy,

    #[arg(long, default_value_t = Strategy::Entropy)]
    acti_init: Strategy,

    /// rows of a crossbar tile
    #[arg(long, default_value_t = 128)]
    num_rows: usize,

    #[arg(long, default_value_t = 10)]
    adc_precision: i32,

    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    adc_min: i32,

    #[arg(long, default_value_t = 9, allow_negative_numbers = true)]
    adc_max: i32,

    /// write the JSON report there instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct PhaseResult {
    phase: QuantPhase,
    /// mean absolute difference to the float output
    mean_abs_diff: f32,
    max_abs_output: f32,
}

#[derive(Serialize)]
struct Report {
    family: Family,
    context: PimContext,
    fold: FoldReport,
    initialization: Vec<ThresholdEntry>,
    tuning: Vec<TuneEntry>,
    phases: Vec<PhaseResult>,
    thresholds: Vec<ThresholdEntry>,
}

fn run_phase(
    network: &mut Network,
    ctx: &mut PimContext,
    phase: QuantPhase,
    input: &Tensor,
    reference: &Tensor,
) -> Result<PhaseResult> {
    network.enter_phase(ctx, phase);
    let output = network
        .forward(ctx, input)
        .with_context(|| format!("forward in {:?}", phase))?;
    let diff = output
        .get_data()
        .iter()
        .zip(reference.get_data())
        .map(|(a, b)| (a - b).abs())
        .sum::<f32>()
        / output.len().max(1) as f32;
    info!("{:?}: mean |output - float| = {}", phase, diff);
    Ok(PhaseResult {
        phase,
        mean_abs_diff: diff,
        max_abs_output: output.max_abs_output(),
    })
}

/// The report is the program's output, everything else goes to the log.
#[allow(clippy::print_stdout)]
fn print_report(json: &str) {
    println!("{}", json);
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global subscriber")?;
    let args = Args::parse();

    let mut network = build_network(&ZooConfig {
        family: args.family,
        num_classes: args.num_classes,
        width_divisor: args.width_divisor,
        seed: args.seed,
    })?;
    let fold = fold_network(&mut network)?;

    let mut ctx = PimContext::new(*BIT_WIDTHS);
    ctx.spec.num_rows = args.num_rows;
    let batches = (0..args.calibration_batches.max(1) as u64)
        .map(|i| {
            Tensor::random_seed(
                vec![args.batch, 3, args.image_size, args.image_size],
                args.seed + 1 + i,
            )
        })
        .collect::<Vec<_>>();

    let initialization = if args.seed_constant {
        seed_constant(&mut network, SEED_ACTI_LOG2_T, SEED_WEIGHT_LOG2_T)?;
        Vec::new()
    } else {
        let policy = InitPolicy {
            weight: args.weight_init,
            bias: args.bias_init,
            acti: args.acti_init,
            ..InitPolicy::default()
        };
        calibrate(&mut network, &ctx, &batches, &policy)?
    };

    let input = &batches[0];
    let reference = network.forward(&ctx, input)?;
    let mut phases = Vec::new();
    phases.push(run_phase(
        &mut network,
        &mut ctx,
        QuantPhase::BaselineTrain,
        input,
        &reference,
    )?);
    network.bn_freeze(true, true)?;
    phases.push(run_phase(
        &mut network,
        &mut ctx,
        QuantPhase::BnFolded,
        input,
        &reference,
    )?);
    network.enter_phase(&mut ctx, QuantPhase::RangeConstrained);
    let tuning = tune_network(
        &mut network,
        &mut ctx,
        args.adc_precision,
        args.adc_min,
        args.adc_max,
    )?;
    for phase in [QuantPhase::RangeConstrained, QuantPhase::HardwareInference] {
        phases.push(run_phase(&mut network, &mut ctx, phase, input, &reference)?);
    }

    let report = Report {
        family: args.family,
        context: ctx,
        fold,
        initialization,
        tuning,
        phases,
        thresholds: profile(&network)?,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("creating report file {}", path.display()))?;
            writeln!(file, "{}", json)?;
            info!("report written to {}", path.display());
        }
        None => print_report(&json),
    }
    Ok(())
}
