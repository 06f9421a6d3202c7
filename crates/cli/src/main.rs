use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::runtime::Handle;

use ternary_codegen::emit_plan;
use ternary_common::{ConfigStore, KernelArch, ModelProfile, TilePlan, TunerConfig};
use ternary_core::{validate_plan, verify_plan};
use ternary_search::{CancelFlag, Controller, ProcessHarness, SearchMode, SessionOutcome};

#[derive(Parser, Debug)]
#[command(name = "ternary-tune", about = "Tile-size auto-tuner for ternary matmul kernels")]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Benchmark candidate tilings and persist the fastest.
    Tune(TuneArgs),
    /// Check a tiling against every kernel shape of a profile.
    Validate(ValidateArgs),
    /// Write the kernel header and ini for the stored (or default) plan.
    Emit(EmitArgs),
    /// Print the stored best configuration.
    Show(ShowArgs),
    /// Run the tiled kernel models against the reference on random data.
    Verify(VerifyArgs),
}

// ── Shared ─────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct CommonArgs {
    /// Tuner configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Built-in profile name or profile JSON file.
    #[arg(long)]
    profile: Option<String>,
    /// Kernel family; defaults to the host's.
    #[arg(long)]
    arch: Option<KernelArch>,
}

/// Comma-separated per-kernel tile lists; a single value applies to all.
#[derive(Args, Debug)]
struct TileArgs {
    #[arg(long)]
    bm: Option<String>,
    #[arg(long)]
    bk: Option<String>,
    #[arg(long)]
    bmm: Option<String>,
}

// ── Tune ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TuneArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value = "quick")]
    mode: SearchMode,
    /// Model file the workload runs on.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Install and rebuild the winner once the session ends.
    #[arg(long)]
    apply: bool,
    #[arg(long)]
    max_candidates: Option<usize>,
    /// Workload threads.
    #[arg(long)]
    threads: Option<usize>,
    /// Write the full session report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    tiles: TileArgs,
}

#[derive(Parser, Debug)]
struct EmitArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Also print the compiler flags the header needs.
    #[arg(long)]
    print_flags: bool,
}

#[derive(Parser, Debug)]
struct ShowArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct VerifyArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Tiles to verify; the stored (or default) plan when omitted.
    #[command(flatten)]
    tiles: TileArgs,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let code = match cli.command {
        Command::Tune(args) => cmd_tune(args).await,
        Command::Validate(args) => cmd_validate(args),
        Command::Emit(args) => cmd_emit(args),
        Command::Show(args) => cmd_show(args),
        Command::Verify(args) => cmd_verify(args),
    };
    match code {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn load_config(args: &CommonArgs) -> Result<TunerConfig> {
    let mut config = match &args.config {
        Some(path) => TunerConfig::load(path)
            .with_context(|| format!("loading tuner config {}", path.display()))?,
        None => TunerConfig::default(),
    };
    if let Some(dir) = &args.base_dir {
        config.base_dir = dir.clone();
    }
    if let Some(profile) = &args.profile {
        config.profile = profile.clone();
    }
    if args.arch.is_some() {
        config.arch = args.arch;
    }
    Ok(config)
}

fn load_profile(config: &TunerConfig) -> Result<ModelProfile> {
    let profile = ModelProfile::resolve(&config.profile).context("loading model profile")?;
    profile.check().context("checking model profile")?;
    Ok(profile)
}

fn open_store(config: &TunerConfig) -> ConfigStore {
    ConfigStore::new(
        &config.resolve(&config.store_dir),
        &config.resolve(&config.kernel_ini),
    )
}

fn parse_list(flag: &str, text: &str, kernels: usize) -> Result<Vec<usize>> {
    let values = text
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .with_context(|| format!("--{flag}: '{s}' is not a number"))
        })
        .collect::<Result<Vec<_>>>()?;
    match values.len() {
        1 => Ok(vec![values[0]; kernels]),
        n if n == kernels => Ok(values),
        n => bail!("--{flag}: {n} values given, profile has {kernels} kernels"),
    }
}

/// `None` when no tile flag was given.
fn plan_from_tiles(
    tiles: &TileArgs,
    profile: &ModelProfile,
    arch: KernelArch,
) -> Result<Option<TilePlan>> {
    let (bm, bk, bmm) = match (&tiles.bm, &tiles.bk, &tiles.bmm) {
        (None, None, None) => return Ok(None),
        (Some(bm), Some(bk), Some(bmm)) => (bm, bk, bmm),
        _ => bail!("--bm, --bk and --bmm must be given together"),
    };
    let n = profile.num_kernels();
    let plan = TilePlan::new(
        arch,
        parse_list("bm", bm, n)?,
        parse_list("bk", bk, n)?,
        parse_list("bmm", bmm, n)?,
    )?;
    Ok(Some(plan))
}

// ── Command implementations ────────────────────────────────────────────────────

async fn cmd_tune(args: TuneArgs) -> Result<u8> {
    let mut config = load_config(&args.common)?;
    if let Some(model) = args.model {
        config.model_path = model;
    }
    if let Some(n) = args.max_candidates {
        config.search.max_candidates = n;
    }
    if let Some(t) = args.threads {
        config.run.threads = t;
    }
    let profile = load_profile(&config)?;
    let arch = config.arch();

    let harness = ProcessHarness::new(&config, Handle::current());
    harness.preflight().context("tuning prerequisites")?;

    let cancel = CancelFlag::new();
    cancel.watch_ctrl_c();

    let controller = Controller::new(profile, arch, args.mode, open_store(&config), harness)
        .with_knobs(config.search.clone())
        .with_cancel(cancel)
        .guard_files(vec![
            config.resolve(&config.kernel_header),
            config.resolve(&config.kernel_ini),
        ])
        .with_apply(args.apply)
        .with_progress(!args.no_progress);
    let report = controller.run_async().await.context("tuning session")?;

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing session report {}", path.display()))?;
    }

    let last = report.transitions.last().map(|s| s.to_string()).unwrap_or_default();
    println!("\n=== Tuning ended: {last} ===");
    println!("Candidates: {} ({} valid)", report.results.len(), report.valid_count());
    println!("Elapsed:    {:.1}s", report.elapsed_secs);
    if let SessionOutcome::Persisted { best } = &report.outcome {
        println!("Best:       {}", best.plan());
        println!("Throughput: {:.2} tokens/s", best.tokens_per_second);
    }
    Ok(report.outcome.exit_code() as u8)
}

fn cmd_validate(args: ValidateArgs) -> Result<u8> {
    let config = load_config(&args.common)?;
    let profile = load_profile(&config)?;
    let arch = config.arch();
    let Some(plan) = plan_from_tiles(&args.tiles, &profile, arch)? else {
        bail!("validate needs --bm, --bk and --bmm");
    };

    let verdict = validate_plan(&plan, &profile.kernels);
    for (i, ((tile, shape), v)) in plan
        .tiles()
        .zip(&profile.kernels)
        .zip(&verdict.kernels)
        .enumerate()
    {
        if v.is_legal() {
            println!("kernel {i} {shape}: {tile} legal");
        } else {
            println!("kernel {i} {shape}: {tile} ILLEGAL: {v}");
        }
    }
    if let Some(arity) = &verdict.arity {
        println!("plan: {arity}");
    }
    Ok(if verdict.is_legal() { 0 } else { 1 })
}

fn cmd_emit(args: EmitArgs) -> Result<u8> {
    let config = load_config(&args.common)?;
    let profile = load_profile(&config)?;
    let arch = config.arch();
    let plan = open_store(&config)
        .resolve_plan(&profile, arch)
        .context("reading stored configuration")?;
    let bundle = emit_plan(&plan, &profile.kernels)?;

    let header = config.resolve(&config.kernel_header);
    let ini = config.resolve(&config.kernel_ini);
    bundle.install(&header, &ini)?;
    tracing::info!(
        plan = %plan,
        header = %header.display(),
        fingerprint = &bundle.fingerprint[..12],
        "Kernels emitted"
    );
    if args.print_flags {
        println!("{}", bundle.cflags());
    }
    Ok(0)
}

fn cmd_show(args: ShowArgs) -> Result<u8> {
    let config = load_config(&args.common)?;
    match open_store(&config).load()? {
        Some(best) => println!("{}", serde_json::to_string_pretty(&best)?),
        None => println!("no tuning performed"),
    }
    Ok(0)
}

fn cmd_verify(args: VerifyArgs) -> Result<u8> {
    let config = load_config(&args.common)?;
    let profile = load_profile(&config)?;
    let arch = config.arch();
    let plan = match plan_from_tiles(&args.tiles, &profile, arch)? {
        Some(plan) => plan,
        None => open_store(&config).resolve_plan(&profile, arch)?,
    };

    let report = verify_plan(&plan, &profile.kernels, args.seed)?;
    for check in &report.kernels {
        println!(
            "{} {}: {} (max |diff| {:e})",
            check.shape,
            check.tile,
            if check.exact { "bit-exact" } else { "MISMATCH" },
            check.max_abs_diff
        );
    }
    Ok(if report.all_exact() { 0 } else { 1 })
}
