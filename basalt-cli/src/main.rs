//! Command-line front end: image loading, platform configuration, and the run loop.

mod loader;
mod snapshot_dir;

use basalt_core::session::StopReason;
use basalt_core::system::{McmConfig, RunMode, System, SystemConfig};
use basalt_core::{Rv32, Rv64, Xlen};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about = "RISC-V hart simulator", long_about = None)]
struct Args {
    /// ELF image to load and run.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Verilog-hex image to load.
    #[arg(long)]
    hex: Option<PathBuf>,

    /// Raw binary image, `file[:offset]`, loadable multiple times.
    #[arg(long)]
    binary: Vec<String>,

    /// Number of harts.
    #[arg(long, default_value_t = 1)]
    harts: usize,

    /// Use the 32-bit base ISA.
    #[arg(long)]
    rv32: bool,

    /// Physical memory size in bytes.
    #[arg(long, default_value_t = 1 << 32)]
    memory_size: u64,

    /// Enable the memory-consistency checker.
    #[arg(long)]
    mcm: bool,

    /// Merge-buffer (cache) line size for the MCM.
    #[arg(long, default_value_t = 64)]
    mbsize: u64,

    /// Check whole merge-buffer lines, not just the masked bytes.
    #[arg(long)]
    checkall: bool,

    /// Comma-separated list of PPO rules to enable (default: all).
    #[arg(long)]
    ppos: Option<String>,

    /// Total-store-order mode for the MCM.
    #[arg(long)]
    tso: bool,

    /// Run one native thread per hart instead of round-robin.
    #[arg(long)]
    threads: bool,

    /// Stop after this many steps.
    #[arg(long)]
    steps: Option<u64>,

    /// Seed for the round-robin scheduler's step windows.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Write an architectural snapshot here when the run stops.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Override the to-host halt address (defaults to the ELF `tohost` symbol).
    #[arg(long)]
    tohost: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.rv32 {
        run::<Rv32>(args)
    } else {
        run::<Rv64>(args)
    }
}

fn run<X: Xlen>(args: Args) -> ExitCode {
    let images = match loader::load_images(&args.target, &args.hex, &args.binary) {
        Ok(images) => images,
        Err(err) => {
            error!("failed to load images: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mcm = args.mcm.then(|| McmConfig {
        line_size: args.mbsize,
        check_whole_line: args.checkall,
        tso: args.tso,
        rules: args.ppos.as_ref().map(|list| {
            list.split(',')
                .filter_map(|r| r.trim().parse().ok())
                .collect()
        }),
    });

    let config = SystemConfig {
        hart_count: args.harts,
        memory_size: args.memory_size,
        tohost: args.tohost.or(images.tohost),
        mcm,
        run_mode: if args.threads {
            RunMode::Threaded
        } else {
            RunMode::RoundRobin {
                seed: args.seed,
                max_window: 16,
            }
        },
        step_limit: args.steps,
        ..SystemConfig::default()
    };

    let mut system: System<X> = System::new(config, vec![]);
    for segment in &images.segments {
        system.load(segment.addr, &segment.bytes);
    }
    if let Some(entry) = images.entry {
        for ix in 0..system.hart_count() {
            system.hart_mut(ix).registers_mut().set_pc(entry);
        }
    }

    // SIGINT stops the run at the next step boundary.
    let session = system.session().clone();
    let signals = match signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT]) {
        Ok(signals) => signals,
        Err(err) => {
            error!("failed to install signal handler: {err}");
            return ExitCode::FAILURE;
        }
    };
    std::thread::spawn(move || {
        let mut signals = signals;
        if signals.forever().next().is_some() {
            session.request_stop();
        }
    });

    let reason = system.run();
    info!("stopped: {reason:?}");

    if let Some(dir) = &args.snapshot_dir {
        if let Err(err) = snapshot_dir::write(dir, &system.snapshot(), system.hart_count()) {
            error!("failed to write snapshot: {err}");
            return ExitCode::FAILURE;
        }
    }

    let mut code = reason.exit_code();
    if let Some(mcm) = system.mcm() {
        for violation in mcm.violations() {
            // One line per violation; details went to the log as they happened.
            eprintln!(
                "mcm violation: rule {} hart {} tags {}/{} addr {:#x}",
                violation.rule,
                violation.hart_ix,
                violation.tag_a,
                violation.tag_b,
                violation.phys_addr
            );
        }
        if !mcm.violations().is_empty() {
            code = 1;
        }
    }
    match (code, reason) {
        (0, _) => ExitCode::SUCCESS,
        (_, StopReason::ToHost(value)) => {
            error!("unexpected to-host value {value:#x}");
            ExitCode::FAILURE
        }
        _ => ExitCode::FAILURE,
    }
}
