// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};

use rupsp_cpu::MemoryAccess;
use rupsp_kernel::{DebugThreadInfo, KernelCore};

/// Module id the command line loader assigns to the boot image.
const BOOT_MODULE_ID: i32 = 1;

/// rupsp - PSP kernel thread manager
#[derive(Parser, Debug)]
#[command(name = "rupsp", version, about = "PSP kernel threading written in Rust")]
struct Args {
    /// Raw code image to load into user memory; execution starts at its first byte
    #[arg(short, long)]
    module: Option<PathBuf>,

    /// Path to config file (default: auto-detect rupsp.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Restore kernel state from a savestate file instead of booting
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write kernel state to this file before exiting
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Number of idle steps to run before printing the thread list
    #[arg(long, default_value_t = 16)]
    idle_steps: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = config::load_config(args.config.as_ref());

    // Initialize logging
    let log_level = if args.verbose || settings.use_debug_logging {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("rupsp - PSP kernel thread manager");
    info!("Compiled SDK version: {:08x}", settings.compiled_sdk_version);

    let mut kernel = KernelCore::new(settings).context("Failed to set up guest memory")?;

    match &args.load_state {
        Some(path) => load_state(&mut kernel, path)?,
        None => boot(&mut kernel, args.module.as_deref())?,
    }

    for _ in 0..args.idle_steps {
        if !kernel.timing.has_pending_events() {
            break;
        }
        kernel.idle();
    }

    print_threads(&kernel.get_threads_info());
    for report in kernel.reports() {
        warn!("Kernel report: {}", report);
    }

    if let Some(path) = &args.save_state {
        let data = kernel.save_state();
        std::fs::write(path, &data)
            .with_context(|| format!("Failed to write savestate {}", path.display()))?;
        info!("Saved {} bytes to {}", data.len(), path.display());
    }

    Ok(())
}

/// Place the boot image in user memory and start its root thread.
fn boot(kernel: &mut KernelCore, module: Option<&Path>) -> Result<()> {
    let image = match module {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read module {}", path.display()))?,
        // A lone `jr ra; nop` keeps the root thread well formed.
        None => [0x03E0_0008u32, 0].iter().flat_map(|w| w.to_le_bytes()).collect(),
    };

    let base = kernel
        .memory
        .user
        .alloc(image.len() as u32, false, "module")
        .context("Module does not fit in user memory")?;
    kernel
        .memory
        .ram
        .write_bytes(base, &image)
        .context("Failed to copy module into guest memory")?;
    info!("Module loaded at 0x{:08X} ({} bytes)", base, image.len());

    let root = kernel.boot_module(BOOT_MODULE_ID, base, base, &[]);
    info!("Root thread created (id={})", root);
    Ok(())
}

fn load_state(kernel: &mut KernelCore, path: &Path) -> Result<()> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read savestate {}", path.display()))?;
    kernel
        .load_state(&data)
        .with_context(|| format!("Failed to load savestate {}", path.display()))?;
    info!("Restored state from {}", path.display());
    Ok(())
}

fn print_threads(threads: &[DebugThreadInfo]) {
    println!(
        "{:>6}  {:<24} {:<12} {:>4}  {:>8}  {:>8}  {:<16}",
        "id", "name", "status", "prio", "entry", "pc", "wait"
    );
    for t in threads {
        println!(
            "{:>6}{} {:<24} {:<12} {:>4x}  {:08x}  {:08x}  {:<16}",
            t.id,
            if t.is_current { '*' } else { ' ' },
            t.name,
            format!("{:?}", t.status),
            t.priority,
            t.entrypoint,
            t.cur_pc,
            t.wait_type.name(),
        );
    }
}
