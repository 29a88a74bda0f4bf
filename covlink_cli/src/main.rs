//! End-to-end harness for the covlink runtime.
//!
//! This binary plays the *external fuzzing controller*: it allocates the
//! shared coverage bitmap, installs the fork-server protocol descriptors,
//! forks a target process running a toy translation engine around the
//! covlink runtime, and then drives N iterations of the go → pid → status
//! protocol while watching the bitmap fill up.

use covlink_core::config::{INST_RATIO_ENV_VAR, SHM_ENV_VAR};
use covlink_core::coverage::{CoverageContext, EdgeState};
use covlink_core::forkserver::{
    ControlChannel, FORKSRV_FD, FatalExit, ForkRole, ForkServer, HANDSHAKE_TOKEN,
};
use covlink_core::relay::{TranslationEngine, TslMessage};
use covlink_core::{InstrumentationConfig, MAP_SIZE, SharedMap};

use clap::Parser;
use nix::unistd::{ForkResult, fork};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Number of fork-server iterations to drive.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Instrumentation ratio (1-100) exported to the target.
    #[clap(long)]
    inst_ratio: Option<u32>,
    /// Seed for the toy engine's block walk.
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct HarnessConfig {
    #[serde(default = "default_iterations")]
    iterations: u64,
    #[serde(default)]
    inst_ratio: Option<u32>,
    #[serde(default = "default_seed")]
    seed: u64,
    /// How many distinct synthetic blocks the toy program has.
    #[serde(default = "default_block_count")]
    block_count: u64,
    /// How many blocks one execution walks through.
    #[serde(default = "default_blocks_per_run")]
    blocks_per_run: usize,
}

fn default_iterations() -> u64 {
    25
}
fn default_seed() -> u64 {
    1
}
fn default_block_count() -> u64 {
    256
}
fn default_blocks_per_run() -> usize {
    64
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            iterations: default_iterations(),
            inst_ratio: None,
            seed: default_seed(),
            block_count: default_block_count(),
            blocks_per_run: default_blocks_per_run(),
        }
    }
}

impl HarnessConfig {
    fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        let config: HarnessConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        Ok(config)
    }
}

/// A stand-in for the binary-translation engine: a fixed set of synthetic
/// block addresses, a translation cache, and a deterministic walk through
/// them. Good enough to exercise every part of the runtime protocol.
struct ToyEngine {
    seed: u64,
    block_base: u64,
    block_count: u64,
    blocks_per_run: usize,
    translated: HashSet<u64>,
}

impl ToyEngine {
    fn new(config: &HarnessConfig) -> Self {
        ToyEngine {
            seed: config.seed,
            block_base: 0x0040_0000,
            block_count: config.block_count,
            blocks_per_run: config.blocks_per_run,
            translated: HashSet::new(),
        }
    }

    fn entry_point(&self) -> u64 {
        self.block_base
    }

    /// The sequence of blocks one execution runs through. Seed-determined,
    /// so repeated runs of the same "input" produce comparable coverage.
    fn block_walk(&self) -> Vec<u64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut walk = Vec::with_capacity(self.blocks_per_run);
        walk.push(self.entry_point());
        for _ in 1..self.blocks_per_run {
            let index = rng.next_u64() % self.block_count;
            walk.push(self.block_base + index * 16);
        }
        walk
    }

    /// "Translates" a block locally, reporting whether it was new.
    fn translate(&mut self, pc: u64) -> bool {
        self.translated.insert(pc)
    }
}

impl TranslationEngine for ToyEngine {
    fn precompile(&mut self, pc: u64, _cs_base: u64, _flags: u64) {
        self.translated.insert(pc);
    }
}

/// The target side: what the translation engine's startup path would do
/// once execution reaches the entry point. Never returns.
fn run_target(harness: &HarnessConfig) -> ! {
    let mut engine = ToyEngine::new(harness);
    let mut config = InstrumentationConfig::from_env();
    config.entry_point = engine.entry_point();

    let context = match CoverageContext::setup(&config, &mut engine) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("covlink: {e}");
            std::process::exit(FatalExit::MapAttach.code());
        }
    };

    let mut server = ForkServer::new();
    let relay = match server.run(&context, &mut engine) {
        ForkRole::Child(relay) => Some(relay),
        ForkRole::Standalone => None,
    };

    // From here on this is either a forked fuzzing child or an ordinary
    // single-shot run; either way, walk the program and log coverage.
    let mut thread = EdgeState::new();
    for pc in engine.block_walk() {
        context.log_block(pc, &mut thread);
        if engine.translate(pc) {
            if let Some(relay) = &relay {
                // Best-effort cache-warming hint; a lost frame is fine.
                let _ = relay.request_translation(&TslMessage {
                    pc,
                    cs_base: 0,
                    flags: 0,
                });
            }
        }
    }
    std::process::exit(0)
}

/// dup2 `from` onto the well-known descriptor `to`, closing the original.
fn install_fd(from: RawFd, to: RawFd) -> Result<(), anyhow::Error> {
    if from == to {
        return Ok(());
    }
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(anyhow::anyhow!(
            "dup2({from}, {to}) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    unsafe { libc::close(from) };
    Ok(())
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            HarnessConfig::load_from_file(&config_path)?
        }
        None => HarnessConfig::default(),
    };
    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }
    if let Some(inst_ratio) = cli.inst_ratio {
        config.inst_ratio = Some(inst_ratio);
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    println!("Effective configuration: {config:#?}");

    // Coverage bitmap, exported to the target through the environment.
    let (shm_id, bitmap) = SharedMap::create()
        .map_err(|e| anyhow::anyhow!("Failed to allocate coverage bitmap: {e}"))?;
    // Single-threaded here, before any spawn/fork.
    unsafe {
        std::env::set_var(SHM_ENV_VAR, shm_id.to_string());
        match config.inst_ratio {
            Some(ratio) => std::env::set_var(INST_RATIO_ENV_VAR, ratio.to_string()),
            None => std::env::remove_var(INST_RATIO_ENV_VAR),
        }
    }

    // Protocol pipes: controller writes "go", reads handshake/pid/status.
    let mut go_fds = [0 as libc::c_int; 2];
    let mut status_fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(go_fds.as_mut_ptr()) } != 0
        || unsafe { libc::pipe(status_fds.as_mut_ptr()) } != 0
    {
        return Err(anyhow::anyhow!(
            "Failed to create protocol pipes: {}",
            std::io::Error::last_os_error()
        ));
    }
    let (go_read, go_write) = (go_fds[0], go_fds[1]);
    let (status_read, status_write) = (status_fds[0], status_fds[1]);

    let forkserver_pid = match unsafe { fork() }
        .map_err(|e| anyhow::anyhow!("Failed to fork the target process: {e}"))?
    {
        ForkResult::Child => {
            close_fd(go_write);
            close_fd(status_read);
            install_fd(go_read, FORKSRV_FD)?;
            install_fd(status_write, FORKSRV_FD + 1)?;
            run_target(&config);
        }
        ForkResult::Parent { child } => child.as_raw(),
    };

    close_fd(go_read);
    close_fd(status_write);
    let controller = ControlChannel::from_fds(status_read, go_write);

    let hello = controller
        .recv()
        .map_err(|e| anyhow::anyhow!("Target never completed the handshake: {e}"))?;
    if hello != HANDSHAKE_TOKEN {
        return Err(anyhow::anyhow!("Unexpected handshake token: {hello:?}"));
    }
    println!("Fork server is up (pid {forkserver_pid}), driving {} iterations...", config.iterations);

    let mut ever_hit = vec![false; MAP_SIZE];
    let mut crashes = 0u64;
    for iteration in 0..config.iterations {
        bitmap.clear();

        controller
            .send(b"\x00\x00\x00\x00")
            .map_err(|e| anyhow::anyhow!("Fork server went away on iteration {iteration}: {e}"))?;
        let pid_word = controller
            .recv()
            .map_err(|e| anyhow::anyhow!("No child pid on iteration {iteration}: {e}"))?;
        let child_pid = i32::from_ne_bytes(pid_word);
        let status_word = controller
            .recv()
            .map_err(|e| anyhow::anyhow!("No exit status on iteration {iteration}: {e}"))?;
        let raw_status = i32::from_ne_bytes(status_word);
        if !(libc::WIFEXITED(raw_status) && libc::WEXITSTATUS(raw_status) == 0) {
            crashes += 1;
        }

        let snapshot = bitmap.snapshot();
        let mut edges_this_run = 0usize;
        let mut new_edges = 0usize;
        for (slot, &count) in snapshot.iter().enumerate() {
            if count != 0 {
                edges_this_run += 1;
                if !ever_hit[slot] {
                    ever_hit[slot] = true;
                    new_edges += 1;
                }
            }
        }

        print!(
            "\rIter: {}/{}, child pid: {}, edges: {}, new: {}, crashes: {}   ",
            iteration + 1,
            config.iterations,
            child_pid,
            edges_this_run,
            new_edges,
            crashes
        );
        std::io::stdout().flush()?;
    }
    println!();

    // Disconnect; the fork server must notice and exit with its dedicated
    // "parent dead" code.
    close_fd(go_write);
    close_fd(status_read);
    let mut status: libc::c_int = -1;
    if unsafe { libc::waitpid(forkserver_pid, &mut status, 0) } < 0 {
        return Err(anyhow::anyhow!(
            "Failed to reap the fork server: {}",
            std::io::Error::last_os_error()
        ));
    }
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        -1
    };
    println!(
        "Fork server exited with code {} (expected {} after controller disconnect).",
        code,
        FatalExit::ParentDead.code()
    );
    println!(
        "Total distinct edges over the campaign: {}",
        ever_hit.iter().filter(|&&hit| hit).count()
    );
    Ok(())
}
