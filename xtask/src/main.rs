//! Build helper for tc-dropper.
//!
//! The classifiers target `bpfel-unknown-none` and need nightly plus
//! `bpf-linker`, so they live outside the main workspace and are built here.
//!
//! Usage:
//!   cargo xtask build-ebpf [--release]
//!   cargo xtask build [--release]                  # eBPF object + controller
//!   cargo xtask run [--release] [--sudo] -- <args> # build, then attach

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

const EBPF_CRATE: &str = "tc-dropper-ebpf";
const CONTROLLER_CRATE: &str = "tc-dropper";

#[derive(Parser)]
enum Cli {
    /// Build the eBPF classifier object only.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build the eBPF object and the userspace controller.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run the controller.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Run through `sudo -E`; attaching TC filters needs CAP_NET_ADMIN.
        #[arg(long)]
        sudo: bool,
        /// Arguments passed to tc-dropper, e.g. `veth1 --mode fixed --prob 10`.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let root = workspace_root()?;

    match Cli::parse() {
        Cli::BuildEbpf { release } => {
            build_ebpf(&root, release)?;
        }
        Cli::Build { release } => {
            build_ebpf(&root, release)?;
            build_controller(&root, release)?;
        }
        Cli::Run {
            release,
            sudo,
            args,
        } => {
            build_ebpf(&root, release)?;
            build_controller(&root, release)?;
            run_controller(&root, release, sudo, &args)?;
        }
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

/// Build the eBPF classifiers and copy the object to `target/tc-dropper-ebpf`,
/// the controller's default `--ebpf-program` path.
///
/// This requires:
/// - `bpf-linker`: `cargo install bpf-linker`
/// - a nightly toolchain with `rust-src`: `rustup component add rust-src --toolchain nightly`
fn build_ebpf(root: &Path, release: bool) -> Result<()> {
    let ebpf_dir = root.join(EBPF_CRATE);

    println!("=> Building eBPF classifiers...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&ebpf_dir)
        .arg("+nightly")
        .arg("build")
        .arg("--target=bpfel-unknown-none")
        .arg("-Z")
        .arg("build-std=core");

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for eBPF classifiers")?;
    if !status.success() {
        bail!("eBPF build failed");
    }

    let object = ebpf_dir
        .join("target")
        .join("bpfel-unknown-none")
        .join(profile(release))
        .join(EBPF_CRATE);
    if !object.exists() {
        bail!("eBPF build produced no object at {}", object.display());
    }

    let dest_dir = root.join("target");
    std::fs::create_dir_all(&dest_dir)
        .with_context(|| format!("creating {}", dest_dir.display()))?;

    let dest = dest_dir.join(EBPF_CRATE);
    std::fs::copy(&object, &dest)
        .with_context(|| format!("copying {} to {}", object.display(), dest.display()))?;

    println!("   eBPF object: {}", dest.display());
    Ok(())
}

/// Build the userspace controller.
fn build_controller(root: &Path, release: bool) -> Result<()> {
    println!("=> Building controller...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(root)
        .arg("build")
        .arg("-p")
        .arg(CONTROLLER_CRATE);

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("running cargo build for controller")?;
    if !status.success() {
        bail!("controller build failed");
    }

    Ok(())
}

/// Run the controller against the freshly built eBPF object.
fn run_controller(root: &Path, release: bool, sudo: bool, extra_args: &[String]) -> Result<()> {
    let binary = root
        .join("target")
        .join(profile(release))
        .join(CONTROLLER_CRATE);
    let ebpf_program = root.join("target").join(EBPF_CRATE);

    let mut cmd = if sudo {
        let mut cmd = Command::new("sudo");
        cmd.arg("-E").arg(&binary);
        cmd
    } else {
        Command::new(&binary)
    };
    cmd.arg("--ebpf-program").arg(&ebpf_program).args(extra_args);

    println!("=> Running {}...", CONTROLLER_CRATE);

    let status = cmd.status().context("running tc-dropper")?;
    if !status.success() {
        bail!("tc-dropper exited with {}", status);
    }

    Ok(())
}
