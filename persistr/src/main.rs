use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use persistr_core::orchestrate::{Options, StageEvent, provision};
use persistr_core::platform::LiveSystem;
use persistr_core::select::select_candidate;
use persistr_core::{PERSISTENCE_FS, PERSISTENCE_LABEL};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "persistr")]
#[command(about = "Provision live-boot persistence on a flashed removable medium", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Target disk (e.g. /dev/sdb); auto-detected when omitted
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Skip the interactive confirmation
    #[arg(short = 'y', long = "yes")]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List disks and partitions as currently inventoried
    List,
}

fn require_root() -> Result<()> {
    #[cfg(unix)]
    if !nix::unistd::Uid::effective().is_root() {
        return Err(anyhow!(
            "run as root: partitioning and mounting need it (try sudo)"
        ));
    }
    Ok(())
}

fn print_inventory(sys: &persistr_core::system::System<'_>) -> Result<()> {
    let disks = sys.inventory.inventory()?;
    if disks.is_empty() {
        println!("No disks found.");
        return Ok(());
    }
    for disk in &disks {
        println!("{disk}");
        for partition in &disk.partitions {
            println!("  {partition}");
        }
    }
    Ok(())
}

fn print_stage(event: &StageEvent) {
    match event {
        StageEvent::Resolved { disk, auto } => {
            let how = if *auto { "auto-detected" } else { "explicit" };
            println!(
                "Target disk: {} ({how})",
                style(disk.display()).cyan()
            );
        }
        StageEvent::Quiesced { cleared, failed } => {
            println!("Unmounted {cleared} stray mount(s) before proceeding.");
            for target in failed {
                println!(
                    "  {} could not unmount {}",
                    style("warning:").yellow(),
                    target.display()
                );
            }
        }
        StageEvent::ExistingVolume { device } => {
            println!(
                "Found existing persistence volume: {}",
                style(device.display()).cyan()
            );
        }
        StageEvent::PartitionCreated {
            disk,
            start_mib,
            end_mib,
        } => {
            println!(
                "Created partition on {} spanning {:.0}–{:.0} MiB.",
                disk.display(),
                start_mib,
                end_mib
            );
        }
        StageEvent::PartitionExists { device } => {
            println!("Partition {} already exists; not repartitioning.", device.display());
        }
        StageEvent::Formatted { device } => {
            println!(
                "Formatted {} as {PERSISTENCE_FS} (label `{PERSISTENCE_LABEL}`).",
                device.display()
            );
        }
        StageEvent::FormatSkipped { device } => {
            println!(
                "{} already carries the persistence filesystem; existing data kept.",
                device.display()
            );
        }
        StageEvent::ConfWritten {
            device,
            target,
            reused_mount,
        } => {
            if *reused_mount {
                println!(
                    "Wrote persistence.conf via the existing mount of {} at {}.",
                    device.display(),
                    target.display()
                );
            } else {
                println!("Wrote persistence.conf to {}.", device.display());
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let live = LiveSystem::new();
    let sys = live.system();

    if let Some(Commands::List) = cli.command {
        return print_inventory(&sys);
    }

    require_root()?;

    if let Some(device) = &cli.device {
        if !device.exists() {
            return Err(anyhow!("device not found: {}", device.display()));
        }
    }

    // Resolve the target up front so the confirmation names the right disk.
    let target = match cli.device.clone() {
        Some(device) => device,
        None => {
            let disks = sys.inventory.inventory()?;
            select_candidate(&disks)?
        }
    };

    println!(
        "{} This prepares {} for live persistence.",
        style("WARNING:").red().bold(),
        style(target.display()).cyan()
    );
    println!("  A partition may be created in the trailing free space and");
    println!("  formatted as {PERSISTENCE_FS} (label `{PERSISTENCE_LABEL}`), destroying");
    println!("  whatever that space held.");
    println!();

    if !cli.yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Are you sure you want to proceed?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled; the disk was not touched.");
            return Ok(());
        }
        println!();
    }

    let opts = Options {
        device: Some(target),
        ..Options::default()
    };
    let report = provision(&sys, &opts, |event| print_stage(&event))?;

    println!();
    println!(
        "{} Persistence is set up on {}.",
        style("Done.").green().bold(),
        style(report.device.display()).cyan()
    );
    println!("Reboot and choose: Live system (persistence)");
    Ok(())
}
