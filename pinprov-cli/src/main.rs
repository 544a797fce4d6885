mod cli;

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use cli::{Commands, Opt};
use futures::StreamExt;
use pinprov_core::bundle::Bundle;
use pinprov_core::convergence::{self, ProvisionRequest};
use pinprov_core::discovery;
use pinprov_core::pipeline::Stage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    ctrlc::set_handler(|| {
        pinprov_core::wait::request_shutdown();
        pinprov_core::transport::close_all();
    })
    .expect("failed to install Ctrl+C handler");

    let opt = Opt::parse();

    match opt.command {
        Commands::Provision {
            firmware,
            software,
            uf2_dir,
            skip_firmware,
            once,
            listen_after,
            quiet,
        } => provision(firmware, software, uf2_dir, skip_firmware, once, listen_after, quiet).await,
        Commands::ListDevices => {
            list_devices();
            Ok(())
        }
        Commands::VerifyBundle { path } => verify_bundle(&path),
        Commands::GenerateCompletion { shell } => {
            generate_completion(shell);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn provision(
    firmware: Option<PathBuf>,
    software: Option<PathBuf>,
    uf2_dir: PathBuf,
    skip_firmware: bool,
    once: bool,
    listen_after: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let nuke = pinprov_core::uf2::find_nuke_image(&uf2_dir)?;
    let firmware = if skip_firmware {
        nuke.clone()
    } else {
        resolve_firmware(firmware, &uf2_dir)?
    };
    let software = resolve_software(software)?;

    let raw = std::fs::read(&software)?;
    let bundle = Bundle::load(&raw)?;
    let term = console::Term::stderr();
    term.write_line(&format!(
        "Loaded bundle with {} file(s), signature OK",
        bundle.files.len()
    ))?;

    let request = ProvisionRequest {
        firmware,
        nuke,
        bundle,
        skip_firmware,
        once,
    };

    if quiet {
        tokio::task::spawn_blocking(move || convergence::run(&request, None)).await??;
    } else {
        let (tx, mut rx) = futures::channel::mpsc::channel(20);
        let render_task = tokio::task::spawn(async move {
            let bar = indicatif::ProgressBar::new_spinner();
            bar.set_style(
                indicatif::ProgressStyle::with_template("{spinner} {msg}")
                    .expect("valid progress template"),
            );
            while let Some(stage) = rx.next().await {
                bar.set_message(stage_msg(stage));
                bar.tick();
            }
            bar.finish_and_clear();
        });

        let provision_task =
            tokio::task::spawn_blocking(move || convergence::run(&request, Some(tx)));
        provision_task.await??;
        render_task.await.ok();
    }

    if listen_after {
        term.write_line("Listening to the first connected board. Press Ctrl+C to exit.")?;
        tokio::task::spawn_blocking(convergence::listen_after).await??;
    }

    Ok(())
}

fn resolve_firmware(firmware: Option<PathBuf>, uf2_dir: &Path) -> anyhow::Result<PathBuf> {
    if let Some(path) = firmware {
        return Ok(path);
    }

    let images = pinprov_core::uf2::list_bundled(uf2_dir)?;
    let names: Vec<String> = images
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();

    let selection = dialoguer::Select::new()
        .with_prompt("Select a firmware image")
        .items(&names)
        .default(0)
        .interact()?;

    Ok(images[selection].clone())
}

fn resolve_software(software: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = software {
        return Ok(path);
    }

    let input: String = dialoguer::Input::new()
        .with_prompt("Path to the signed update bundle")
        .interact_text()?;
    Ok(PathBuf::from(input))
}

fn list_devices() {
    let term = console::Term::stdout();
    let snapshot = discovery::FleetSnapshot::take();

    term.write_line("Runtime ports:").unwrap();
    for port in &snapshot.runtime {
        term.write_line(&format!("  {port}")).unwrap();
    }

    term.write_line("Bootloader volumes:").unwrap();
    for volume in &snapshot.bootloader {
        term.write_line(&format!("  {}", volume.display())).unwrap();
    }
}

fn verify_bundle(path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read(path)?;
    match pinprov_core::bundle::verify(&raw) {
        Ok(()) => {
            println!("OK: bundle signature is valid");
            Ok(())
        }
        Err(e) => {
            eprintln!("FAILED: {e}");
            std::process::exit(1);
        }
    }
}

fn stage_msg(stage: Stage) -> &'static str {
    match stage {
        Stage::CoercingToBootloader => "Entering bootloader",
        Stage::Wiping => "Wiping flash",
        Stage::FlashingFirmware => "Flashing firmware",
        Stage::FlashingApplication => "Transferring application files",
    }
}

fn generate_completion(shell: clap_complete::Shell) {
    let mut cmd = Opt::command();
    const BIN_NAME: &str = env!("CARGO_PKG_NAME");
    clap_complete::generate(shell, &mut cmd, BIN_NAME, &mut std::io::stdout())
}
