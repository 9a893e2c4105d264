// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Mikaela Szekely <mikaela.szekely@qyriad.me>

mod device_config;

use std::future::Future;
use std::io::stdout;
use std::path::PathBuf;

use clap::builder::styling::Styles;
use clap::{CommandFactory, Parser, Subcommand, crate_description, crate_version};
use clap_complete::{Shell, generate};
use color_eyre::config::HookBuilder;
use color_eyre::eyre::{Context, EyreHandler, InstallError, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use owo_colors::OwoColorize;

use reset_engine::context::live_uboot::JtagAssets;
use reset_engine::device::Device;
use reset_engine::progress::{ProgressManager, StatusMap, StepStatus, run_step};
use reset_engine::recipes::{self, LiveLinuxAssets};
use reset_engine::settings::Settings;
use reset_engine::work_dir::WorkDir;

use crate::device_config::{DeviceConfig, build_description};

#[derive(Parser)]
#[command(
    version,
    about = format!("{} v{}", crate_description!(), crate_version!()),
    styles(style()),
    disable_colored_help(false),
    arg_required_else_help(true)
)]
struct CliArguments
{
    /// Path to the JSON device description this run operates on. Required for every
    /// subcommand except `complete`.
    #[arg(global = true, long)]
    device: Option<PathBuf>,

    /// Work directory for extracted/staged artifacts; defaults to `RESET_ENGINE_WORK_DIR`
    /// or `/tmp/reset-engine` (see [`WorkDir::from_env`]).
    #[arg(global = true, long)]
    work_dir: Option<PathBuf>,

    /// Path to a JSON `Settings` document overriding per-phase retry/deadline behavior.
    #[arg(global = true, long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands
{
    /// Enter LiveUboot over JTAG, erase the whole flash, and write a firmware image to it.
    ResetFirmware
    {
        #[arg(long)]
        firmware: PathBuf,
        #[arg(long)]
        fsbl: PathBuf,
        #[arg(long)]
        uboot: PathBuf,
        #[arg(long)]
        openocd_config: PathBuf,
    },

    /// Repartition the MMC and write an operating system image to both system partitions.
    ResetOperatingSystem
    {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        image_version: String,
    },

    /// Write a config image to the MMC `config` partition.
    ResetConfig
    {
        #[arg(long)]
        image: PathBuf,
    },

    /// Boot a stateless live Linux image and reformat the data partition.
    ResetData
    {
        #[arg(long)]
        kernel: PathBuf,
        #[arg(long)]
        rootfs: PathBuf,
    },

    /// Run the on-device electronics self-test and print its captured frequency sweep.
    SetElectronicsReference,

    /// Print a shell completion script to stdout.
    Complete
    {
        shell: Shell
    },
}

type EyreHookFunc = Box<dyn Fn(&(dyn std::error::Error + 'static)) -> Box<dyn EyreHandler> + Send + Sync + 'static>;
type PanicHookFunc = Box<dyn Fn(&std::panic::PanicHookInfo<'_>) + Send + Sync + 'static>;

struct ResetEngineHook
{
    inner_hook: EyreHookFunc,
}

struct ResetEnginePanic
{
    inner_hook: PanicHookFunc,
}

struct ResetEngineHandler
{
    inner_handler: Box<dyn EyreHandler>,
}

impl ResetEngineHook
{
    fn build_handler(&self, error: &(dyn std::error::Error + 'static)) -> ResetEngineHandler
    {
        ResetEngineHandler {
            inner_handler: (*self.inner_hook)(error),
        }
    }

    pub fn install(self) -> Result<(), InstallError>
    {
        color_eyre::eyre::set_hook(self.into_eyre_hook())
    }

    pub fn into_eyre_hook(self) -> EyreHookFunc
    {
        Box::new(move |err| Box::new(self.build_handler(err)))
    }
}

impl ResetEnginePanic
{
    pub fn install(self)
    {
        std::panic::set_hook(self.into_panic_hook());
    }

    pub fn into_panic_hook(self) -> PanicHookFunc
    {
        Box::new(move |panic_info| {
            self.print_header();
            (*self.inner_hook)(panic_info);
            self.print_footer();
        })
    }

    fn print_header(&self)
    {
        eprintln!("------------[ ✂ cut here ✂ ]------------");
        eprintln!("Unhandled crash in reset-engine-cli v{}", crate_version!());
        eprintln!();
    }

    fn print_footer(&self)
    {
        eprintln!();
        eprintln!("{}", "Please include all lines down to this one from the cut here".yellow());
        eprintln!("{}", "marker when reporting this crash.".yellow());
    }
}

impl EyreHandler for ResetEngineHandler
{
    fn debug(&self, error: &(dyn std::error::Error + 'static), fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result
    {
        writeln!(fmt, "------------[ ✂ cut here ✂ ]------------")?;
        write!(fmt, "Unhandled crash in reset-engine-cli v{}", crate_version!())?;
        self.inner_handler.debug(error, fmt)?;
        writeln!(fmt)?;
        writeln!(fmt)?;
        writeln!(fmt, "{}", "Please include all lines down to this one from the cut here".yellow())?;
        write!(fmt, "{}", "marker when reporting this crash.".yellow())
    }

    fn track_caller(&mut self, location: &'static std::panic::Location<'static>)
    {
        self.inner_handler.track_caller(location);
    }
}

fn install_error_handler() -> Result<()>
{
    let default_handler = HookBuilder::default();
    let (panic_hook, eyre_hook) = default_handler.try_into_hooks()?;

    ResetEnginePanic { inner_hook: panic_hook.into_panic_hook() }.install();
    ResetEngineHook { inner_hook: eyre_hook.into_eyre_hook() }.install()?;
    Ok(())
}

/// Clap v3 style (approximate). See https://stackoverflow.com/a/75343828
fn style() -> Styles
{
    Styles::styled()
        .usage(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))).bold())
        .header(anstyle::Style::new().bold().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))))
        .literal(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))))
}

fn spinner_message(name: &str, status: &StepStatus) -> String
{
    match status {
        StepStatus::Idle { .. } => format!("{name}: waiting"),
        StepStatus::Skipped { .. } => format!("{name}: skipped"),
        StepStatus::Running { tries, .. } => format!("{name}: running (attempt {tries})"),
        StepStatus::Completed { tries, .. } => format!("{name}: completed after {tries} attempt(s)"),
        StepStatus::Cancelled { tries, .. } => format!("{name}: cancelled after {tries} attempt(s)"),
        StepStatus::Failed { tries, .. } => format!("{name}: failed after {tries} attempt(s)"),
    }
}

/// Drive one named phase to completion through the retry orchestrator, rendering its
/// `Idle -> Running -> {Completed,Failed}` transitions onto a spinner.
async fn drive<F, Fut, T>(settings: &Settings, name: &'static str, make_fut: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, reset_engine::error::Error>>,
{
    let mut progress = ProgressManager::new([name]);
    let mut receiver = progress.subscribe();

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} {msg}").expect("static template is valid"));
    bar.enable_steady_tick(std::time::Duration::from_millis(120));

    let watcher_bar = bar.clone();
    let watcher = tokio::spawn(async move {
        loop {
            let status: StatusMap = receiver.borrow_and_update().clone();
            if let Some(status) = status.get(name) {
                watcher_bar.set_message(spinner_message(name, status));
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    });

    let phase_settings = settings.get(name);
    let result = run_step(&mut progress, name, &phase_settings, make_fut).await;
    watcher.abort();

    match result {
        Ok(Some(value)) => {
            bar.finish_with_message(spinner_message(name, progress.status(name)));
            Ok(value)
        },
        Ok(None) => {
            bar.finish_with_message(format!("{name}: skipped (disabled in settings)"));
            Err(eyre!("{name} was skipped"))
        },
        Err(err) => {
            bar.finish_with_message(spinner_message(name, progress.status(name)));
            Err(err).wrap_err_with(|| format!("{name} failed"))
        },
    }
}

fn load_device(path: &PathBuf) -> Result<Device>
{
    let data = std::fs::read_to_string(path).wrap_err_with(|| format!("reading device description {}", path.display()))?;
    let config = DeviceConfig::from_json(&data)?;
    let description = build_description(config)?;
    Ok(Device::from_description(description))
}

fn load_settings(path: &Option<PathBuf>) -> Result<Settings>
{
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path).wrap_err_with(|| format!("reading settings {}", path.display()))?;
            Settings::from_json(&data).wrap_err("parsing settings JSON")
        },
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()>
{
    install_error_handler()?;
    env_logger::Builder::new().filter_level(log::LevelFilter::Info).parse_default_env().init();

    let cli_args = CliArguments::parse();

    if let Commands::Complete { shell } = cli_args.command {
        let mut cmd = CliArguments::command();
        generate(shell, &mut cmd, "reset-engine-cli", &mut stdout());
        return Ok(());
    }

    let device_path = cli_args.device.ok_or_else(|| eyre!("--device is required for this command"))?;
    let device = load_device(&device_path)?;
    let settings = load_settings(&cli_args.settings)?;
    let work_dir = cli_args.work_dir.map(WorkDir::new).unwrap_or_else(WorkDir::from_env);

    match cli_args.command {
        Commands::ResetFirmware { firmware, fsbl, uboot, openocd_config } => {
            let assets = JtagAssets { fsbl, uboot, openocd_config };
            drive(&settings, "reset_firmware", || recipes::reset_firmware(&device, work_dir.clone(), &assets, &firmware)).await?;
        },
        Commands::ResetOperatingSystem { image, image_version } => {
            drive(&settings, "reset_operating_system", || {
                recipes::reset_operating_system(&device, work_dir.clone(), &image, &image_version)
            })
            .await?;
        },
        Commands::ResetConfig { image } => {
            drive(&settings, "reset_config", || recipes::reset_config(&device, work_dir.clone(), &image)).await?;
        },
        Commands::ResetData { kernel, rootfs } => {
            let assets = LiveLinuxAssets { kernel_image: &kernel, rootfs_image: &rootfs };
            drive(&settings, "reset_data", || recipes::reset_data(&device, work_dir.clone(), &assets)).await?;
        },
        Commands::SetElectronicsReference => {
            let sweep = drive(&settings, "set_electronics_reference", || recipes::set_electronics_reference(&device, work_dir.clone())).await?;
            println!("{:#?}", sweep);
        },
        Commands::Complete { .. } => {
            warn!("completion already handled above");
        },
    }

    Ok(())
}
