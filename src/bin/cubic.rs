//! cubic - open or create a Cubic project from the command line.
//!
//! With a new directory and a source ISO, the ISO is mounted, copied and
//! extracted into the project. With an existing project, its state is
//! loaded and the kernel list refreshed. Either way the source disk is
//! unmounted again on exit.

use anyhow::{bail, Context, Result};
use clap::Parser;
use cubic::kernel::KernelList;
use cubic::project::{naming, timestamp_compact, timestamp_display, validate_project_directory};
use cubic::session::{OpenPhase, Teardown};
use cubic::{logging, preflight, IsoSession, Project, ProjectConfig, ProcessRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cubic")]
#[command(about = "Custom Ubuntu ISO Creator")]
#[command(version)]
struct Cli {
    /// Write the log to cubic.<timestamp>.log in the project directory
    #[arg(short, long)]
    log: bool,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,

    /// Project directory (default: the current directory)
    directory: Option<PathBuf>,

    /// Source ISO for a new project; ignored when the project exists
    iso: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // SAFETY: geteuid(2) cannot fail and touches no memory.
    if unsafe { libc::geteuid() } == 0 {
        bail!("Do not run cubic as root; it asks for privileges when it needs them.");
    }

    let directory = absolute(cli.directory.as_deref().unwrap_or(Path::new(".")))?;
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("creating project directory {}", directory.display()))?;
    let project = Project::new(&directory)?;

    let log_file = cli.log.then(|| project.log_file(&timestamp_compact()));
    if let Some(path) = logging::init(cli.verbose, log_file.as_deref()) {
        eprintln!("Logging to {}", path.display());
    }
    log::info!("Cubic {}", env!("CARGO_PKG_VERSION"));

    let session = IsoSession::new(project.clone(), Arc::new(ProcessRunner::new()));
    let result = run(&session, cli.iso.as_deref());

    let report = session.teardown(&Teardown::close());
    if !report.is_clean() {
        log::warn!("{} cleanup step(s) failed", report.failures.len());
    }
    result
}

fn run(session: &IsoSession, iso: Option<&Path>) -> Result<()> {
    let project = session.project();
    let mut config = if project.exists() {
        if let Some(iso) = iso {
            log::info!("Project exists; ignoring {}", iso.display());
        }
        ProjectConfig::load(&project.config_file())?
    } else {
        let iso = iso.context("A source ISO is required to create a new project")?;
        create_project(session, &absolute(iso)?)?
    };

    if !config.status.is_extracted() {
        bail!(
            "The project in {} was not fully extracted; delete it and start again",
            project.work_dir().display()
        );
    }

    refresh_kernels(project, &mut config)?;
    config.project.modify_date = timestamp_display();
    config.save(&project.config_file())?;

    log::info!(
        "Project '{}' ready: {} -> {}",
        config.original.iso_volume_id,
        config.original.iso_file_name,
        config.custom.iso_file_name
    );
    if let Some(kernel) = config.kernels.selected() {
        log::info!("Selected kernel {} ({})", kernel.version_name, kernel.note);
    }
    Ok(())
}

fn create_project(session: &IsoSession, iso: &Path) -> Result<ProjectConfig> {
    let project = session.project();
    validate_project_directory(project.work_dir())?;
    preflight::check_open_tools()?;

    let mut config = ProjectConfig::for_source_iso(iso, "", &timestamp_display(), naming::today());
    config.custom.iso_directory = project.work_dir().display().to_string();

    let mut reported = None;
    let opened = session.open(iso, &mut config, |phase, fraction| {
        let percent = (fraction * 100.0) as u32 / 10 * 10;
        if reported != Some((phase, percent)) {
            reported = Some((phase, percent));
            log::info!("{}: {}%", phase_name(phase), percent);
        }
    });
    if let Err(e) = opened {
        session.teardown(&Teardown::discard());
        return Err(e);
    }

    // The volume id is known only after validation inside `open`.
    config.refresh_custom_names(naming::today());
    config.save(&project.config_file())?;
    Ok(config)
}

fn refresh_kernels(project: &Project, config: &mut ProjectConfig) -> Result<()> {
    let layout = &config.layout;
    let original = layout.in_casper_directory(&project.custom_disk(), layout.vmlinuz_name.as_deref());
    let previous = config.kernels.selected().map(|k| k.version_name.clone());

    let mut kernels = KernelList::discover(
        &project.custom_root(),
        layout.vmlinuz_name.as_deref(),
        layout.initrd_name.as_deref(),
        original.as_deref(),
    )?;
    if let Some(version) = previous {
        kernels.select(&version);
    }
    config.kernels = kernels;
    Ok(())
}

fn phase_name(phase: OpenPhase) -> &'static str {
    match phase {
        OpenPhase::Copy => "Copying disk",
        OpenPhase::Extract => "Extracting root filesystem",
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("reading the current directory")?;
    Ok(cwd.join(path))
}
