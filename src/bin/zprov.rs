// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use zprov::{
    config::Profile,
    context::{ContextResolver, Parameter, RunContext},
    drafter::write_managed,
    path::default_profile_path,
    plan::Phase,
    preflight::{check_all, HostEnvironment, Verdict},
    prompt::{AssumeYes, InquirePrompt, Prompt},
    summary::{render, render_steps, render_survey},
    system::SystemRunner,
};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  zprov [options] install [<install-options>]\n  zprov [options] configure [<configure-options>]\n  zprov [options] status <phase>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub globals: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Install(opts) => run_phase(&self.globals, Phase::Install, opts.overrides()),
            Command::Configure(opts) => {
                run_phase(&self.globals, Phase::Configure, opts.overrides())
            }
            Command::Status(opts) => run_status(&self.globals, opts),
            Command::InitProfile(opts) => run_init_profile(opts),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct GlobalOptions {
    /// Path to provisioning profile.
    #[arg(long, global = true, value_name = "path")]
    pub profile: Option<PathBuf>,

    /// Never prompt, accept every default and confirm every question.
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Kill external commands that run longer than this many seconds.
    #[arg(long, global = true, value_name = "secs")]
    pub timeout: Option<u64>,
}

impl GlobalOptions {
    fn prompt(&self) -> Box<dyn Prompt> {
        match self.yes {
            true => Box::new(AssumeYes),
            false => Box::new(InquirePrompt),
        }
    }

    fn runner(&self) -> SystemRunner {
        SystemRunner::new().with_timeout(self.timeout.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Partition disk, create pool and datasets from the live medium.
    #[command(override_usage = "zprov install [options]")]
    Install(InstallOptions),

    /// Configure freshly installed system to boot from ZFS.
    #[command(override_usage = "zprov configure [options]")]
    Configure(ConfigureOptions),

    /// Show current state of every step of a phase without changing anything.
    #[command(override_usage = "zprov status [options] <phase>")]
    Status(StatusOptions),

    /// Write built-in profile to configuration directory for editing.
    #[command(override_usage = "zprov init-profile [options]")]
    InitProfile(InitProfileOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InstallOptions {
    /// Directory the new system is mounted at.
    #[arg(short, long, value_name = "path")]
    pub root: Option<String>,

    /// Block device to wipe and install onto.
    #[arg(short, long, value_name = "device")]
    pub disk: Option<String>,

    /// Name of pool to create.
    #[arg(short, long, value_name = "name")]
    pub pool: Option<String>,

    /// Size of swap volume, 0 for none.
    #[arg(short, long, value_name = "size")]
    pub swap_size: Option<String>,
}

impl InstallOptions {
    fn overrides(self) -> Vec<(Parameter, Option<String>)> {
        vec![
            (Parameter::Root, self.root),
            (Parameter::Disk, self.disk),
            (Parameter::Pool, self.pool),
            (Parameter::SwapSize, self.swap_size),
        ]
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigureOptions {
    /// Root directory of system to configure.
    #[arg(short, long, value_name = "path")]
    pub root: Option<String>,

    /// Name of pool the system lives on.
    #[arg(short, long, value_name = "name")]
    pub pool: Option<String>,

    /// Hostname of the system.
    #[arg(short = 'n', long, value_name = "name")]
    pub hostname: Option<String>,

    /// Primary user of the system.
    #[arg(short, long, value_name = "name")]
    pub user: Option<String>,

    /// Account whose public SSH keys get authorized for the primary user.
    #[arg(short, long, value_name = "account")]
    pub keys_account: Option<String>,
}

impl ConfigureOptions {
    fn overrides(self) -> Vec<(Parameter, Option<String>)> {
        vec![
            (Parameter::Root, self.root),
            (Parameter::Pool, self.pool),
            (Parameter::Hostname, self.hostname),
            (Parameter::Username, self.user),
            (Parameter::KeysAccount, self.keys_account),
        ]
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Phase to survey.
    #[arg(required = true, value_name = "phase")]
    pub phase: Phase,

    /// Root directory of system to survey.
    #[arg(short, long, value_name = "path")]
    pub root: Option<String>,

    /// Target disk.
    #[arg(short, long, value_name = "device")]
    pub disk: Option<String>,

    /// Name of pool.
    #[arg(short, long, value_name = "name")]
    pub pool: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitProfileOptions {
    /// Where to write profile instead of the configuration directory.
    #[arg(short, long, value_name = "path")]
    pub output: Option<PathBuf>,

    /// Overwrite existing profile, keeping a backup of it.
    #[arg(short, long)]
    pub force: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn load_profile(path: Option<&Path>) -> Result<Profile> {
    if let Some(path) = path {
        info!("using profile {:?}", path.display());
        return Ok(Profile::load(path)?);
    }

    let path = default_profile_path()?;
    if path.is_file() {
        info!("using profile {:?}", path.display());
        return Ok(Profile::load(path)?);
    }

    info!("using built-in profile");
    Ok(Profile::builtin()?)
}

fn resolve(
    globals: &GlobalOptions,
    profile: &Profile,
    phase: Phase,
    overrides: Vec<(Parameter, Option<String>)>,
) -> Result<RunContext> {
    let settings = &profile.settings;
    let mut resolver = ContextResolver::new()
        .with_default(Parameter::Root, phase.default_root())
        .with_default(Parameter::Disk, &settings.disk)
        .with_default(Parameter::Pool, &settings.pool)
        .with_default(Parameter::SwapSize, &settings.swap_size)
        .with_default(Parameter::Hostname, &settings.hostname)
        .with_default(Parameter::Username, &settings.username)
        .with_default(Parameter::KeysAccount, &settings.keys_account);
    for (parameter, value) in overrides {
        resolver = resolver.with_override(parameter, value);
    }

    Ok(resolver.resolve(phase.parameters(), globals.prompt().as_ref())?)
}

fn run_phase(
    globals: &GlobalOptions,
    phase: Phase,
    overrides: Vec<(Parameter, Option<String>)>,
) -> Result<()> {
    let profile = load_profile(globals.profile.as_deref())?;
    let prompt = globals.prompt();

    let requirements = phase.requirements(&profile);
    if check_all(&requirements, &HostEnvironment, prompt.as_ref())? == Verdict::Declined {
        info!("{phase} declined, nothing was changed");
        return Ok(());
    }

    let ctx = resolve(globals, &profile, phase, overrides)?;
    let pipeline = phase.plan(&profile, &ctx, &globals.runner())?;
    info!("{phase} {} steps against {:?}", pipeline.step_ids().len(), ctx.root.display());

    match pipeline.run(&ctx, prompt.as_ref()) {
        Ok(report) => {
            print!("{}", render(&report, &ctx, phase.summary_template(&profile)));
            Ok(())
        }
        Err(failure) => {
            eprint!("{}", render_steps(&failure.report));
            Err(failure.into())
        }
    }
}

fn run_status(globals: &GlobalOptions, opts: StatusOptions) -> Result<()> {
    let profile = load_profile(globals.profile.as_deref())?;
    let overrides = vec![
        (Parameter::Root, opts.root),
        (Parameter::Disk, opts.disk),
        (Parameter::Pool, opts.pool),
    ];

    let ctx = resolve(globals, &profile, opts.phase, overrides)?;
    let pipeline = opts.phase.plan(&profile, &ctx, &globals.runner())?;
    print!("{}", render_survey(&pipeline.survey(&ctx)));

    Ok(())
}

fn run_init_profile(opts: InitProfileOptions) -> Result<()> {
    let path = match opts.output {
        Some(path) => path,
        None => default_profile_path()?,
    };

    if path.exists() && !opts.force {
        bail!(
            "profile already exists at {:?}, use --force to overwrite it",
            path.display()
        );
    }

    write_managed(&path, Profile::builtin()?.to_string())?;
    info!("wrote profile to {:?}", path.display());

    Ok(())
}
