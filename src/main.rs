use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use sysusers::config::{self, DeclaredSets};
use sysusers::lock;
use sysusers::nss::{LibcNameService, NameService};
use sysusers::session::Session;
use sysusers::write;

/// Creates system user accounts from declarative configuration.
#[derive(Parser, Debug)]
#[command(version, about, max_term_width = 100)]
struct Cli {
    /// Configuration files to apply; all *.conf files under the sysusers
    /// directories when none are given
    #[arg(value_name = "CONFIG")]
    configs: Vec<PathBuf>,

    /// Operate on an alternate filesystem root
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    unsafe {
        libc::umask(0o022);
    }

    let root = match &cli.root {
        Some(path) => Some(absolute_root(path)?),
        None => None,
    };

    let mut declared = DeclaredSets::new();
    // bad lines are logged as they are hit; the first error only decides
    // the exit status once the run is over
    let mut deferred: Result<()> = Ok(());

    if cli.configs.is_empty() {
        let files = config::enumerate_config_files(root.as_deref())
            .context("Failed to enumerate sysusers.d files")?;
        for path in &files {
            if let Err(err) = config::read_config_file(path, true, &mut declared) {
                if deferred.is_ok() {
                    deferred = Err(err.into());
                }
            }
        }
    } else {
        for path in &cli.configs {
            if let Err(err) = config::read_config_file(path, false, &mut declared) {
                if deferred.is_ok() {
                    deferred = Err(err.into());
                }
            }
        }
    }

    // the host resolver only reflects the real root
    let probe: Option<Box<dyn NameService>> = if root.is_none() {
        Some(Box::new(LibcNameService))
    } else {
        None
    };
    let mut session = Session::new(root, probe, declared);

    let _lock = lock::take_lock(session.root()).context("Failed to take /etc/.pwd.lock")?;
    session
        .load_databases()
        .context("Failed to load account databases")?;
    session.reconcile()?;
    write::commit(&session).context("Failed to write account databases")?;

    deferred
}

fn absolute_root(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().context("read current dir")?.join(path)
    };
    // drop '.' components and duplicate separators
    Ok(absolute.components().collect())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .without_time()
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
