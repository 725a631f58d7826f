//! hotclone CLI: clone running VMs through a crash-safe transaction.
//!
//! Commands:
//! - `hotclone clone SOURCE DEST` - snapshot, copy, merge, register
//! - `hotclone status [TXN]` - show the transaction log
//! - `hotclone recover` - settle transactions a crash left behind
//! - `hotclone gc` / `hotclone forget TXN` - prune the log
//! - `hotclone setup` - write the default config
//!
//! The exit code is the outcome: 0 success, 2 rejected request, 3 disk
//! locked, 4 rolled back cleanly, 5 partial failure, 6 ambiguous recovery,
//! 7 rollback incomplete, 1 anything else. `status` exits 6 when the log
//! holds records it cannot read.

mod commands;
mod format;
mod parse;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use hotclone_core::CloneError;
use hotclone_engine::{
    plan_clone, CloneManager, FileBlockCopier, HotcloneConfig, VirshHypervisor,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::build_cli;
use format::{
    format_corrupt, format_error, format_plan, format_records, format_recovery, format_removed,
    format_report, OutputMode,
};
use parse::{matches_to_action, CliAction, Settings};

fn main() {
    let matches = build_cli().get_matches();
    init_tracing(matches.get_count("verbose"));

    let mode = if matches.get_flag("json") {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let (settings, action) = match matches_to_action(&matches) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    if let CliAction::Setup = action {
        process::exit(run_setup(&settings));
    }

    let config = match load_config(&settings) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };

    let code = match run(config, action, mode) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", format_error(&e, mode));
            e.exit_code()
        }
    };
    process::exit(code);
}

/// `-v` = info, `-vv` = debug; `RUST_LOG` wins when set.
fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(settings: &Settings) -> anyhow::Result<HotcloneConfig> {
    let path = settings.config_path();
    let mut config = if settings.config_path.is_some() {
        HotcloneConfig::from_file(&path)?
    } else {
        HotcloneConfig::load_or_default(&path)?
    };
    settings.apply(&mut config);
    config
        .validate()
        .with_context(|| format!("invalid settings (config file {})", path.display()))?;
    Ok(config)
}

fn run_setup(settings: &Settings) -> i32 {
    let path = settings.config_path();
    match HotcloneConfig::write_default_if_missing(&path) {
        Ok(()) => {
            println!("config: {}", path.display());
            0
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}

fn run(config: HotcloneConfig, action: CliAction, mode: OutputMode) -> Result<i32, CloneError> {
    let hypervisor = Arc::new(VirshHypervisor::new(&config.hypervisor));

    if let CliAction::Clone {
        request,
        dry_run: true,
    } = &action
    {
        let plan = plan_clone(hypervisor.as_ref(), &config, request)?;
        println!("{}", format_plan(&plan, mode));
        return Ok(0);
    }

    let copier = Arc::new(FileBlockCopier::new(&config.copy));
    let manager = CloneManager::open(config, hypervisor, copier)?;

    match action {
        CliAction::Clone { request, .. } => {
            // A previous run may have crashed holding snapshots on these disks.
            let recovered = manager.recover_on_startup()?;
            if !recovered.is_empty() {
                info!(target: "hotclone::recovery", records = recovered.len(), "Recovered interrupted transactions");
            }
            if recovered.needs_operator() {
                warn!(
                    target: "hotclone::recovery",
                    "Some interrupted transactions need manual attention; see `hotclone status`"
                );
            }
            let report = manager.clone_vm(&request)?;
            println!("{}", format_report(&report, mode));
            Ok(0)
        }
        CliAction::Status { txn: Some(txn_id) } => match manager.status(txn_id)? {
            Some(record) => {
                println!("{}", format_records(std::slice::from_ref(&record), mode));
                Ok(0)
            }
            None => Err(CloneError::Validation(format!(
                "no transaction {} in the log",
                txn_id
            ))),
        },
        CliAction::Status { txn: None } => {
            println!("{}", format_records(&manager.list()?, mode));
            let corrupt = manager.corrupt_records()?;
            if corrupt.is_empty() {
                Ok(0)
            } else {
                eprintln!("{}", format_corrupt(&corrupt, mode));
                Ok(6)
            }
        }
        CliAction::Recover => {
            let report = manager.recover_on_startup()?;
            println!("{}", format_recovery(&report, mode));
            Ok(report.exit_code())
        }
        CliAction::Gc => {
            let removed = manager.collect_garbage()?;
            println!("{}", format_removed(&removed, mode));
            Ok(0)
        }
        CliAction::Forget { txn } => {
            let removed = if manager.forget(txn)? { vec![txn] } else { Vec::new() };
            println!("{}", format_removed(&removed, mode));
            Ok(0)
        }
        CliAction::Setup => Ok(0),
    }
}
