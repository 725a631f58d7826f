//! ArgMatches → CliAction conversion.
//!
//! Global flags become [`Settings`] (where to find the config, and which of
//! its values to override); the subcommand becomes a [`CliAction`].

use std::path::PathBuf;

use clap::ArgMatches;
use hotclone_core::{CloneRequest, TxnId};
use hotclone_engine::{HotcloneConfig, CONFIG_FILE_NAME};

const DEFAULT_CONFIG_DIR: &str = "/etc/hotclone";

/// The result of parsing the command line.
#[derive(Debug)]
pub enum CliAction {
    /// Run (or only plan) a clone.
    Clone {
        request: CloneRequest,
        dry_run: bool,
    },
    /// Show one record, or every record.
    Status { txn: Option<TxnId> },
    /// Run startup recovery and exit.
    Recover,
    /// Apply the retention window.
    Gc,
    /// Delete a settled record.
    Forget { txn: TxnId },
    /// Write the default config file.
    Setup,
}

/// Config location plus command-line overrides.
#[derive(Debug, Default)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub dest_dir: Option<PathBuf>,
    pub connect: Option<String>,
    pub workdir: Option<PathBuf>,
    pub quiesce: bool,
    pub parallel: Option<usize>,
}

impl Settings {
    /// Config file to read, explicit or the system default.
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR).join(CONFIG_FILE_NAME))
    }

    /// Apply the overrides; flags win over file values.
    pub fn apply(&self, config: &mut HotcloneConfig) {
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(dir) = &self.dest_dir {
            config.dest_dir = dir.clone();
        }
        if let Some(uri) = &self.connect {
            config.hypervisor.uri = Some(uri.clone());
        }
        if let Some(dir) = &self.workdir {
            config.hypervisor.workdir = Some(dir.clone());
        }
        if self.quiesce {
            config.hypervisor.quiesce = true;
        }
        if let Some(parallel) = self.parallel {
            config.max_parallel_disks = parallel;
        }
    }
}

/// Translate parsed arguments into settings and an action.
pub fn matches_to_action(matches: &ArgMatches) -> Result<(Settings, CliAction), String> {
    let mut settings = Settings {
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        state_dir: matches.get_one::<String>("state-dir").map(PathBuf::from),
        connect: matches.get_one::<String>("connect").cloned(),
        ..Settings::default()
    };

    let action = match matches.subcommand() {
        Some(("clone", sub)) => {
            settings.dest_dir = sub.get_one::<String>("dest-dir").map(PathBuf::from);
            settings.workdir = sub.get_one::<String>("workdir").map(PathBuf::from);
            settings.quiesce = sub.get_flag("quiesce");
            settings.parallel = sub.get_one::<usize>("parallel").copied();
            CliAction::Clone {
                request: parse_clone_request(sub)?,
                dry_run: sub.get_flag("dry-run"),
            }
        }
        Some(("status", sub)) => CliAction::Status {
            txn: sub.get_one::<String>("txn").map(|s| parse_txn_id(s)).transpose()?,
        },
        Some(("recover", _)) => CliAction::Recover,
        Some(("gc", _)) => CliAction::Gc,
        Some(("forget", sub)) => {
            let raw = sub
                .get_one::<String>("txn")
                .ok_or_else(|| "forget requires a transaction id".to_string())?;
            CliAction::Forget {
                txn: parse_txn_id(raw)?,
            }
        }
        Some(("setup", _)) => CliAction::Setup,
        Some((other, _)) => return Err(format!("unknown command '{}'", other)),
        None => return Err("no command given".to_string()),
    };

    Ok((settings, action))
}

fn parse_clone_request(sub: &ArgMatches) -> Result<CloneRequest, String> {
    let source = sub
        .get_one::<String>("source")
        .ok_or_else(|| "clone requires a source VM".to_string())?;
    let destination = sub
        .get_one::<String>("destination")
        .ok_or_else(|| "clone requires a destination name".to_string())?;

    let mut request = CloneRequest::new(source.as_str(), destination.as_str());
    if let Some(disks) = sub.get_many::<String>("disk") {
        request = request.with_disks(disks.map(|d| d.as_str()));
    }
    if let Some(paths) = sub.get_many::<String>("dest-path") {
        for spec in paths {
            let (disk, path) = spec
                .split_once('=')
                .filter(|(disk, path)| !disk.is_empty() && !path.is_empty())
                .ok_or_else(|| format!("invalid --dest-path '{}', expected DISK=PATH", spec))?;
            request = request.with_destination_path(disk, path);
        }
    }
    Ok(request)
}

fn parse_txn_id(raw: &str) -> Result<TxnId, String> {
    TxnId::from_string(raw).ok_or_else(|| format!("invalid transaction id '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::build_cli;
    use hotclone_core::{DiskId, DiskSelection};

    fn parse(args: &[&str]) -> Result<(Settings, CliAction), String> {
        let matches = build_cli()
            .try_get_matches_from(args)
            .map_err(|e| e.to_string())?;
        matches_to_action(&matches)
    }

    #[test]
    fn test_clone_defaults_to_all_disks() {
        let (_, action) = parse(&["hotclone", "clone", "v1", "v1-clone"]).unwrap();
        match action {
            CliAction::Clone { request, dry_run } => {
                assert_eq!(request.source.as_str(), "v1");
                assert_eq!(request.destination, "v1-clone");
                assert_eq!(request.disks, DiskSelection::All);
                assert!(!dry_run);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_clone_with_disks_and_paths() {
        let (settings, action) = parse(&[
            "hotclone",
            "clone",
            "v1",
            "v1-clone",
            "--disk",
            "vda",
            "-d",
            "vdb",
            "--dest-path",
            "vda=/images/a.qcow2",
            "--dry-run",
            "-j",
            "2",
        ])
        .unwrap();
        assert_eq!(settings.parallel, Some(2));
        match action {
            CliAction::Clone { request, dry_run } => {
                assert!(dry_run);
                assert_eq!(
                    request.disks,
                    DiskSelection::Only(vec![DiskId::from("vda"), DiskId::from("vdb")])
                );
                assert_eq!(
                    request.destinations.get(&DiskId::from("vda")),
                    Some(&PathBuf::from("/images/a.qcow2"))
                );
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_bad_dest_path_rejected() {
        let err = parse(&["hotclone", "clone", "v1", "v2", "--dest-path", "vda"]).unwrap_err();
        assert!(err.contains("DISK=PATH"));
    }

    #[test]
    fn test_forget_requires_valid_txn_id() {
        let err = parse(&["hotclone", "forget", "not-a-uuid"]).unwrap_err();
        assert!(err.contains("invalid transaction id"));

        let txn = TxnId::new();
        let (_, action) = parse(&["hotclone", "forget", &txn.to_string()]).unwrap();
        assert!(matches!(action, CliAction::Forget { txn: t } if t == txn));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let (settings, _) = parse(&[
            "hotclone",
            "--state-dir",
            "/tmp/state",
            "--connect",
            "qemu:///session",
            "clone",
            "v1",
            "v2",
            "--quiesce",
            "--workdir",
            "/tmp/overlays",
        ])
        .unwrap();
        let mut config = HotcloneConfig::default();
        settings.apply(&mut config);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.hypervisor.uri.as_deref(), Some("qemu:///session"));
        assert_eq!(config.hypervisor.workdir, Some(PathBuf::from("/tmp/overlays")));
        assert!(config.hypervisor.quiesce);
    }

    #[test]
    fn test_default_config_path() {
        let settings = Settings::default();
        assert_eq!(
            settings.config_path(),
            PathBuf::from("/etc/hotclone").join(CONFIG_FILE_NAME)
        );
    }
}
