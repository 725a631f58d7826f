//! Clap command tree definition.

use clap::{Arg, ArgAction, Command};

/// Build the complete CLI command tree.
pub fn build_cli() -> Command {
    Command::new("hotclone")
        .about("Clone running virtual machines without stopping them")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Config file (default: /etc/hotclone/hotclone.toml)")
                .global(true),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .help("Transaction log directory, overrides the config file")
                .global(true),
        )
        .arg(
            Arg::new("connect")
                .long("connect")
                .help("Libvirt connection URI")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (-v info, -vv debug)")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("JSON output mode")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(build_clone())
        .subcommand(build_status())
        .subcommand(build_recover())
        .subcommand(build_gc())
        .subcommand(build_forget())
        .subcommand(build_setup())
}

fn build_clone() -> Command {
    Command::new("clone")
        .about("Hot-clone a VM's disks into a new VM")
        .arg(Arg::new("source").required(true).help("Source VM"))
        .arg(
            Arg::new("destination")
                .required(true)
                .help("Name of the new VM"),
        )
        .arg(
            Arg::new("disk")
                .long("disk")
                .short('d')
                .action(ArgAction::Append)
                .help("Disk to clone (repeatable, default: every eligible disk)"),
        )
        .arg(
            Arg::new("dest-dir")
                .long("dest-dir")
                .help("Directory for destination images"),
        )
        .arg(
            Arg::new("dest-path")
                .long("dest-path")
                .action(ArgAction::Append)
                .value_name("DISK=PATH")
                .help("Explicit destination image for one disk (repeatable)"),
        )
        .arg(
            Arg::new("workdir")
                .long("workdir")
                .help("Directory for temporary snapshot overlays"),
        )
        .arg(
            Arg::new("quiesce")
                .long("quiesce")
                .help("Quiesce guest filesystems while snapshotting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("parallel")
                .long("parallel")
                .short('j')
                .value_parser(clap::value_parser!(usize))
                .help("Disks copied concurrently"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate and print the plan without cloning")
                .action(ArgAction::SetTrue),
        )
}

fn build_status() -> Command {
    Command::new("status")
        .about("Show logged transactions")
        .arg(Arg::new("txn").help("Transaction id (default: all)"))
}

fn build_recover() -> Command {
    Command::new("recover").about("Finish or roll back interrupted transactions")
}

fn build_gc() -> Command {
    Command::new("gc").about("Delete finished records older than the retention window")
}

fn build_forget() -> Command {
    Command::new("forget")
        .about("Delete a settled record after manual resolution")
        .arg(Arg::new("txn").required(true).help("Transaction id"))
}

fn build_setup() -> Command {
    Command::new("setup").about("Write the default config file if it is missing")
}
