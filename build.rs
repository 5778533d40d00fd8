// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn packages_arg(required: bool, help: &'static str) -> Arg {
    Arg::new("packages")
        .num_args(1..)
        .required(required)
        .help(help)
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .global(true)
        .action(ArgAction::SetTrue)
        .help(help)
}

fn build_cli() -> Command {
    Command::new("tpkg")
        .version(env!("CARGO_PKG_VERSION"))
        .author("tpkg Contributors")
        .about("Host package manager for self-contained .tpkg archives")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Configuration file (default: /etc/tpkg.conf when present)"),
        )
        .arg(
            Arg::new("base")
                .long("base")
                .value_name("DIR")
                .global(true)
                .help("Installation base for relocatable files"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("DIR")
                .global(true)
                .help("Prefix for absolute package paths"),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("SOURCE")
                .global(true)
                .action(ArgAction::Append)
                .help("Package source: directory, .tpkg file or http(s) URL (repeatable)"),
        )
        .arg(flag("force", "Continue past failed pre-scripts, file conflicts and broken dependents"))
        .arg(flag("force-replace", "Remove installed packages that conflict with the requested ones"))
        .arg(flag("force-unlock", "Take the lock even if another process holds it"))
        .arg(
            Arg::new("passphrase")
                .long("passphrase")
                .value_name("PASSPHRASE")
                .global(true)
                .help("Passphrase for encrypted package files"),
        )
        .arg(flag("no-prompt", "Never ask for confirmation"))
        .arg(flag("debug", "Debug logging"))
        .subcommand(
            Command::new("install")
                .about("Install packages and their dependencies")
                .arg(packages_arg(
                    true,
                    "name, name=version, name=version=package_version or a .tpkg file",
                )),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Upgrade packages (all installed packages if none are given)")
                .arg(packages_arg(false, "Packages to upgrade"))
                .arg(
                    Arg::new("downgrade")
                        .long("downgrade")
                        .action(ArgAction::SetTrue)
                        .help("Allow versions older than the installed one"),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove packages (all installed packages if none are given)")
                .arg(packages_arg(false, "Packages to remove")),
        )
        .subcommand(
            Command::new("query")
                .about("List installed packages, or available ones")
                .arg(Arg::new("names").num_args(1..).help("Only packages with these names"))
                .arg(
                    Arg::new("available")
                        .short('a')
                        .long("available")
                        .action(ArgAction::SetTrue)
                        .help("Query the configured sources instead of installed packages"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print metadata as JSON"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify the checksums of package archives")
                .arg(Arg::new("files").num_args(1..).required(true).help("Package files")),
        )
        .subcommand(
            Command::new("verify-installed")
                .about("Compare installed files against their recorded checksums")
                .arg(
                    Arg::new("names")
                        .num_args(1..)
                        .help("Package names (all installed packages if none are given)"),
                ),
        )
        .subcommand(
            Command::new("files")
                .about("List the contents of a package file")
                .arg(Arg::new("package").required(true).help("Package file")),
        )
        .subcommand(
            Command::new("owner")
                .about("Show which installed packages own a path")
                .arg(Arg::new("path").required(true).help("Installed path")),
        )
        .subcommand(
            Command::new("make")
                .about("Build a package from a source directory")
                .arg(Arg::new("source").required(true).help("Directory holding tpkg.yml"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value(".")
                        .help("Output directory"),
                ),
        )
        .subcommand(
            Command::new("index")
                .about("Write metadata.yml for a directory of packages")
                .arg(Arg::new("dir").required(true).help("Package directory")),
        )
        .subcommand(
            Command::new("history")
                .about("Show operation history")
                .arg(
                    Arg::new("limit")
                        .short('n')
                        .long("limit")
                        .default_value("20")
                        .help("Number of operations to show"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("tpkg.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
