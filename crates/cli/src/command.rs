use std::fs;
use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use inplace::InPlaceConfig;

use crate::error::CliError;

pub(crate) fn clap_command() -> Command {
    Command::new("inplace-sync")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Plan, apply and recover in-place block updates of local files")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity (repeat for more detail)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("no-fsync")
                .long("no-fsync")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Skip fsync of scratch, marker and destination writes"),
        )
        .subcommand(update_args(
            Command::new("plan").about("Print the delta plan for updating FILE to TARGET"),
        ))
        .subcommand(update_args(
            Command::new("apply").about("Update FILE in place so it matches TARGET"),
        ))
        .subcommand(
            Command::new("recover")
                .about("Resolve interrupted patches under ROOT")
                .arg(root_arg()),
        )
}

fn root_arg() -> Arg {
    Arg::new("root")
        .long("root")
        .value_name("DIR")
        .value_parser(value_parser!(PathBuf))
        .required(true)
        .help("Folder root directory")
}

fn update_args(command: Command) -> Command {
    command
        .arg(root_arg())
        .arg(
            Arg::new("file")
                .long("file")
                .value_name("REL")
                .required(true)
                .help("File to update, relative to the root"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .required(true)
                .help("File holding the target content"),
        )
        .arg(
            Arg::new("block-size")
                .long("block-size")
                .value_name("BYTES")
                .value_parser(value_parser!(u32).range(1..))
                .help("Block size used to hash both versions"),
        )
        .arg(
            Arg::new("also")
                .long("also")
                .value_name("REL")
                .action(ArgAction::Append)
                .help("Other file under the root that may provide blocks"),
        )
}

/// Parsed command line.
#[derive(Debug)]
pub(crate) struct Invocation {
    pub(crate) verbosity: u8,
    pub(crate) config: InPlaceConfig,
    pub(crate) action: Action,
}

#[derive(Debug)]
pub(crate) enum Action {
    Plan(UpdateArgs),
    Apply(UpdateArgs),
    Recover { root: PathBuf },
}

#[derive(Debug)]
pub(crate) struct UpdateArgs {
    pub(crate) root: PathBuf,
    pub(crate) file: String,
    pub(crate) target: PathBuf,
    pub(crate) also: Vec<String>,
}

impl Invocation {
    pub(crate) fn from_matches(matches: &ArgMatches) -> Result<Self, CliError> {
        let mut config = match matches.get_one::<PathBuf>("config") {
            Some(path) => load_config(path)?,
            None => InPlaceConfig::default(),
        };
        if matches.get_flag("no-fsync") {
            config = config.with_fsync(false);
        }

        let action = match matches.subcommand() {
            Some(("plan", sub)) => Action::Plan(update_from(sub, &mut config)),
            Some(("apply", sub)) => Action::Apply(update_from(sub, &mut config)),
            Some(("recover", sub)) => Action::Recover {
                root: required_path(sub, "root"),
            },
            _ => return Err(CliError::Usage("no command given".to_owned())),
        };

        Ok(Self {
            verbosity: matches.get_count("verbose"),
            config,
            action,
        })
    }
}

fn update_from(matches: &ArgMatches, config: &mut InPlaceConfig) -> UpdateArgs {
    if let Some(&block_size) = matches.get_one::<u32>("block-size") {
        *config = config.clone().with_block_size(block_size);
    }
    UpdateArgs {
        root: required_path(matches, "root"),
        file: matches.get_one::<String>("file").cloned().unwrap_or_default(),
        target: required_path(matches, "target"),
        also: matches
            .get_many::<String>("also")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
    }
}

// clap enforces `required(true)`, so the fallback is never observed.
fn required_path(matches: &ArgMatches, id: &str) -> PathBuf {
    matches.get_one::<PathBuf>(id).cloned().unwrap_or_default()
}

fn load_config(path: &Path) -> Result<InPlaceConfig, CliError> {
    let text = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    InPlaceConfig::from_json(&text).map_err(|source| CliError::Config {
        path: path.to_path_buf(),
        source,
    })
}
