use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use crate::logger::AppLogger;

static LOGGER: AppLogger = AppLogger;

#[derive(Debug)]
pub struct App {
    pub args: ArgMatches,
}

impl App {
    pub fn new() -> Self {
        let matches = Command::new("syshook")
            .version(crate_version!())
            .about("syshook: programmable hooks for the syscalls of traced processes")
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .help("Increases verbosity of program output (can be specified multiple times)")
                    .action(ArgAction::Count),
            )
            .arg(
                Arg::new("config_file")
                    .short('f')
                    .long("config-file")
                    .value_name("FILENAME")
                    .help("JSON file describing the hooks to install"),
            )
            .arg(
                Arg::new("pid")
                    .short('p')
                    .long("pid")
                    .value_name("PID")
                    .help("Attach to a running process instead of spawning one (can be repeated)")
                    .value_parser(value_parser!(i32))
                    .action(ArgAction::Append),
            )
            .arg(
                Arg::new("only")
                    .short('o')
                    .long("only")
                    .value_name("ARGV0")
                    .help("Only run hooks for processes whose argv[0] is ARGV0"),
            )
            .arg(
                Arg::new("tracee_cmd")
                    .help("Full tracee command and arguments (e.g. \"ls -l\")")
                    .num_args(1..)
                    .trailing_var_arg(true)
                    .allow_hyphen_values(true)
                    .required_unless_present("pid"),
            )
            .get_matches();

        // Set up logger
        let level_filter = match matches.get_count("verbose") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        if log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(level_filter))
            .is_err()
        {
            eprintln!("ERROR: unable to set application logger instance");
        }

        Self { args: matches }
    }

    pub fn tracee_cmd(&self) -> Option<Vec<String>> {
        self.args
            .get_many::<String>("tracee_cmd")
            .map(|values| values.cloned().collect())
    }

    pub fn pids(&self) -> Vec<i32> {
        self.args
            .get_many::<i32>("pid")
            .map(|values| values.copied().collect())
            .unwrap_or_default()
    }
}
