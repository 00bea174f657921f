#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `cli` is the command-line front-end of `inplace-sync`. It treats one local
//! directory as a synchronized folder and drives the in-place update engine
//! against it:
//!
//! - `plan` hashes the local file and a target file and prints the delta plan
//!   without touching anything;
//! - `apply` runs the full update, serving pulls from the target file;
//! - `recover` resolves patch markers left in the folder's scratch directory.
//!
//! # Exit codes
//!
//! | code | meaning                                  |
//! |------|------------------------------------------|
//! | 0    | success                                  |
//! | 1    | usage, configuration or I/O error        |
//! | 2    | file not eligible for an in-place update |
//! | 3    | update or recovery aborted               |
//!
//! # Examples
//!
//! ```
//! let mut stdout = Vec::new();
//! let mut stderr = Vec::new();
//! let code = cli::run(["inplace-sync", "--version"], &mut stdout, &mut stderr);
//! assert_eq!(code, 0);
//! assert!(String::from_utf8_lossy(&stdout).contains("inplace-sync"));
//! ```

mod command;
mod error;
mod execute;
mod logging;

use std::ffi::OsString;
use std::io::Write;

pub use error::CliError;
pub use logging::init_tracing;

/// Successful run.
pub const EXIT_OK: i32 = 0;
/// Invalid arguments, unreadable configuration or I/O failure.
pub const EXIT_USAGE: i32 = 1;
/// The admission heuristic or the planner declined the file.
pub const EXIT_NOT_ELIGIBLE: i32 = 2;
/// The update or recovery stopped before completing.
pub const EXIT_ABORTED: i32 = 3;

/// Folder identifier under which `--root` is registered.
pub const FOLDER_ID: &str = "local";

/// Parses `arguments` and runs the selected command, returning the exit code.
///
/// `run` never panics on user input; every failure is written to `stderr`.
pub fn run<I, S, Out, Err>(arguments: I, stdout: &mut Out, stderr: &mut Err) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
    Out: Write,
    Err: Write,
{
    let matches = match command::clap_command().try_get_matches_from(arguments) {
        Ok(matches) => matches,
        Err(error) => {
            let code = if error.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let rendered = error.render().to_string();
            let _ = if error.use_stderr() {
                write!(stderr, "{rendered}")
            } else {
                write!(stdout, "{rendered}")
            };
            return code;
        }
    };

    let invocation = match command::Invocation::from_matches(&matches) {
        Ok(invocation) => invocation,
        Err(error) => {
            let _ = writeln!(stderr, "inplace-sync: {error}");
            return EXIT_USAGE;
        }
    };
    logging::init_tracing(invocation.verbosity);

    match execute::execute(&invocation, stdout) {
        Ok(code) => code,
        Err(error) => {
            let _ = writeln!(stderr, "inplace-sync: {error}");
            error.exit_code()
        }
    }
}
