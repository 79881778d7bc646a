//! `env_logger` setup for the `cubic` binary.

use env_logger::{Env, Target};
use log::LevelFilter;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The default level: `Info`, or `Debug` when verbose. `RUST_LOG` wins
/// over both.
pub fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Where log records go: the given file when it can be opened, stderr
/// otherwise.
pub fn log_target(log_file: Option<&Path>) -> (Target, Option<PathBuf>) {
    let Some(path) = log_file else {
        return (Target::Stderr, None);
    };
    let opened = (|| -> io::Result<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new().create(true).append(true).open(path)
    })();
    match opened {
        Ok(file) => (Target::Pipe(Box::new(file)), Some(path.to_path_buf())),
        Err(e) => {
            eprintln!("Cannot write log file {}: {}; logging to stderr", path.display(), e);
            (Target::Stderr, None)
        }
    }
}

/// Install the global logger. Returns the log file actually in use.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Option<PathBuf> {
    let (target, used) = log_target(log_file);
    let env = Env::default().filter_or("RUST_LOG", default_level(verbose).as_str());
    let _ = env_logger::Builder::from_env(env)
        .target(target)
        .format_timestamp_secs()
        .try_init();
    used
}
