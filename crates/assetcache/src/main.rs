//! Asset cache.
//!
//! A command line front end for the tiered asset cache. It fetches assets over HTTP through the
//! memory and disk tiers, downloads batches under a download strategy, and maintains the disk
//! cache configured in a YAML file.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            assetcache_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
