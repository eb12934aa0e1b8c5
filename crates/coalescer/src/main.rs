//! Coalescer.
//!
//! A command line front end to the request coordinator. It fetches URLs through a coordinator
//! backed by the configured value store, so that duplicate URLs are only fetched once and
//! responses are reused across invocations when the store persists them.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
