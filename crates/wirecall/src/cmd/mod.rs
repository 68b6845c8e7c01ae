use std::time::Duration;

use clap::{Args, Subcommand};
use wirecall_transport::Endpoint;

use crate::exit::{CliError, CliResult, USAGE};

pub mod ping;
pub mod serve;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the built-in echo operation on an endpoint.
    Serve(ServeArgs),
    /// Round-trip echo requests against a running server.
    Ping(PingArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Ping(args) => ping::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind: HOST:PORT or unix:PATH.
    pub endpoint: String,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Endpoint to connect to: HOST:PORT or unix:PATH.
    pub endpoint: String,
    /// Payload to echo.
    #[arg(long, default_value = "ping")]
    pub data: String,
    /// Number of round trips.
    #[arg(long, default_value = "1")]
    pub count: u64,
    /// Per-call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

pub fn parse_endpoint(input: &str) -> CliResult<Endpoint> {
    input
        .parse()
        .map_err(|err| CliError::new(USAGE, format!("invalid endpoint {input:?}: {err}")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}
