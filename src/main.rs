use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use payoutd::{Config, Daemon};

/// Bridges the Redis JSON API to the SSP cash hardware.
#[derive(Parser, Debug)]
#[command(name = "payoutd", disable_help_flag = true)]
struct Args {
    /// Bus hostname
    #[arg(short = 'h', long = "host", value_name = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Bus port
    #[arg(short = 'p', long = "port", value_name = "PORT", default_value_t = 6379)]
    port: u16,

    /// Serial device the cash hardware is attached to
    #[arg(short = 'd', long = "device", value_name = "DEVICE", default_value = "/dev/ttyACM0")]
    device: String,

    /// Permit coin acceptance during hopper setup
    #[arg(short = 'c', long = "accept-coins")]
    accept_coins: bool,

    /// Also write diagnostic logging to standard error
    #[arg(short = 'e', long = "verbose")]
    verbose: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp => err.exit(),
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .and(signal_hook::flag::register(
            signal_hook::consts::SIGINT,
            Arc::clone(&shutdown),
        ))
    {
        log::error!("could not register signal handlers: {err}");
        process::exit(1);
    }

    let config = Config {
        redis_host: args.host,
        redis_port: args.port,
        serial_device: args.device,
        accept_coins: args.accept_coins,
    };

    let mut daemon = match Daemon::new(&config, Arc::clone(&shutdown)) {
        Ok(daemon) => daemon,
        Err(err) => {
            log::error!("fatal error occured during startup: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = daemon.run() {
        log::error!("fatal error occured: {err}");
        process::exit(1);
    }

    log::info!("exiting now");
}
