use std::env;
use std::net::{SocketAddrV4, UdpSocket};
use std::process::exit;
use std::thread;

use getopts::Matches;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use burrow::configfile::{config_sanity_check, read_config_file, Settings};
use burrow::crypto::CryptoCodec;
use burrow::device::{list_all_devices, DeviceBinding};
use burrow::logging::init_logging;
use burrow::relay::{Links, RelayEngine, Shutdown};
use burrow::Error;

mod cmd;

use crate::cmd::{config_from_matches, parse_args};

fn handle_signals(shutdown: Shutdown) -> Result<(), Error> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("signal {} received, closing down", sig);
            shutdown.trigger();
        }
    });
    Ok(())
}

fn list_devices() {
    info!("Available devices:");
    for device in list_all_devices() {
        info!("    {}", device);
    }
}

fn print_banner(settings: &Settings) {
    if settings.filters.len() == 1 {
        if let Some(filter) = settings.filters.iter().next() {
            info!(
                "Proxy from {} through :{} to {}",
                filter, settings.upstream_port, settings.server
            );
        }
        return;
    }
    info!("Proxy:");
    for filter in settings.filters.iter() {
        info!("    {}", filter);
    }
    info!("Through :{} to {}", settings.upstream_port, settings.server);
}

fn run_command(settings: Settings) -> Result<(), Error> {
    let crypto = CryptoCodec::new(&settings.method, &settings.password)?;
    info!("Encrypt with method {}", crypto.method());
    print_banner(&settings);

    let binding = DeviceBinding::resolve(&settings.listen_devices, &settings.upstream_device)?;
    for device in &binding.listen {
        info!("Listen on {}", device);
    }
    info!("Route upstream from {} to {}", binding.upstream, binding.gateway);

    let links = Links::open(&binding, settings.read_timeout)?;

    // holds the port so the host stack neither claims nor refuses it
    let reserved = SocketAddrV4::new(binding.upstream_addr(), settings.upstream_port);
    let _reservation = match UdpSocket::bind(reserved) {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!("reserve upstream port {}: {}", reserved, e);
            None
        }
    };

    let shutdown = Shutdown::new();
    handle_signals(shutdown.clone())?;

    let engine = RelayEngine::new(settings.relay_config(), crypto);
    engine.open(binding, links, shutdown)?;
    engine.wait();
    engine.close();

    match engine.failure() {
        Some(reason) => Err(Error::Relay(reason)),
        None => Ok(()),
    }
}

fn perform_command(opts: Matches) -> Result<(), Error> {
    let config = match opts.opt_str("c") {
        Some(path) => read_config_file(&path)?,
        None => config_from_matches(&opts).map_err(Error::config)?,
    };
    init_logging(config.verbose);

    let settings = config_sanity_check(config)?;
    run_command(settings)
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "burrow".into());

    let opts = match parse_args(&args, &program) {
        Ok(s) => s,
        Err(m) => {
            eprintln!("{}", m);
            exit(1);
        }
    };

    if opts.opt_present("list-devices") {
        init_logging(opts.opt_present("v"));
        list_devices();
        return;
    }

    if let Err(e) = perform_command(opts) {
        // logging may not be up yet when the config file itself is broken
        init_logging(false);
        error!("{}", e);
        exit(1);
    }
}
