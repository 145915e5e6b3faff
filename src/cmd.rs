use getopts::{HasArg, Matches, Occur, Options};
use std::process::exit;

use burrow::configfile::ConfigFile;

fn options() -> Options {
    let mut opts = Options::new();
    opts.opt(
        "",
        "list-devices",
        "lists all valid devices and exits",
        "",
        HasArg::No,
        Occur::Optional,
    );
    opts.opt(
        "c",
        "config",
        "path to a JSON configuration file, replaces every other option",
        "config",
        HasArg::Yes,
        Occur::Optional,
    );
    opts.opt(
        "",
        "listen-devices",
        "comma separated devices to capture on, all by default",
        "devices",
        HasArg::Yes,
        Occur::Optional,
    );
    opts.opt(
        "",
        "upstream-device",
        "device the tunnel leaves on, default route by default",
        "device",
        HasArg::Yes,
        Occur::Optional,
    );
    opts.opt("", "method", "encryption method", "method", HasArg::Yes, Occur::Optional);
    opts.opt("", "password", "encryption password", "password", HasArg::Yes, Occur::Optional);
    opts.opt("v", "verbose", "prints debug messages", "", HasArg::No, Occur::Optional);
    opts.opt(
        "",
        "upstream-port",
        "local port of the tunnel, random by default",
        "port",
        HasArg::Yes,
        Occur::Optional,
    );
    opts.opt(
        "f",
        "filters",
        "comma separated filters: ip, :port or ip:port",
        "filters",
        HasArg::Yes,
        Occur::Optional,
    );
    opts.opt(
        "s",
        "server",
        "address of the server, ip:port",
        "server",
        HasArg::Yes,
        Occur::Optional,
    );
    opts.opt("h", "help", "prints this help message", "", HasArg::No, Occur::Optional);
    opts
}

pub fn parse_args(args: &[String], progname: &str) -> Result<Matches, String> {
    let opts = options();
    let matches = match opts.parse(args.iter().skip(1)) {
        Ok(s) => s,
        Err(m) => {
            return Err(format!("Error while parsing input arguments: {}", m));
        }
    };
    if matches.opt_present("h") {
        print_usage(progname, &opts);
        exit(0);
    }
    if let Some(free) = matches.free.first() {
        return Err(format!("Unexpected argument \"{}\"", free));
    }
    Ok(matches)
}

fn print_usage(progname: &str, opts: &Options) {
    let brief = format!("Usage: {} [OPTIONS]", progname);
    println!("{}", opts.usage(&brief));
}

/// Splits a comma separated option value, dropping empty items.
pub fn split_arg(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Builds the configuration from command line options alone.
pub fn config_from_matches(matches: &Matches) -> Result<ConfigFile, String> {
    let mut config = ConfigFile::default();
    if let Some(devices) = matches.opt_str("listen-devices") {
        config.listen_devices = split_arg(&devices);
    }
    if let Some(device) = matches.opt_str("upstream-device") {
        config.upstream_device = device.trim().to_string();
    }
    if let Some(method) = matches.opt_str("method") {
        config.method = method;
    }
    if let Some(password) = matches.opt_str("password") {
        config.password = password;
    }
    config.verbose = matches.opt_present("v");
    if let Some(port) = matches.opt_str("upstream-port") {
        config.upstream_port = port
            .trim()
            .parse()
            .map_err(|_| format!("invalid upstream port \"{}\"", port))?;
    }
    if let Some(filters) = matches.opt_str("f") {
        config.filters = split_arg(&filters);
    }
    if let Some(server) = matches.opt_str("s") {
        config.server = server.trim().to_string();
    }
    Ok(config)
}
