//! netbridge daemon. Batch mode builds bridges from an INI file and runs
//! until a signal arrives (SIGHUP reloads); hypervisor mode exposes the
//! TCP control plane and waits for orchestrators instead.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use netbridge::hypervisor::{Server, DEFAULT_TCP_PORT};
use netbridge::registry::Registry;
use netbridge::{config, logger, NAME, VERSION};

const DEFAULT_CONFIG_FILE: &str = "netbridge.ini";

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(signal: libc::c_int) {
    match signal {
        libc::SIGINT | libc::SIGTERM => SHUTDOWN.store(true, Ordering::SeqCst),
        libc::SIGHUP => RELOAD.store(true, Ordering::SeqCst),
        _ => {}
    }
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    // Safety: handle_signal only touches atomics, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[derive(Debug)]
struct Settings {
    config_file: PathBuf,
    debug_level: u8,
    hypervisor: Option<(Option<String>, u16)>,
}

enum ParsedArgs {
    Run(Settings),
    ShowHelp,
    ShowVersion,
    ListDevices,
}

fn parse_args() -> anyhow::Result<ParsedArgs> {
    let mut settings = Settings {
        config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
        debug_level: 0,
        hypervisor: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => return Ok(ParsedArgs::ShowHelp),
            "-v" => return Ok(ParsedArgs::ShowVersion),
            "-e" => return Ok(ParsedArgs::ListDevices),
            "-f" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("-f requires a file path"))?;
                settings.config_file = PathBuf::from(value);
            }
            "-d" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("-d requires a level"))?;
                settings.debug_level = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid debug level"))?;
            }
            "-H" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("-H requires [<ip_address>:]<tcp_port>"))?;
                settings.hypervisor = Some(parse_hypervisor_endpoint(&value)?);
            }
            other => {
                anyhow::bail!("unknown argument '{other}'. Run with -h for usage.");
            }
        }
    }
    Ok(ParsedArgs::Run(settings))
}

/// `[<ip_address>:]<tcp_port>`; the address part keeps any colons of its
/// own so IPv6 literals work.
fn parse_hypervisor_endpoint(value: &str) -> anyhow::Result<(Option<String>, u16)> {
    match value.rsplit_once(':') {
        Some((address, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid hypervisor TCP port '{port}'"))?;
            Ok((Some(address.to_owned()), port))
        }
        None => {
            let port = value
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid hypervisor TCP port '{value}'"))?;
            Ok((None, port))
        }
    }
}

fn print_usage() {
    println!(
        "Usage: {NAME} [OPTION]\n\
         \n\
         Options:\n\
         \x20 -h                           : Print this message and exit\n\
         \x20 -f <file>                    : Specify a INI configuration file (default: {DEFAULT_CONFIG_FILE})\n\
         \x20 -H [<ip_address>:]<tcp_port> : Run in hypervisor mode\n\
         \x20 -e                           : Display all available network devices and exit\n\
         \x20 -d <level>                   : Debug level\n\
         \x20 -v                           : Print version and exit"
    );
}

fn list_network_devices() -> anyhow::Result<()> {
    println!("Network device list:\n");
    let devices = pcap::Device::list()?;
    for device in devices {
        println!(
            "  {} => {}",
            device.name,
            device.desc.as_deref().unwrap_or("no description")
        );
    }
    println!();
    Ok(())
}

fn run_hypervisor(bind_addr: Option<String>, port: u16) -> anyhow::Result<()> {
    let registry = Registry::shared();
    let server = Server::bind(registry, bind_addr.as_deref(), port)?;
    logger::info(format!(
        "hypervisor mode on port {port} (bind {})",
        bind_addr.as_deref().unwrap_or("any")
    ));
    server.run(|| SHUTDOWN.load(Ordering::SeqCst));
    Ok(())
}

fn run_batch(settings: &Settings) -> anyhow::Result<()> {
    let registry = Registry::shared();
    loop {
        let configs = config::load(&settings.config_file)?;
        {
            let mut registry = registry.lock();
            let created = config::instantiate(&mut registry, &configs);
            if created == 0 {
                anyhow::bail!(
                    "no usable bridge in {}",
                    settings.config_file.display()
                );
            }
            let names: Vec<String> = registry
                .bridges()
                .map(|bridge| bridge.name().to_owned())
                .collect();
            for name in names {
                if let Some(bridge) = registry.bridge(&name) {
                    if let Err(err) = bridge.start() {
                        logger::error(format!("cannot start bridge '{name}': {err}"));
                    }
                }
            }
        }

        // Sleep until a signal flag flips.
        while !SHUTDOWN.load(Ordering::SeqCst) && !RELOAD.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }

        registry.lock().reset();
        if SHUTDOWN.load(Ordering::SeqCst) {
            return Ok(());
        }
        RELOAD.store(false, Ordering::SeqCst);
        logger::info("reloading configuration".to_owned());
    }
}

fn main() -> anyhow::Result<()> {
    let settings = match parse_args()? {
        ParsedArgs::ShowHelp => {
            print_usage();
            return Ok(());
        }
        ParsedArgs::ShowVersion => {
            println!("{NAME} version {VERSION}");
            return Ok(());
        }
        ParsedArgs::ListDevices => return list_network_devices(),
        ParsedArgs::Run(settings) => settings,
    };

    logger::set_debug_level(settings.debug_level);
    install_signal_handlers();
    println!("{NAME} version {VERSION} running with {}", pcap::lib_version());

    match &settings.hypervisor {
        Some((bind_addr, port)) => {
            let port = if *port == 0 { DEFAULT_TCP_PORT } else { *port };
            run_hypervisor(bind_addr.clone(), port)
        }
        None => run_batch(&settings),
    }
}
