/*!
An OpenFlow 1.0 controller running a compiled network policy.

Switches connect to the address from the INI file's [Connection] section.
You can use mininet as a test network. To spawn a line of 3 switches:

```sh
# mn --controller remote,port=6633 --topo linear,3 --switch ovsk
```
*/

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use polyflow::apps::{self, App, MacLearner, VirtualHub};
use polyflow::conf;
use polyflow::openflow::OfBackend;
use polyflow::runtime::{Runtime, RuntimeConfig};

#[cfg(unix)]
use std::fs::File;
use std::io;
#[cfg(unix)]
use std::io::prelude::*;
use std::net;
use std::process::exit;
use std::sync::Arc;

/// Reads command line arguments and calls the corresponding functions.
fn handle_cli_args() -> io::Result<()> {
    #[cfg(unix)]
    let unix_opts =
        "-p, --pid [file] 'Daemonizes the process and writes a PID file'
        -s, --syslog      'Logs via syslog'
        ";
    #[cfg(not(unix))]
    let unix_opts = "";

    let usage = &format!(
        "{}-v...          'Repeat to set the level of verbosity'
        -c, --conf [ini]  'The INI configuration file'
        <app>             'The application to run: hub, learner or vhub'"
    , unix_opts);
    let matches = app_from_crate!().args_from_usage(usage).get_matches();

    let log_lvl = match matches.occurrences_of("v") {
        0 => log::Level::Error,
        1 => log::Level::Warn,
        2 => log::Level::Info,
        3 => log::Level::Debug,
        _ => log::Level::Trace,
    };

    let logged = if matches.is_present("syslog") {
        init_syslog(log_lvl)
    }
    else {
        simple_logger::init_with_level(log_lvl).map_err(|e| e.to_string())
    };
    if let Err(e) = logged {
        return Err(io::Error::new(io::ErrorKind::Other, format!("error on logging initialization: {}", e)));
    }

    let app: App = matches
        .value_of("app")
        .unwrap_or_default()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let (conn, config) = match matches.value_of("conf") {
        Some(path) => conf::parse_file(path)?,
        None => (conf::OfConnection::default(), RuntimeConfig::default()),
    };

    #[cfg(unix)] {
        if matches.is_present("pid") {
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                return Err(io::Error::last_os_error());
            }
            else if pid > 0 {
                // exit the parent process
                exit(0);
            }
            if let Some(pid_path) = matches.value_of("pid") {
                let mut file = File::create(pid_path)?;
                write!(file, "{}", std::process::id())?;
            }
        }
    }

    let listen_socket = net::TcpListener::bind(conn.socket)?;
    info!("Listening on {}", listen_socket.local_addr()?);

    let backend = Arc::new(OfBackend::new());
    let mut runtime = match app {
        App::Hub => Runtime::new(apps::hub(), Arc::clone(&backend), config),
        App::Learner => {
            let learner = MacLearner::new();
            let mut runtime = Runtime::new(learner.policy(), Arc::clone(&backend), config);
            runtime.on_packet(learner.handler());
            runtime.on_topology(learner.topology_hook());
            runtime
        }
        App::VirtualHub => {
            let vhub = VirtualHub::new();
            let mut runtime = Runtime::new(vhub.policy(), Arc::clone(&backend), config);
            runtime.on_topology(move |topology| vhub.update(topology));
            runtime
        }
    };
    info!("Running the {} application", app);

    OfBackend::listen(backend, listen_socket, conn, runtime.sender())?;
    runtime.run();
    Ok(())
}

#[cfg(unix)]
fn init_syslog(level: log::Level) -> Result<(), String> {
    syslog::init(syslog::Facility::LOG_USER, level.to_level_filter(), Some(crate_name!()))
        .map_err(|e| e.to_string())?;
    log_panics::init();
    Ok(())
}

#[cfg(not(unix))]
fn init_syslog(_level: log::Level) -> Result<(), String> {
    Err("syslog is only available on unix".to_owned())
}

/// Entry function with top level error handling.
fn main() {
    if let Err(e) = handle_cli_args() {
        error!("{}", e);
        eprintln!("{}", e);
        exit(1);
    }
}
