//! CLI entry point. Parses arguments, wires up logging, the fault registry,
//! the FUSE mount and the HTTP control API, then blocks until a shutdown is
//! requested (SIGINT, or the mount being torn down from outside).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, Arg, ArgAction, Command};
use fuser::MountOption;
use log::LevelFilter;

use charybdisfs::configuration::Configuration;
use charybdisfs::control_api;
use charybdisfs::error::CharybdisResult;
use charybdisfs::fault::{Fault, SysCall};
use charybdisfs::operations::CharybdisOperations;
use uuid::Uuid;

/// Set from the SIGINT handler; polled by the main loop so shutdown always
/// runs on the main thread rather than inside the signal handler itself.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    // SAFETY: `request_shutdown` only touches an `AtomicBool`, which is
    // async-signal-safe; no allocation or locking happens in the handler.
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
    }
}

struct Args {
    source: PathBuf,
    target: PathBuf,
    debug: bool,
    rest_api: bool,
    rest_api_port: u16,
    mount: bool,
    static_enospc: bool,
    static_enospc_probability: f64,
    log_level: LevelFilter,
}

fn build_cli() -> Command {
    Command::new("charybdisfs")
        .version(crate_version!())
        .about("A FUSE passthrough filesystem that injects latency and errno faults")
        .arg(Arg::new("source").required(true).value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("target").required(true).value_parser(clap::value_parser!(PathBuf)))
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .overrides_with("no-debug"),
        )
        .arg(
            Arg::new("no-debug")
                .long("no-debug")
                .action(ArgAction::SetTrue)
                .overrides_with("debug"),
        )
        .arg(
            Arg::new("rest-api")
                .long("rest-api")
                .action(ArgAction::SetTrue)
                .overrides_with("no-rest-api"),
        )
        .arg(
            Arg::new("no-rest-api")
                .long("no-rest-api")
                .action(ArgAction::SetTrue)
                .overrides_with("rest-api"),
        )
        .arg(
            Arg::new("rest-api-port")
                .long("rest-api-port")
                .value_parser(clap::value_parser!(u16))
                .default_value("8080"),
        )
        .arg(
            Arg::new("mount")
                .long("mount")
                .action(ArgAction::SetTrue)
                .overrides_with("no-mount"),
        )
        .arg(
            Arg::new("no-mount")
                .long("no-mount")
                .action(ArgAction::SetTrue)
                .overrides_with("mount"),
        )
        .arg(
            Arg::new("static-enospc")
                .long("static-enospc")
                .action(ArgAction::SetTrue)
                .overrides_with("no-static-enospc"),
        )
        .arg(
            Arg::new("no-static-enospc")
                .long("no-static-enospc")
                .action(ArgAction::SetTrue)
                .overrides_with("static-enospc"),
        )
        .arg(
            Arg::new("static-enospc-probability")
                .long("static-enospc-probability")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.1"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
}

fn parse_args() -> Result<Args, String> {
    let matches = build_cli().get_matches();

    let debug = matches.get_flag("debug");
    let rest_api = !matches.get_flag("no-rest-api");
    let mount = !matches.get_flag("no-mount");
    let static_enospc = matches.get_flag("static-enospc");

    if !rest_api && !mount {
        return Err("--no-rest-api and --no-mount cannot both be given: charybdisfs would have nothing to do".to_string());
    }

    let log_level = match matches.get_count("verbose") {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    Ok(Args {
        source: matches.get_one::<PathBuf>("source").expect("required").clone(),
        target: matches.get_one::<PathBuf>("target").expect("required").clone(),
        debug,
        rest_api,
        rest_api_port: *matches.get_one::<u16>("rest-api-port").expect("has default"),
        mount,
        static_enospc,
        static_enospc_probability: *matches
            .get_one::<f64>("static-enospc-probability")
            .expect("has default"),
        log_level,
    })
}

fn require_directory(path: &Path, label: &str) -> Result<(), String> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(format!("{label} {path:?} exists but is not a directory")),
        Err(e) => Err(format!("{label} {path:?} is not accessible: {e}")),
    }
}

fn install_static_enospc(config: &Configuration, probability: f64) -> CharybdisResult<()> {
    let clamped = (probability * 100.0).round().clamp(0.0, 100.0) as u8;
    let fault = Fault::error(SysCall::All, clamped, libc::ENOSPC);
    config
        .add(Uuid::new_v4().to_string(), fault)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    require_directory(&args.source, "source").map_err(anyhow::Error::msg)?;
    if args.mount {
        require_directory(&args.target, "target").map_err(anyhow::Error::msg)?;
    }

    let config = Arc::new(Configuration::new());
    if args.static_enospc {
        install_static_enospc(&config, args.static_enospc_probability)?;
        log::info!(
            "static ENOSPC fault installed at {:.1}% on every syscall",
            args.static_enospc_probability * 100.0
        );
    }

    let mut mount_options = vec![MountOption::FSName("charybdisfs".to_string())];
    if args.debug {
        mount_options.push(MountOption::CUSTOM("debug".to_string()));
    }

    let session = if args.mount {
        log::info!("mounting {:?} on {:?}", args.source, args.target);
        let ops = CharybdisOperations::new(args.source.clone(), config.clone());
        Some(fuser::spawn_mount2(ops, &args.target, &mount_options)?)
    } else {
        None
    };

    // Keep the JoinHandle alive only long enough to detect a startup bind
    // failure; once the thread is running it's intentionally never joined
    // (see control_api::spawn's own doc comment).
    let control_thread = if args.rest_api {
        log::info!("control API listening on port {}", args.rest_api_port);
        Some(control_api::spawn(config.clone(), args.rest_api_port)?)
    } else {
        None
    };

    install_sigint_handler();
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            log::info!("shutdown requested, unmounting");
            break;
        }
        if let Some(handle) = &control_thread {
            if handle.is_finished() {
                log::warn!("control API thread exited unexpectedly");
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    drop(session);
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("charybdisfs: {e}");
            return ExitCode::from(2);
        }
    };

    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(args.log_level)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
