use ctrlc::Error as CtrlcError;

use std::process;
use std::thread;

use summit_vpn_lib::event::StateEvent;
use summit_vpn_lib::platform::{self, SystemExec};
use summit_vpn_lib::routing::RouteConfig;
use summit_vpn_lib::service::Service;
use summit_vpn_lib::logging;
use summit_vpn_lib::tunnel::{self, ErrorCategory};

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn ctrlc_channel() -> Result<crossbeam_channel::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = crossbeam_channel::bounded(2);
    match ctrlc::set_handler(move || match sender.send(()) {
        Ok(_) => (),
        Err(e) => {
            tracing::error!(error = ?e, "sending interrupt signal");
        }
    }) {
        Ok(_) => Ok(receiver),
        Err(CtrlcError::NoSuchSignal(signal_type)) => {
            tracing::error!(?signal_type, "no such signal");
            Err(exitcode::OSERR)
        }
        Err(CtrlcError::MultipleHandlers) => {
            tracing::error!("multiple handlers");
            Err(exitcode::UNAVAILABLE)
        }
        Err(CtrlcError::System(e)) => {
            tracing::error!(error = ?e, "system error");
            Err(exitcode::IOERR)
        }
    }
}

fn ensure_privileged() -> Result<(), exitcode::ExitCode> {
    // route, interface and resolver mutations all require root
    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("this service manipulates routes and resolvers and must run as root");
        return Err(exitcode::NOPERM);
    }
    Ok(())
}

fn print_event(event: &StateEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!(error = ?e, "error serializing state event"),
    }
}

fn run_connect(args: cli::ConnectArgs) -> Result<(), exitcode::ExitCode> {
    let params = args.connection_parameters().map_err(|err| {
        tracing::error!(error = %err, "invalid connection parameters");
        exitcode::USAGE
    })?;

    platform::check_tooling().map_err(|err| {
        tracing::error!(error = %err, "WireGuard tooling unavailable");
        exitcode::UNAVAILABLE
    })?;

    let ctrlc_receiver = ctrlc_channel()?;
    let service = std::sync::Arc::new(Service::new(
        SystemExec,
        RouteConfig::default(),
        args.handshake_timeout,
    ));

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let (done_tx, done_rx) = crossbeam_channel::bounded::<Result<(), tunnel::Error>>(1);
    {
        let service = service.clone();
        thread::spawn(move || {
            let res = service.connect(&params, &events_tx);
            let _ = done_tx.send(res);
        });
    }

    let mut interrupted = false;
    loop {
        crossbeam_channel::select! {
            recv(ctrlc_receiver) -> _ => {
                if interrupted {
                    tracing::info!("force shutdown immediately");
                    return Ok(());
                }
                interrupted = true;
                tracing::info!("initiate disconnect");
                service.disconnect();
            }
            recv(events_rx) -> event => {
                if let Ok(event) = event {
                    print_event(&event);
                }
            }
            recv(done_rx) -> res => {
                // drain remaining state events before finishing
                while let Ok(event) = events_rx.try_recv() {
                    print_event(&event);
                }
                return match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => match err.category() {
                        ErrorCategory::Cancelled => Ok(()),
                        ErrorCategory::Config => Err(exitcode::USAGE),
                        ErrorCategory::Resource | ErrorCategory::Timeout => Err(exitcode::UNAVAILABLE),
                        _ => Err(exitcode::OSERR),
                    },
                    Err(_) => Err(exitcode::SOFTWARE),
                };
            }
        }
    }
}

fn run_check() -> Result<(), exitcode::ExitCode> {
    platform::check_tooling().map_err(|err| {
        tracing::error!(error = %err, "WireGuard tooling unavailable");
        exitcode::UNAVAILABLE
    })?;
    tracing::info!("WireGuard tooling present");
    Ok(())
}

fn main() {
    let args = cli::parse();

    logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let res = ensure_privileged().and_then(|_| match args.command {
        cli::Command::Connect(connect) => run_connect(connect),
        cli::Command::Check => run_check(),
    });

    match res {
        Ok(()) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
