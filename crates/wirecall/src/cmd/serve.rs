use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wirecall::echo::{Echo, EchoService};
use wirecall_server::Skeleton;
use wirecall_transport::RpcListener;

use crate::cmd::{parse_endpoint, ServeArgs};
use crate::exit::{serve_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let listener =
        RpcListener::bind(&endpoint).map_err(|err| transport_error("bind failed", err))?;

    let skeleton = Arc::new(Skeleton::new());
    skeleton
        .add_operation::<Echo, _>(Arc::new(EchoService))
        .map_err(|err| serve_error("registration failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running), Arc::clone(&skeleton))?;

    tracing::info!(%endpoint, "serving echo");
    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                return Err(transport_error("accept failed", err));
            }
        };

        let skeleton = Arc::clone(&skeleton);
        std::thread::spawn(move || {
            if let Err(err) = skeleton.serve(stream) {
                tracing::warn!(error = %err, "connection ended with error");
            }
        });
    }

    skeleton.shutdown(true);
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, skeleton: Arc<Skeleton>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        skeleton.shutdown_no_wait();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
