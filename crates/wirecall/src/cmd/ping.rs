use bytes::Bytes;
use wirecall::echo::{Echo, EchoMessage};
use wirecall_client::{PoolConfig, StubPool, Timeout};
use wirecall_transport::StreamConnector;
use wirecall_wire::IoVector;

use crate::cmd::{parse_duration, parse_endpoint, PingArgs};
use crate::exit::{call_error, CliError, CliResult, FAILURE, SUCCESS};

pub fn run(args: PingArgs) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let timeout = parse_duration(&args.timeout)?;

    let pool = StubPool::new(
        StreamConnector,
        PoolConfig {
            call_timeout: timeout,
            ..PoolConfig::default()
        },
    );

    let payload = Bytes::from(args.data.into_bytes());
    for seq in 0..args.count {
        let request = EchoMessage {
            seq,
            payload: payload.clone(),
        };
        let response = pool
            .with_stub(&endpoint, false, |stub| {
                let mut resp_iov = IoVector::new();
                stub.call_open::<Echo>(&request, &mut resp_iov, Timeout::new(timeout))
            })
            .map_err(|err| call_error("ping failed", err))?;

        if response != request {
            return Err(CliError::new(
                FAILURE,
                format!("echo mismatch at seq {seq}"),
            ));
        }
        println!("seq={seq} bytes={} ok", response.payload.len());
    }

    Ok(SUCCESS)
}
