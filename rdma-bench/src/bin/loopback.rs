use rdma_bench::cli::{self, LoopbackArgs};
use rdma_bench::initiator;
use rdma_bench::target::Target;
use rdma_bench::transport::loopback::LoopbackFabric;
use std::io;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};

fn main() -> ExitCode {
    let args: LoopbackArgs = cli::parse_or_exit();
    cli::init_tracing(args.log);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: LoopbackArgs) -> rdma_bench::Result<()> {
    let (target_config, initiator_config) = args.configs();
    let fabric = LoopbackFabric::new();

    let mut target = Target::bind(&fabric, target_config)?;
    thread::Builder::new().name("target".into()).spawn(move || {
        if let Err(e) = target.serve() {
            error!("target stopped: {e}");
        }
    })?;

    let summary = initiator::run(&fabric, &initiator_config, io::stdout())?;
    info!(
        submitted = summary.pipeline.submitted,
        seed = summary.seed,
        "done"
    );
    Ok(())
}
