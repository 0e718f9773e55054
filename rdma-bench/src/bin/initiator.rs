use rdma_bench::cli::{self, InitiatorArgs};
use rdma_bench::config::InitiatorConfig;
use rdma_bench::initiator;
use rdma_bench::transport::verbs::Verbs;
use std::io;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let args: InitiatorArgs = cli::parse_or_exit();
    cli::init_tracing(args.log);

    let config = InitiatorConfig::from(args);
    match initiator::run(&Verbs::new(), &config, io::stdout()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
