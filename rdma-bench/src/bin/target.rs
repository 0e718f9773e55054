use rdma_bench::cli::{self, TargetArgs};
use rdma_bench::config::TargetConfig;
use rdma_bench::target::Target;
use rdma_bench::transport::verbs::Verbs;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let args: TargetArgs = cli::parse_or_exit();
    cli::init_tracing(args.log);

    let config = TargetConfig::from(args);
    let result = Target::bind(&Verbs::new(), config).and_then(|mut target| target.serve());
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
