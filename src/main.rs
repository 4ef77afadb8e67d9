use clap::Parser;
use elvis_tcp::{
    cli::{init_logging, Args},
    simulation,
};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    println!("elvis-tcp v{}", env!("CARGO_PKG_VERSION"));
    if args.log {
        match init_logging() {
            Ok(path) => println!("Logging to {}", path.display()),
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    }
    println!(
        "Sending {} bytes with {} over a link with {}% loss...",
        args.bytes,
        args.congestion,
        args.loss * 100.0
    );
    match simulation::transfer(args.transfer_config()).await {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Transfer failed: {e}");
            ExitCode::FAILURE
        }
    }
}
