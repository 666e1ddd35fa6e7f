//! rascsi-ctl binary entry point.

use clap::Parser;
use tracing::error;

use rascsi_ctl::Cli;

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = rascsi_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("rascsi-ctl: failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    let output = match rt.block_on(rascsi_ctl::run(&cli)) {
        Ok(output) => output,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("rascsi-ctl: {}", e);
            std::process::exit(1);
        }
    };

    match output.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("rascsi-ctl: {}", e);
            std::process::exit(1);
        }
    }
    if let Some(table) = &output.table {
        print!("{}", table);
    }
    if !output.is_ok() {
        std::process::exit(1);
    }
}
