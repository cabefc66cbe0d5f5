use clap::Parser;
use log::{error, info};

use kpts2cvat::config::MergeArgs;
use kpts2cvat::pipeline::merge_exports;

fn main() {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = MergeArgs::parse();

    info!("Starting the merge of corrected exports...");

    match merge_exports(&args) {
        Ok(output) => info!("Merge completed successfully: {}", output.display()),
        Err(e) => {
            error!("{}: {}", e.kind(), e);
            std::process::exit(1);
        }
    }
}
