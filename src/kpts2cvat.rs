use clap::Parser;
use log::{error, info};

use kpts2cvat::config::{Cli, Command};
use kpts2cvat::pipeline::{convert_bboxes, convert_keypoints, derive_bboxes, stage_task};

fn main() {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Keypoints(args) => convert_keypoints(args).map(|_| ()),
        Command::Bbox(args) => convert_bboxes(args).map(|_| ()),
        Command::DeriveBbox(args) => derive_bboxes(args).map(|_| ()),
        Command::Stage(args) => stage_task(args)
            .map(|task| info!("Task staged in {}", task.location.display())),
    };

    if let Err(e) = result {
        error!("{}: {}", e.kind(), e);
        std::process::exit(1);
    }
    info!("Conversion completed successfully.");
}
