use std::io::Write;

use anyhow::Result;
use defect_classifier::{run, TrainConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    run(&TrainConfig::default())?;
    Ok(())
}
