use core::sync::atomic::Ordering;

use anyhow::Error;
use clap::Parser;
use volley::{cfg::Config, cmd::Cmd, engine::Engine, logging};

pub fn main() {
    let cmd = Cmd::parse();
    logging::init(cmd.verbose as usize, cmd.quiet).unwrap();

    if let Err(err) = run(cmd) {
        log::error!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Error> {
    let cfg: Config = cmd.try_into()?;

    let engine = Engine::new(cfg)?;

    // SIGINT/SIGTERM request a cooperative stop; workers drain within one
    // watchdog tick.
    let stop = engine.stop_handle();
    ctrlc::set_handler(move || stop.store(false, Ordering::SeqCst))?;

    let summary = engine.run()?;
    summary.render(&mut std::io::stdout().lock())?;

    Ok(())
}
