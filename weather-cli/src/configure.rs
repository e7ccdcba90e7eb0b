use std::path::Path;

use anyhow::Result;
use inquire::{Confirm, CustomType, Text};
use weather_core::Config;

/// Prompts for broker settings, starting from what is already on disk.
pub fn run(path: &Path) -> Result<()> {
    let mut cfg = Config::load_from(path)?;

    let host = Text::new("Broker host:")
        .with_default(&cfg.broker.host)
        .prompt()?;
    let port = CustomType::<u16>::new("Broker port:")
        .with_default(cfg.broker.port)
        .with_error_message("Please enter a port number between 1 and 65535")
        .prompt()?;
    let topic = Text::new("Topic:").with_default(&cfg.topic).prompt()?;
    let interval = CustomType::<u64>::new("Seconds between broadcasts:")
        .with_default(cfg.tick_interval_secs)
        .with_error_message("Please enter a whole number of seconds")
        .prompt()?;

    cfg.broker.host = host;
    cfg.broker.port = port;
    cfg.topic = topic;
    cfg.tick_interval_secs = interval;
    cfg.validate()?;

    let question = format!("Save to {}?", path.display());
    if !Confirm::new(&question).with_default(true).prompt()? {
        println!("Nothing saved.");
        return Ok(());
    }

    cfg.save_to(path)?;
    println!("Saved configuration to {}", path.display());
    Ok(())
}
