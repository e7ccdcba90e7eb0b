use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use weather_core::{CityTable, Config, WeatherRecord, protocol};

use crate::{broadcast, configure};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "MQTT weather broadcaster")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Broadcast readings for the selected city until interrupted (Ctrl-C).
    Run(RunArgs),

    /// Ask a running broadcaster to switch to another city.
    Select {
        /// City name, e.g. "London".
        city: String,

        #[command(flatten)]
        broker: BrokerArgs,
    },

    /// List the cities in the table.
    Cities,

    /// Show the readings for one city.
    Show {
        /// City name, e.g. "Brno".
        city: String,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Interactively edit the broker settings and save them.
    Configure,
}

/// Overrides for the `[broker]` section and topic.
#[derive(Debug, Default, Args)]
pub struct BrokerArgs {
    /// Broker host name.
    #[arg(long)]
    pub host: Option<String>,

    /// Broker TCP port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Topic to publish and subscribe on.
    #[arg(long)]
    pub topic: Option<String>,

    /// MQTT client id.
    #[arg(long)]
    pub client_id: Option<String>,
}

impl BrokerArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(host) = &self.host {
            cfg.broker.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.broker.port = port;
        }
        if let Some(topic) = &self.topic {
            cfg.topic = topic.clone();
        }
        if let Some(client_id) = &self.client_id {
            cfg.broker.client_id = Some(client_id.clone());
        }
    }
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Seconds between broadcasts.
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,
}

impl RunArgs {
    fn apply(&self, cfg: &mut Config) {
        self.broker.apply(cfg);
        if let Some(interval) = self.interval {
            cfg.tick_interval_secs = interval;
        }
    }
}

#[derive(Debug, Serialize)]
struct CityReport<'a> {
    city: &'a str,
    #[serde(flatten)]
    record: &'a WeatherRecord,
    payload: String,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let config_path = match self.config {
            Some(path) => path,
            None => Config::config_file_path()?,
        };
        let mut cfg = Config::load_from(&config_path)?;

        match self.command {
            Command::Run(args) => {
                args.apply(&mut cfg);
                cfg.validate()?;
                broadcast::run(cfg).await
            }
            Command::Select { city, broker } => {
                broker.apply(&mut cfg);
                cfg.validate()?;
                broadcast::select(cfg, &city).await
            }
            Command::Cities => {
                print!("{}", render_table(&cfg.city_table()?));
                Ok(())
            }
            Command::Show { city, json } => {
                let table = cfg.city_table()?;
                let record = lookup(&table, &city)?;

                if json {
                    let report = CityReport {
                        city: &city,
                        record,
                        payload: protocol::encode_data(record).trim_end().to_string(),
                    };
                    let out = serde_json::to_string_pretty(&report)
                        .context("Failed to serialize city report")?;
                    println!("{out}");
                } else {
                    print!("{}", render_city(&city, record));
                }
                Ok(())
            }
            Command::Configure => configure::run(&config_path),
        }
    }
}

fn lookup<'a>(table: &'a CityTable, city: &str) -> anyhow::Result<&'a WeatherRecord> {
    table.get(city).ok_or_else(|| {
        let known: Vec<&str> = table.names().collect();
        anyhow!(
            "Unknown city '{city}'.\n\
             Hint: known cities are {}.",
            known.join(", ")
        )
    })
}

fn render_table(table: &CityTable) -> String {
    let width = table.names().map(str::len).max().unwrap_or(0);

    table
        .iter()
        .map(|entry| {
            format!(
                "{:<width$}  {}\n",
                entry.name,
                entry.record.values().join(", ")
            )
        })
        .collect()
}

fn render_city(city: &str, record: &WeatherRecord) -> String {
    format!(
        "{city}\n  temperature: {}\n  humidity:    {}\n  visibility:  {}\n",
        record.temperature, record.humidity, record.visibility
    )
}
