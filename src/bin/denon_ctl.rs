use clap::{Parser, Subcommand};
use denon_avr::{display_or_failed, AvrError, ConnectionConfig, DenonAvr, DEFAULT_PORT};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

/// Control a Denon receiver from the command line
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Host of the receiver
    #[arg(long)]
    avr: String,

    /// Control port of the receiver
    #[arg(long, default_value_t = DEFAULT_PORT)]
    avr_port: u16,

    /// Seconds to wait for the receiver to answer
    #[arg(long, default_value_t = 2.0)]
    timeout: f64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Query or change the power state
    Power {
        #[command(subcommand)]
        action: Option<PowerAction>,
    },
    /// Query or select the input source
    Input { input: Option<String> },
    /// Query or select the surround mode
    Mode { mode: Option<String> },
    /// Query or change the master volume
    Volume {
        #[command(subcommand)]
        action: Option<VolumeAction>,
    },
}

impl Cmd {
    /// Name of the field in the JSON output
    fn key(&self) -> &'static str {
        match self {
            Cmd::Power { .. } => "power",
            Cmd::Input { .. } => "input",
            Cmd::Mode { .. } => "mode",
            Cmd::Volume { .. } => "volume",
        }
    }
}

#[derive(Subcommand, Debug)]
enum PowerAction {
    On,
    Standby,
}

#[derive(Subcommand, Debug)]
enum VolumeAction {
    Up,
    Down,
    /// Set an absolute level, e.g. 35.5
    Set { level: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = ConnectionConfig::new(format!("{}:{}", args.avr, args.avr_port))
        .with_command_timeout(Duration::try_from_secs_f64(args.timeout)?);
    // Give up if the receiver cannot be reached at all, rather than redialing forever.
    let limit = config.dial_timeout + config.command_timeout;
    let avr = DenonAvr::with_config(config)?;

    let key = args.command.key();
    let request = async {
        match args.command {
            Cmd::Power { action } => match action {
                None => avr.power().await,
                Some(PowerAction::On) => avr.power_on().await,
                Some(PowerAction::Standby) => avr.standby().await,
            },
            Cmd::Input { input } => match input {
                None => avr.input_source().await,
                Some(input) => avr.set_input_source(&input).await,
            },
            Cmd::Mode { mode } => match mode {
                None => avr.surround_mode().await,
                Some(mode) => avr.set_surround_mode(&mode).await,
            },
            Cmd::Volume { action } => match action {
                None => avr.volume().await,
                Some(VolumeAction::Up) => avr.volume_up().await,
                Some(VolumeAction::Down) => avr.volume_down().await,
                Some(VolumeAction::Set { level }) => avr.set_volume(&level).await,
            },
        }
    };

    let result = match timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(AvrError::Timeout),
    };

    let mut output = Map::new();
    output.insert(key.to_string(), Value::String(display_or_failed(result)));
    println!("{}", Value::Object(output));
    avr.close().await;
    Ok(())
}
