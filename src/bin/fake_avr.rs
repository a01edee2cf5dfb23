use clap::Parser;
use denon_avr::fake::FakeAvr;
use tracing_subscriber::EnvFilter;

/// Run a fake Denon receiver for local development
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Host/IP to listen on
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Line to send whenever a client is idle
    #[arg(long)]
    heartbeat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut fake = FakeAvr::new()
        .listen(format!("{}:{}", args.host, args.port))
        .respond("MV?", &["MV40", "MVMAX 800"])
        .respond("PW?", &["PWON"]);
    if let Some(heartbeat) = args.heartbeat {
        fake = fake.heartbeat(heartbeat);
    }

    let mut handle = fake.serve().await?;
    println!("fake receiver listening on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    handle.close().await;
    Ok(())
}
