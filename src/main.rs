use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use televisit::rendezvous::server::{start_relay, RelayState};
use televisit::services::appointments::{AppointmentDirectory, InMemoryAppointments};

#[derive(Parser)]
#[command(name = "televisit", about = "Rendezvous relay for televisit consultations")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "9870")]
    port: u16,

    /// JSON appointment book used to authorize joins; without it the relay
    /// accepts any well-formed address (development only)
    #[arg(long)]
    appointments: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let appointments: Option<Arc<dyn AppointmentDirectory>> = match cli.appointments {
        Some(path) => match InMemoryAppointments::from_json_file(&path) {
            Ok(directory) => {
                tracing::info!("loaded {} appointments from {}", directory.len(), path.display());
                Some(Arc::new(directory))
            }
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("no appointment book configured, joins will not be authorized");
            None
        }
    };

    start_relay(RelayState::new(appointments), cli.port).await;
}
