// Ground station telemetry client - main entry point

use gcs_telemetry::config::Config;
use gcs_telemetry::net::json_client::TelemetryClient;
use gcs_telemetry::output::{ConsoleOutput, CsvOutput};
use gcs_telemetry::ranges::RangeTable;
use gcs_telemetry::session::{SessionSettings, TelemetrySession};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

// One task drives both socket reads and rendering, so the session is never shared
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting ground station telemetry client");

    let rules = match &config.rules {
        Some(path) => {
            let table = RangeTable::from_file(path)?;
            info!("Loaded {} range rules from {}", table.rules().len(), path.display());
            table
        }
        None => RangeTable::builtin(),
    };

    let settings = SessionSettings {
        rules,
        chart: config.chart_settings(),
        smoothing_tau: config.smoothing_tau,
    };
    let mut client = TelemetryClient::new(config.client_settings());
    let mut session = TelemetrySession::new(settings, client.now_ms());

    session.add_subscriber(Box::new(ConsoleOutput::new(
        !config.quiet_records,
        config.status_every(),
    )));

    if let Some(filename) = &config.write_csv {
        info!("Writing plotted samples to {}", filename);
        match CsvOutput::new(filename) {
            Ok(csv_out) => session.add_subscriber(Box::new(csv_out)),
            Err(e) => {
                error!("Failed to open CSV output file {}: {}", filename, e);
                return Err(e.into());
            }
        }
    }

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
    };

    client.run(&mut session, shutdown).await?;

    let stats = session.stats();
    info!(
        "Client stopped. {} frames processed, {} dropped, {} connections",
        stats.frames, stats.dropped, stats.connects
    );

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    // stdout carries records and status lines; logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber
            .with_max_level(tracing::Level::DEBUG)
            .init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber
            .with_max_level(tracing::Level::INFO)
            .init();
    }
}
