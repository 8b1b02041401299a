use std::path::Path;

use muxgate_load::{HelloReport, run_hello};

pub async fn run(config: Option<&Path>, format: &str) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let report = run_hello(&config.connection).await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => println!("{}", format_report(&report)),
    }
    Ok(())
}

fn format_report(report: &HelloReport) -> String {
    format!(
        "✓ response {:?} on stream {} ({} bytes sent, {} received)\n✓ connection {} {:?}, {} active streams",
        report.response,
        report.stream.stream,
        report.stream.bytes_sent,
        report.stream.bytes_received,
        report.connection.connection,
        report.connection.phase,
        report.connection.active_streams,
    )
}
