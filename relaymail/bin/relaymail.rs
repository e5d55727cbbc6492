//! Operator entry point: send a message through the delivery chain, run a
//! STARTTLS diagnostic, or verify the primary relay.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaymail_common::logging;
use relaymail_delivery::{
    DeliveryEngine, DeliveryResult, DiagnosticRequest, DiagnosticRunner, EmailRequest, EnvSource,
    Layered, MapSource, SmtpTransport, TransportConfig, TransportKind,
};
use secrecy::SecretString;

#[derive(Parser, Debug)]
#[command(name = "relaymail")]
#[command(about = "Deliver email over a fallback relay chain", long_about = None)]
#[command(version)]
struct Cli {
    /// Override a configuration key, e.g. `--set SMTP_PORT=465` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override, global = true)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one message and print the delivery result as JSON
    Send {
        /// Recipients, separated by `,` or `;`; `Name <addr>` is accepted
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        html: Option<String>,
        #[arg(long)]
        text: Option<String>,
        /// `From:` header; defaults to the configured sender
        #[arg(long)]
        from: Option<String>,
    },
    /// Walk a relay through STARTTLS and AUTH, printing the transcript as JSON
    Diagnose {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        pass: Option<String>,
        /// Skip the public IP lookup
        #[arg(long)]
        no_public_ip: bool,
    },
    /// Connect and authenticate against the primary relay without sending
    Verify,
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    logging::init();
    let cli = Cli::parse();

    let source = Layered::new()
        .with(cli.overrides.into_iter().collect::<MapSource>())
        .with(EnvSource);
    let config = TransportConfig::from_source(&source);
    config.log_summary();

    match cli.command {
        Commands::Send {
            to,
            subject,
            html,
            text,
            from,
        } => {
            let engine =
                DeliveryEngine::from_config(&config).context("Failed to build delivery chain")?;
            let request = EmailRequest {
                to: to.as_str().into(),
                subject,
                html,
                text,
                from,
            };

            match engine.send(&request).await {
                Ok(outcome) => {
                    print_json(&serde_json::to_value(DeliveryResult::from(&outcome))?)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_json(&serde_json::json!({
                        "error": e.public_message(),
                        "status": e.status(),
                    }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Diagnose {
            host,
            port,
            user,
            pass,
            no_public_ip,
        } => {
            let mut runner = DiagnosticRunner::from_config(&config);
            if no_public_ip {
                runner = runner.with_public_ip_url(None);
            }

            let report = runner
                .run(&DiagnosticRequest {
                    host,
                    port,
                    user,
                    pass: pass.map(SecretString::new),
                })
                .await;

            print_json(&serde_json::to_value(&report)?)?;
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Verify => {
            let primary = config
                .chain
                .iter()
                .find(|d| d.kind == TransportKind::Smtp)
                .context("No SMTP transport configured")?;
            let transport = SmtpTransport::new(
                primary.clone(),
                config.helo_name.clone(),
                config.timeouts,
                config.certificates,
            );

            match transport.verify().await {
                Ok(()) => {
                    tracing::info!(transport = %primary.id(), "SMTP server is ready");
                    print_json(&serde_json::json!({ "ok": true, "verified": true }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    tracing::error!(transport = %primary.id(), error = %e, "SMTP verification failed");
                    print_json(&serde_json::json!({ "ok": false, "error": e.to_string() }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("SMTP_PORT=465"),
            Ok(("SMTP_PORT".to_string(), "465".to_string()))
        );
        assert_eq!(
            parse_override("SMTP_PASS=a=b"),
            Ok(("SMTP_PASS".to_string(), "a=b".to_string()))
        );
        assert!(parse_override("SMTP_PORT").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from([
            "relaymail",
            "--set",
            "SMTP_HOST=mail.example.com",
            "send",
            "--to",
            "Ana <ana@x.com>; bob@x.com",
            "--subject",
            "Hi",
            "--text",
            "Hello",
        ])
        .unwrap();

        assert_eq!(
            cli.overrides,
            vec![("SMTP_HOST".to_string(), "mail.example.com".to_string())]
        );
        assert!(matches!(cli.command, Commands::Send { ref to, .. } if to == "Ana <ana@x.com>; bob@x.com"));
    }
}
