use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mailprobe::{ProxyConfig, PublicResult, Verifier, VerifierConfig};

/// Verifications run in parallel per batch.
const BATCH_SIZE: usize = 20;
const BULK_OUTPUT: &str = "results.json";

#[derive(Parser)]
#[command(
    name = "mailprobe-cli",
    about = "SMTP deliverability probing without sending mail"
)]
struct Cli {
    /// an email address, or a path to a file with one address per line
    input: Option<String>,

    /// name announced in EHLO/HELO
    #[arg(long)]
    helo: Option<String>,

    /// envelope sender for MAIL FROM (default: verify@<recipient domain>)
    #[arg(long = "from")]
    mail_from: Option<String>,

    /// SMTP port to contact the exchangers on
    #[arg(long, default_value_t = 25)]
    port: u16,

    /// SOCKS5 proxy as host:port
    #[arg(long)]
    proxy: Option<String>,

    /// SOCKS5 username
    #[arg(long = "proxy-user")]
    proxy_user: Option<String>,

    /// SOCKS5 password
    #[arg(long = "proxy-pass")]
    proxy_pass: Option<String>,
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
    can_connect_smtp: bool,
    is_deliverable: bool,
}

#[derive(Serialize)]
struct BulkRecord {
    email: String,
    #[serde(flatten)]
    result: Option<PublicResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let Some(input) = cli.input.clone() else {
        eprintln!("usage: mailprobe-cli <email | path> [options]");
        return ExitCode::from(1);
    };

    match run(&cli, &input) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let fallback = ErrorOutput {
                error: format!("{err:#}"),
                can_connect_smtp: false,
                is_deliverable: false,
            };
            match serde_json::to_string_pretty(&fallback) {
                Ok(json) => println!("{json}"),
                Err(_) => eprintln!("{err:#}"),
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli, input: &str) -> Result<()> {
    let verifier = Verifier::new(build_config(cli)?);

    let path = Path::new(input);
    if path.is_file() {
        run_bulk(&verifier, path)
    } else if input.contains('@') {
        run_single(&verifier, input)
    } else {
        bail!("'{input}' is neither an email address nor a readable file");
    }
}

fn build_config(cli: &Cli) -> Result<VerifierConfig> {
    let mut config = VerifierConfig {
        smtp_port: cli.port,
        ..VerifierConfig::default()
    };
    if let Some(helo) = &cli.helo {
        config.helo_name = helo.clone();
    }
    config.sender_email = cli.mail_from.clone();
    if let Some(endpoint) = &cli.proxy {
        let (host, port) = endpoint
            .rsplit_once(':')
            .with_context(|| format!("--proxy '{endpoint}' is not host:port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("--proxy port '{port}' is not a number"))?;
        let mut proxy = ProxyConfig::new(host, port);
        proxy.username = cli.proxy_user.clone();
        proxy.password = cli.proxy_pass.clone();
        config.proxy = Some(proxy);
    }
    Ok(config)
}

fn run_single(verifier: &Verifier, email: &str) -> Result<()> {
    let verdict = verifier.verify(email);
    info!(email, status = %verdict.status, reason = %verdict.reason, "verification finished");
    let result = PublicResult::from(&verdict);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_bulk(verifier: &Verifier, path: &Path) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let emails: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| line.contains('@'))
        .map(String::from)
        .collect();
    info!(total = emails.len(), "starting bulk verification");

    let mut records = Vec::with_capacity(emails.len());
    for batch in emails.chunks(BATCH_SIZE) {
        let outcomes = thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|email| scope.spawn(move || verifier.verify(email)))
                .collect();
            handles
                .into_iter()
                .zip(batch)
                .map(|(handle, email)| match handle.join() {
                    Ok(verdict) => BulkRecord {
                        email: email.clone(),
                        result: Some(PublicResult::from(&verdict)),
                        error: None,
                    },
                    Err(_) => BulkRecord {
                        email: email.clone(),
                        result: None,
                        error: Some("verification panicked".to_string()),
                    },
                })
                .collect::<Vec<_>>()
        });
        records.extend(outcomes);
        info!(done = records.len(), total = emails.len(), "batch complete");
    }

    let json = serde_json::to_string_pretty(&records)?;
    write_all_atomically(BULK_OUTPUT, json.as_bytes())?;
    info!(output = BULK_OUTPUT, "results written");
    Ok(())
}

fn write_all_atomically(path: &str, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let tmp = format!("{path}.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
