use std::error::Error;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use atty::Stream;
use brandlens_rs::cleanup;
use brandlens_rs::config::{DEFAULT_ENDPOINT, DEFAULT_MODEL, GeneratorConfig, PipelineConfig};
use brandlens_rs::generator::{GeminiClient, TextGenerator};
use brandlens_rs::page::Page;
use brandlens_rs::pipeline::{Pipeline, PipelineReport, Stage};
use brandlens_rs::state::FormSubmission;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "brandlens", about = "Generate brand strategies for startup ideas", version)]
pub struct Cli {
    /// Emit JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web front end.
    #[cfg(feature = "web")]
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: std::net::SocketAddr,
        /// Public base URL used for canonical links.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        base_url: String,
        /// Maximum number of sessions kept in memory.
        #[arg(long, default_value_t = brandlens_rs::session::DEFAULT_SESSION_CAPACITY)]
        session_capacity: usize,
        #[command(flatten)]
        generator: GeneratorArgs,
    },
    /// Run the three-stage pipeline once and print every report.
    Generate {
        /// Startup idea.
        #[arg(long)]
        idea: String,
        /// Launch plan.
        #[arg(long)]
        launch_plan: String,
        #[command(flatten)]
        generator: GeneratorArgs,
    },
    /// Run the cleanup filter over a file, or stdin when no file is given.
    Clean {
        file: Option<PathBuf>,
    },
    /// List the site's pages.
    Pages,
}

#[derive(Args, Debug)]
struct GeneratorArgs {
    /// Gemini API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Model name.
    #[arg(long, env = "BRANDLENS_MODEL", default_value = DEFAULT_MODEL)]
    model: String,
    /// API base URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
    /// TOML file holding `GEMINI_API_KEY`, read when no key is given.
    #[arg(long)]
    secrets_file: Option<PathBuf>,
    /// Fail a rate-limited stage instead of retrying it once.
    #[arg(long)]
    no_retry: bool,
    /// Seconds to wait before retrying a rate-limited stage.
    #[arg(long, default_value_t = 20)]
    retry_backoff_secs: u64,
    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

impl GeneratorArgs {
    fn pipeline(&self) -> Result<Pipeline, Box<dyn Error>> {
        let mut config = GeneratorConfig {
            api_key: self
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        };
        if let Some(path) = &self.secrets_file {
            config = config.with_secrets_file(path)?;
        }
        let generator = GeminiClient::from_config(&config)?
            .map(|client| Arc::new(client) as Arc<dyn TextGenerator>);
        Ok(Pipeline::new(
            generator,
            PipelineConfig {
                retry_on_rate_limit: !self.no_retry,
                rate_limit_backoff: Duration::from_secs(self.retry_backoff_secs),
            },
        ))
    }
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        #[cfg(feature = "web")]
        Command::Serve {
            addr,
            base_url,
            session_capacity,
            generator,
        } => handle_serve(addr, base_url, session_capacity, &generator),
        Command::Generate {
            idea,
            launch_plan,
            generator,
        } => handle_generate(&idea, &launch_plan, &generator, cli.json),
        Command::Clean { file } => handle_clean(file, cli.json),
        Command::Pages => handle_pages(cli.json),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

#[cfg(feature = "web")]
fn handle_serve(
    addr: std::net::SocketAddr,
    base_url: String,
    session_capacity: usize,
    generator: &GeneratorArgs,
) -> Result<(), Box<dyn Error>> {
    use brandlens_rs::web::{self, WebConfig};

    init_tracing();
    let pipeline = generator.pipeline()?;
    let config = WebConfig {
        addr,
        base_url: base_url.trim_end_matches('/').to_string(),
        session_capacity,
    };
    runtime()?.block_on(web::serve(config, pipeline))?;
    Ok(())
}

fn handle_generate(
    idea: &str,
    launch_plan: &str,
    generator: &GeneratorArgs,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let submission = FormSubmission::new(idea, launch_plan)?;
    let pipeline = generator.pipeline()?;
    if !pipeline.is_configured() {
        return Err("API not configured: pass --api-key, set GEMINI_API_KEY, or use --secrets-file".into());
    }
    init_tracing();
    let report = runtime()?.block_on(pipeline.run(&submission, |_, _| {}));

    if as_json {
        let payload = json!({
            "idea": submission.idea(),
            "launch_plan": submission.launch_plan(),
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_report(&report);
    }
    if report.succeeded() {
        Ok(())
    } else {
        Err("one or more stages failed".into())
    }
}

fn handle_clean(file: Option<PathBuf>, as_json: bool) -> Result<(), Box<dyn Error>> {
    let input = match file {
        Some(path) => fs::read_to_string(&path)
            .map_err(|err| format!("Failed to read {}: {err}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let cleaned = cleanup::clean(&input);

    if as_json {
        let payload = json!({
            "input_chars": input.chars().count(),
            "cleaned_chars": cleaned.chars().count(),
            "cleaned": cleaned,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{cleaned}");
    }
    Ok(())
}

fn handle_pages(as_json: bool) -> Result<(), Box<dyn Error>> {
    if as_json {
        let payload: Vec<_> = Page::ALL
            .iter()
            .map(|page| {
                json!({
                    "index": page.index(),
                    "slug": page.slug(),
                    "title": page.title(),
                    "report": page.is_report(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_pages_table();
    }
    Ok(())
}

fn print_pages_table() {
    let width = Page::ALL
        .iter()
        .map(|page| page.slug().len())
        .max()
        .unwrap_or(4)
        .max("SLUG".len());
    println!("{:<5}  {:<width$}  {}", "INDEX", "SLUG", "TITLE", width = width);
    println!("{:-<5}  {:-<width$}  {}", "", "", "-----", width = width);
    for page in Page::ALL {
        println!(
            "{:<5}  {:<width$}  {}",
            page.index(),
            page.slug(),
            page.title(),
            width = width
        );
    }
}

fn print_report(report: &PipelineReport) {
    for stage in Stage::ALL {
        render_markdown_block(stage.label(), &report.output(stage).display_text());
    }
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn markdown_skin() -> MadSkin {
    MadSkin::default()
}

fn render_markdown_block(title: &str, body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    println!("\n{title}:");
    if stdout_is_tty() {
        let skin = markdown_skin();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_flags_parse() {
        let cli = Cli::try_parse_from([
            "brandlens",
            "--json",
            "generate",
            "--idea",
            "AI tutoring app",
            "--launch-plan",
            "Launch in Mumbai",
            "--api-key",
            "k",
            "--no-retry",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Generate {
                idea, generator, ..
            } => {
                assert_eq!(idea, "AI tutoring app");
                assert!(generator.no_retry);
                assert_eq!(generator.api_key.as_deref(), Some("k"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn blank_key_leaves_pipeline_unconfigured() {
        let args = GeneratorArgs {
            api_key: Some("   ".to_string()),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            secrets_file: None,
            no_retry: false,
            retry_backoff_secs: 0,
            timeout_secs: 5,
        };
        assert!(!args.pipeline().unwrap().is_configured());
    }

    #[test]
    fn pages_command_takes_no_arguments() {
        let cli = Cli::try_parse_from(["brandlens", "pages"]).unwrap();
        assert!(matches!(cli.command, Command::Pages));
        assert!(Cli::try_parse_from(["brandlens", "pages", "extra"]).is_err());
    }
}
