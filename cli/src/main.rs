mod render;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use common::{EngineEvent, JobId, RunId, TerminalOutcome};
use dpr_engine::config::LoggingConfig;
use dpr_engine::{
    Config, CredentialChain, CredentialProvider, DispatchError, Engine, GithubClient, TargetResolver,
};
use render::Renderer;
use std::future::Future;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(author, version, about = "Trigger GitHub Actions workflows and follow their runs", long_about = None)]
struct Cli {
    /// Config file (.yaml, .yml or .toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output; repeat for trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Print engine events as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the workflows that can be triggered
    Workflows,
    /// Show the repository runs are dispatched to
    Target,
    /// Trigger a workflow and follow the run it creates
    Run {
        /// Workflow id, e.g. "daily-paper-reader.yml"
        workflow: String,
        /// Git ref to run the workflow on
        #[arg(long = "ref")]
        git_ref: Option<String>,
        /// Refresh interval (e.g. "5s", "1m")
        #[arg(long)]
        interval: Option<String>,
    },
    /// Follow a run that already exists
    Watch {
        run_id: u64,
        /// Print one snapshot and exit
        #[arg(long)]
        once: bool,
        /// Refresh interval (e.g. "5s", "1m")
        #[arg(long)]
        interval: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    // stdin is read on a blocking thread that would otherwise hold the runtime open
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = Config::load(cli.config.as_deref())?;
    match &cli.command {
        Commands::Run { git_ref, interval, .. } => apply_overrides(&mut config, git_ref.as_deref(), interval.as_deref())?,
        Commands::Watch { interval, .. } => apply_overrides(&mut config, None, interval.as_deref())?,
        _ => {}
    }
    config.validate()?;
    setup_logging(&config.logging, cli.verbose)?;
    match Config::source_path(cli.config.as_deref()) {
        Some(path) => log::debug!("Loaded config from {:?}", path),
        None => log::debug!("No config file found, using defaults"),
    }

    let tz: chrono_tz::Tz = config
        .display
        .timezone
        .parse()
        .map_err(|e| anyhow!("display.timezone: {}", e))?;
    let json = cli.json;
    let renderer = Renderer::new(tz, json);

    match cli.command {
        Commands::Workflows => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config.workflows)?);
            } else {
                println!("{}", render::workflows_table(&config.catalog()));
            }
            Ok(0)
        }
        Commands::Target => show_target(&config).await,
        Commands::Run { workflow, .. } => {
            let catalog = config.catalog();
            if catalog.find(&workflow).is_none() {
                bail!("unknown workflow {}; known workflows: {}", workflow, catalog.ids().join(", "));
            }
            let (engine, events) = Engine::from_config(&config)?;
            if !json {
                eprintln!("Press Enter to refresh now, Ctrl-C to stop.");
            }
            engine.trigger(JobId(workflow)).await;
            follow(&engine, events, &renderer, false, tokio::signal::ctrl_c()).await
        }
        Commands::Watch { run_id, once, .. } => {
            let (engine, events) = Engine::from_config(&config)?;
            if !json && !once {
                eprintln!("Press Enter to refresh now, Ctrl-C to stop.");
            }
            engine.watch(RunId(run_id)).await;
            follow(&engine, events, &renderer, once, tokio::signal::ctrl_c()).await
        }
    }
}

fn apply_overrides(config: &mut Config, git_ref: Option<&str>, interval: Option<&str>) -> anyhow::Result<()> {
    if let Some(git_ref) = git_ref {
        config.github.git_ref = git_ref.to_string();
    }
    if let Some(interval) = interval {
        let interval = common::parse_duration(interval).context("--interval")?;
        config.polling.interval_secs = interval.as_secs();
    }
    Ok(())
}

fn setup_logging(config: &LoggingConfig, verbose: u8) -> anyhow::Result<()> {
    let configured: log::LevelFilter = config
        .level
        .parse()
        .map_err(|_| anyhow!("unknown log level: {}", config.level))?;
    let level = match verbose {
        0 => configured,
        1 => configured.max(log::LevelFilter::Debug),
        _ => log::LevelFilter::Trace,
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .level_for("hyper", log::LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Some(path) = &config.output {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

async fn show_target(config: &Config) -> anyhow::Result<i32> {
    let client = GithubClient::new(
        &config.github.api_base,
        &config.github.user_agent,
        config.github.request_timeout(),
    )?;
    let credentials = CredentialChain::from_config(&config.credentials);
    let token = credentials.token().ok_or(DispatchError::AuthMissing)?;
    let target = TargetResolver::from_config(&config.github)
        .resolve(&client, &token)
        .await
        .ok_or(DispatchError::RepoUnresolved)?;
    println!("{}", target);
    println!("{}", target.actions_url(&config.github.web_base));
    Ok(0)
}

/// Print events until the attempt ends, feeding Enter presses and
/// `interrupt` (Ctrl-C) back to the engine. Returns the process exit code.
async fn follow(
    engine: &Engine,
    mut events: UnboundedReceiver<EngineEvent>,
    renderer: &Renderer,
    once: bool,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> anyhow::Result<i32> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = !once;
    // one listener for the whole loop so a signal between iterations is kept
    tokio::pin!(interrupt);
    let mut listening = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("engine stopped without a result");
                };
                println!("{}", renderer.event(&event));
                match &event {
                    EngineEvent::Terminal { outcome } => return Ok(exit_code(outcome)),
                    EngineEvent::Snapshot { snapshot } if once => {
                        engine.cancel().await;
                        let failed = snapshot.is_completed() && !snapshot.conclusion.is_success();
                        return Ok(if failed { 1 } else { 0 });
                    }
                    _ => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(_)) => engine.refresh_now().await,
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        log::warn!("Reading stdin failed: {}", e);
                        stdin_open = false;
                    }
                }
            }
            result = &mut interrupt, if listening => {
                match result {
                    Ok(()) => {
                        engine.cancel().await;
                        eprintln!("Cancelled.");
                        return Ok(130);
                    }
                    Err(e) => {
                        log::warn!("Listening for Ctrl-C failed: {}", e);
                        listening = false;
                    }
                }
            }
        }
    }
}

fn exit_code(outcome: &TerminalOutcome) -> i32 {
    match outcome {
        TerminalOutcome::Completed { .. } if outcome.is_success() => 0,
        TerminalOutcome::Unconfirmed { .. } => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Conclusion, Severity};
    use dpr_engine::{EngineSettings, StaticToken};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn idle_engine() -> Engine {
        let client = GithubClient::new("http://127.0.0.1:9", "dpr-test", Duration::from_secs(1)).unwrap();
        let (engine, _events) = Engine::new(
            Arc::new(client),
            Arc::new(StaticToken::new("ghp_test")),
            TargetResolver::default(),
            EngineSettings::default(),
        );
        engine
    }

    #[tokio::test]
    async fn interrupt_raised_while_events_stream_is_not_lost() {
        let engine = idle_engine();
        let renderer = Renderer::new(chrono_tz::UTC, false);
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(EngineEvent::status(format!("step {}", i), Severity::Info)).unwrap();
        }
        let (signal, signalled) = oneshot::channel::<()>();
        signal.send(()).unwrap();
        let interrupt = async move {
            signalled
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        };

        let code = follow(&engine, rx, &renderer, true, interrupt).await.unwrap();
        assert_eq!(code, 130);
        drop(tx);
    }

    #[tokio::test]
    async fn broken_interrupt_listener_keeps_following() {
        let engine = idle_engine();
        let renderer = Renderer::new(chrono_tz::UTC, false);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(EngineEvent::Terminal {
            outcome: TerminalOutcome::Completed {
                run_id: RunId(7),
                conclusion: Conclusion::Success,
            },
        })
        .unwrap();
        let interrupt = async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "no signal support")) };

        let code = follow(&engine, rx, &renderer, true, interrupt).await.unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn exit_code_follows_the_outcome() {
        let done = |conclusion| TerminalOutcome::Completed {
            run_id: RunId(1),
            conclusion,
        };
        assert_eq!(exit_code(&done(Conclusion::Success)), 0);
        assert_eq!(exit_code(&done(Conclusion::Failure)), 1);
        assert_eq!(exit_code(&done(Conclusion::Cancelled)), 1);
        assert_eq!(
            exit_code(&TerminalOutcome::Unconfirmed {
                actions_url: String::new()
            }),
            2
        );
        assert_eq!(
            exit_code(&TerminalOutcome::Failed {
                message: "no token".to_string()
            }),
            1
        );
    }

    #[test]
    fn overrides_replace_ref_and_interval() {
        let mut config = Config::default();
        apply_overrides(&mut config, Some("dev"), Some("1m")).unwrap();
        assert_eq!(config.github.git_ref, "dev");
        assert_eq!(config.polling.interval_secs, 60);
        assert!(apply_overrides(&mut config, None, Some("0s")).is_err());
    }

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::try_parse_from(["dpr", "-vv", "run", "sync.yml", "--ref", "dev"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run { workflow, git_ref, interval } => {
                assert_eq!(workflow, "sync.yml");
                assert_eq!(git_ref.as_deref(), Some("dev"));
                assert!(interval.is_none());
            }
            _ => panic!("expected run"),
        }
    }
}
