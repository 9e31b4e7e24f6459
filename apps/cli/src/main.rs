use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, NavigationEvent, PipelineEntity, RouteTracker, TrackerClient,
    TransitionOutcome,
};
use shared::{
    domain::{JobId, Stage},
    protocol::JobDraft,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tracker", about = "Job application tracker client")]
struct Cli {
    /// Overrides the configured API base URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Print machine-readable JSON instead of tables.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    Logout,
    Whoami,
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Application count per stage.
    Stats,
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    List {
        #[arg(long)]
        stage: Option<Stage>,
    },
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        company: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, default_value_t = Stage::Applied)]
        stage: Stage,
    },
    Move {
        id: i64,
        stage: Stage,
    },
    Delete {
        id: i64,
    },
}

impl Command {
    fn start_path(&self) -> &'static str {
        match self {
            Command::Login { .. } => "/login",
            Command::Register { .. } => "/register",
            _ => "/dashboard/applications",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(api_url) = &cli.api_url {
        settings.api_base_url = api_url.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(api = %settings.api_base_url, data_dir = %settings.data_dir.display(), "settings loaded");

    let routes = Arc::new(RouteTracker::new(cli.command.start_path()));
    let mut navigation = routes.subscribe();
    let client = TrackerClient::open(&settings, routes.clone())?;

    let result = run(&client, cli.command, cli.json).await;

    while let Ok(NavigationEvent::LoginRequired { target, .. }) = navigation.try_recv() {
        eprintln!("session expired; sign in again ({target})");
    }
    result
}

async fn run(client: &TrackerClient, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let profile = client
                .accounts()
                .login_with_password(&email, &password)
                .await?;
            println!("signed in as {}", profile.display_name());
        }
        Command::Register {
            email,
            password,
            full_name,
        } => {
            let profile = client
                .accounts()
                .register(&email, &password, full_name)
                .await?;
            println!("registered {} (id {})", profile.email, profile.id);
        }
        Command::Logout => {
            if client.accounts().logout() {
                println!("signed out");
            } else {
                println!("not signed in");
            }
        }
        Command::Whoami => {
            if !client.session().is_authenticated() {
                println!("not signed in");
                return Ok(());
            }
            let profile = client.accounts().refresh_profile().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                println!("{} <{}>", profile.display_name(), profile.email);
            }
        }
        Command::Jobs(jobs) => run_jobs(client, jobs, json).await?,
        Command::Stats => {
            let pipeline = client.pipeline();
            pipeline.load_all().await?;
            for (stage, count) in pipeline.stage_counts() {
                println!("{:<14}{count}", stage.title());
            }
        }
    }
    Ok(())
}

async fn run_jobs(client: &TrackerClient, command: JobsCommand, json: bool) -> Result<()> {
    let pipeline = client.pipeline();
    match command {
        JobsCommand::List { stage } => {
            pipeline.load_all().await?;
            let entities = match stage {
                Some(stage) => pipeline.by_stage(stage),
                None => pipeline.snapshot(),
            };
            print_entities(&entities, json)?;
        }
        JobsCommand::Add {
            title,
            company,
            location,
            stage,
        } => {
            let mut draft = JobDraft::new(title, company);
            draft.location = location;
            draft.stage = stage;
            let created = pipeline.create(draft).await?;
            println!("created job {} in {}", created.id, created.stage.title());
        }
        JobsCommand::Move { id, stage } => {
            let id = JobId(id);
            pipeline.load_all().await?;
            let Some(ticket) = pipeline.transition(id, stage)? else {
                println!("job {id} is already in {}", stage.title());
                return Ok(());
            };
            match ticket.wait().await.context("transition task failed")? {
                TransitionOutcome::Confirmed => println!("moved job {id} to {}", stage.title()),
                TransitionOutcome::RolledBack { restored, error } => {
                    return Err(anyhow!(
                        "could not move job {id}; it stays in {}: {}",
                        restored.title(),
                        error.detail().unwrap_or("request failed")
                    ));
                }
                TransitionOutcome::Superseded => {
                    println!("job {id} was changed elsewhere before the move completed")
                }
            }
        }
        JobsCommand::Delete { id } => {
            pipeline.delete(JobId(id)).await?;
            println!("deleted job {id}");
        }
    }
    Ok(())
}

fn print_entities(entities: &[PipelineEntity], json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = entities
            .iter()
            .map(|entity| {
                let mut row = entity.attributes.clone();
                row.insert("id".into(), entity.id.0.into());
                row.insert("status".into(), entity.stage.as_wire().into());
                serde_json::Value::Object(row)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if entities.is_empty() {
        println!("no applications");
        return Ok(());
    }
    for entity in entities {
        println!(
            "{:>5}  {:<14}{:<32}{}",
            entity.id,
            entity.stage.title(),
            entity.title().unwrap_or("-"),
            entity.company().unwrap_or("-")
        );
    }
    Ok(())
}
