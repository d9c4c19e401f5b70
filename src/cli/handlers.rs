use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::cli::PassiveCommands;
use crate::client::{attach, ConsoleClient, CreatePassiveRequest, ExitReason, RawTerminal, WsConnector};
use crate::core::{AgentId, AgentStatus, Config, Geometry, PassiveAgent, PassiveAgentId};
use crate::directory::{AgentDirectory, AgentQuery, DirectoryPoller};
use crate::engine::{EngineConfig, PickerState, ShellEngine, VariantPicker};
use crate::passive::{PassiveRegistry, PassiveUpdate, TcpDialer};

pub async fn list_agents(
    config: Config,
    text: Option<String>,
    statuses: Vec<AgentStatus>,
    page: usize,
    size: Option<usize>,
) -> Result<()> {
    let client = ConsoleClient::from_config(&config)?;
    let query = AgentQuery {
        text,
        statuses,
        page,
        size: size.unwrap_or(config.directory.page_size),
    };
    let page = client
        .list_agents(&query)
        .await
        .context("Failed to list agents")?;

    if page.data.is_empty() {
        println!("No agents found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<9}  {:<21}  {}",
        "ID", "NAME", "STATUS", "ADDRESS", "OS"
    );
    for agent in &page.data {
        println!(
            "{:<36}  {:<20}  {:<9}  {:<21}  {}",
            agent.id,
            agent.name,
            agent.status,
            agent.address,
            agent.os.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} of {} agents", page.data.len(), page.total);
    Ok(())
}

pub async fn list_variants(config: Config) -> Result<()> {
    let client = ConsoleClient::from_config(&config)?;
    let variants = client
        .shell_variants()
        .await
        .context("Failed to fetch shell variants")?;
    for variant in variants {
        let marker = if config.is_shell_allowed(&variant) {
            ""
        } else {
            "  (not allowed locally)"
        };
        println!("{}{}", variant, marker);
    }
    Ok(())
}

pub async fn open_shell(config: Config, agent_key: String, cmd: String) -> Result<()> {
    let client = ConsoleClient::from_config(&config)?;

    let directory = AgentDirectory::new();
    let poller = DirectoryPoller::new(
        Arc::new(client.clone()),
        directory.clone(),
        config.poll_interval(),
    );
    poller
        .poll_once()
        .await
        .context("Failed to load the agent directory")?;
    let Some(agent) = directory.find(&agent_key) else {
        bail!("No agent with id or name '{}'", agent_key);
    };
    tracing::info!("Opening {} on {} ({})", cmd, agent.name, agent.id);

    let cancel = CancellationToken::new();
    let poller_task = poller.spawn(cancel.clone());

    let engine = ShellEngine::new(
        Arc::new(WsConnector::new(client.clone())),
        directory,
        EngineConfig::from(&config),
    );
    let mut picker = VariantPicker::new();
    match client.shell_variants().await {
        Ok(variants) => picker.load(
            variants
                .into_iter()
                .filter(|variant| config.is_shell_allowed(variant))
                .collect(),
        ),
        Err(e) => {
            tracing::warn!("Shell variant discovery failed, using configured list: {}", e);
            picker.load(config.shell.allowed.clone());
        }
    }
    if picker.state() == PickerState::Invalid {
        bail!("The console permits no shell variant this client allows");
    }
    picker.select(&cmd)?;
    engine.set_allowed_shells(picker.variants().to_vec());

    let geometry = RawTerminal::geometry().unwrap_or_else(|_| config.default_geometry());
    let result = run_shell(&engine, &mut picker, agent.id, geometry).await;

    engine.disconnect().await;
    cancel.cancel();
    let _ = poller_task.await;
    result
}

async fn run_shell(
    engine: &ShellEngine,
    picker: &mut VariantPicker,
    agent_id: AgentId,
    geometry: Geometry,
) -> Result<()> {
    let cmd = picker
        .start()
        .ok_or_else(|| anyhow::anyhow!("No shell variant selected"))?;
    let mut token = engine.open_session(agent_id, &cmd, geometry).await?;

    loop {
        match attach(engine, token).await? {
            ExitReason::Detached => {
                println!("\nDetached from session {}", token.short());
                engine.forget_session(token).await;
                return Ok(());
            }
            ExitReason::Closed(reason) => {
                println!("\nSession {} ended: {}", token.short(), reason);
                if !picker.affordance().is_some_and(|a| a.requires_confirmation()) {
                    engine.forget_session(token).await;
                    return Ok(());
                }
                let prompt = engine.prompt_reconnect(token).await?;
                if !confirm(&prompt.message()).await? {
                    engine.forget_session(token).await;
                    return Ok(());
                }
                let replacement = engine.reconnect(prompt.confirm()).await?;
                // the replaced session's scrollback is already on screen
                engine.forget_session(token).await;
                token = replacement;
            }
        }
    }
}

async fn confirm(question: &str) -> Result<bool> {
    println!("{} [y/N]", question);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub async fn handle_passive_command(config: Config, command: PassiveCommands) -> Result<()> {
    let client = || ConsoleClient::from_config(&config);
    match command {
        PassiveCommands::Run => return run_passive(config.clone()).await,
        PassiveCommands::List { text, page, size } => {
            let size = size.unwrap_or(config.directory.page_size);
            let page = client()?.list_passive(text.as_deref(), page, size).await?;
            if page.data.is_empty() {
                println!("No passive agents registered");
            } else {
                print_passive(&page.data);
                println!("\n{} of {} passive agents", page.data.len(), page.total);
            }
        }
        PassiveCommands::Add {
            name,
            address,
            retry_time,
        } => {
            let id = client()?
                .create_passive(&CreatePassiveRequest {
                    name: name.clone(),
                    address,
                    retry_time,
                })
                .await
                .context("Failed to register passive agent")?;
            println!("Registered passive agent {} ({})", name, id);
        }
        PassiveCommands::Update {
            id,
            name,
            address,
            retry_time,
        } => {
            let update = PassiveUpdate {
                name,
                address,
                retry_time,
            };
            client()?.update_passive(&id, &update).await?;
            println!("Updated passive agent {}", id);
        }
        PassiveCommands::Delete { ids } => {
            let client = client()?;
            let removed = if let [id] = ids.as_slice() {
                client.delete_passive(id).await?;
                1
            } else {
                client.delete_passive_many(&ids).await?
            };
            println!("Deleted {} passive agent(s)", removed);
        }
        PassiveCommands::Activate { id } => {
            client()?.activate_passive(&id).await?;
            println!("Activation of {} requested", id);
        }
    }
    Ok(())
}

/// Dial the configured passive agents from this machine until Ctrl-C
async fn run_passive(config: Config) -> Result<()> {
    if config.passive.agents.is_empty() {
        bail!("No passive agents configured. Add [[passive.agents]] entries to the config file.");
    }

    let registry = PassiveRegistry::new(Arc::new(TcpDialer), config.dial_timeout());
    let mut manual: Vec<PassiveAgentId> = Vec::new();
    for entry in &config.passive.agents {
        let record = registry
            .create(&entry.name, &entry.address, entry.retry_time)
            .with_context(|| format!("Invalid passive agent entry '{}'", entry.name))?;
        if record.retry_time == 0 {
            manual.push(record.id);
        }
    }
    // entries without a retry interval get one dial at startup
    for id in &manual {
        registry.activate_now(id)?;
    }

    println!(
        "Dialing {} passive agent(s). Press Ctrl-C to stop.",
        config.passive.agents.len()
    );
    tokio::signal::ctrl_c().await?;
    println!();
    print_passive(&registry.list());
    registry.shutdown();
    Ok(())
}

fn print_passive(records: &[PassiveAgent]) {
    println!(
        "{:<36}  {:<20}  {:<21}  {:>6}  {}",
        "ID", "NAME", "ADDRESS", "RETRY", "STATUS"
    );
    for record in records {
        println!(
            "{:<36}  {:<20}  {:<21}  {:>5}s  {}",
            record.id, record.name, record.address, record.retry_time, record.status
        );
    }
}
