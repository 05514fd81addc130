//! deskpilot entry point: tool-server management and plan execution from the command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use deskpilot::agent_core::{
    load_plan, ExecutionEngine, ExpectedOutputVerifier, PlannedRecovery, StaticPlanner,
    ToolArgumentFixer, ToolInvoker,
};
use deskpilot::config::{self, AppConfig};
use deskpilot::mcp_client::McpClient;

/// deskpilot - drive desktop tool servers and run automation plans.
#[derive(Parser)]
#[command(name = "deskpilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (YAML)
    #[arg(long, env = "DESKPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Tool servers file (JSON)
    #[arg(long, env = "DESKPILOT_SERVERS")]
    servers: Option<PathBuf>,

    /// Log to stderr instead of the data directory
    #[arg(long)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configured and connected servers
    Servers {
        /// Connect every enabled server first
        #[arg(long)]
        connect: bool,
    },

    /// List the tools of one server
    Tools { server: String },

    /// Call one tool and print the result as JSON
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Print the server catalog
    Catalog,

    /// Print every enabled server's tools with argument schemas
    Summary,

    /// Run a plan file
    Run {
        plan: PathBuf,
        /// Tool that corrects arguments after hard failures, as SERVER:TOOL
        #[arg(long)]
        fixer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.log_stderr {
        deskpilot::init_tracing(None);
    } else {
        deskpilot::init_tracing(Some(&deskpilot::data_dir()));
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let app = config::load_app_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let servers_path = cli
        .servers
        .or_else(|| app.servers_file.as_ref().map(PathBuf::from))
        .unwrap_or_else(config::default_servers_path);
    let servers = config::load_servers_config(&servers_path)
        .with_context(|| format!("loading {}", servers_path.display()))?;

    let client = Arc::new(McpClient::new(servers, app.mcp.clone()));
    let outcome = dispatch(cli.command, &client, &app).await;
    client.cleanup().await;
    outcome
}

async fn dispatch(
    command: Commands,
    client: &Arc<McpClient>,
    app: &AppConfig,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Servers { connect } => {
            if connect {
                for (name, err) in client.start_all().await {
                    eprintln!("{name}: {err}");
                }
            }
            println!("{}", serde_json::to_string_pretty(&client.status())?);
        }

        Commands::Tools { server } => {
            let tools = client.list_tools(&server).await?;
            for tool in tools {
                println!("{}\t{}", tool.name, tool.description);
            }
        }

        Commands::Call { server, tool, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = client.call_tool(&server, &tool, args).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Catalog => {
            client.start_all().await;
            print!("{}", client.catalog().await);
        }

        Commands::Summary => {
            print!("{}", client.tools_summary().await);
        }

        Commands::Run { plan, fixer } => {
            let plan = load_plan(&plan)?;
            let tools: Arc<dyn ToolInvoker> = client.clone();
            let mut engine = ExecutionEngine::new(
                tools.clone(),
                Arc::new(ExpectedOutputVerifier),
                Arc::new(PlannedRecovery),
                app.execution.clone(),
            );
            if let Some(target) = fixer {
                let (server, tool) = target
                    .split_once(':')
                    .context("--fixer must look like SERVER:TOOL")?;
                engine = engine.with_fixer(Arc::new(ToolArgumentFixer::new(tools, server, tool)));
            }

            client.start_health_monitor(app.mcp.health_interval());
            let planner = StaticPlanner::new(plan.steps);
            match engine.run_request(&planner, &plan.goal).await {
                Ok(report) => {
                    for result in &report.golden_path {
                        println!("{}\t{}\t{}", result.step_id, result.action, result.output);
                    }
                }
                Err(failure) => {
                    if let Some(id) = failure.error.step_id() {
                        eprintln!("unresolved step: {id}");
                    }
                    eprintln!("run failed: {}", failure.error);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
