use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nomad_control::api::ApiClient;
use nomad_control::config::ServerConfig;
use nomad_control::node::ServerNode;
use nomad_control::shutdown::install_shutdown_handler;
use nomad_control::structs::duration::{format_duration, parse_duration};
use nomad_control::structs::{AclRole, AuthMethod, AuthMethodStub};

#[derive(Parser, Debug)]
#[command(name = "nomad-control")]
#[command(version)]
#[command(about = "Control-plane server with ACL auth methods and OIDC login")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a control-plane server
    Agent(AgentArgs),

    /// Manage ACL auth methods
    AuthMethod {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: AuthMethodCommands,
    },

    /// Manage ACL roles
    Role {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: RoleCommands,
    },

    /// Log in through an OIDC auth method and print the minted token
    Login {
        #[command(flatten)]
        client: ClientArgs,

        /// Auth method to log in with
        #[arg(long)]
        method: String,

        /// Local address the provider redirects the browser to
        #[arg(long, default_value = "127.0.0.1:4649")]
        callback_addr: SocketAddr,

        /// How long to wait for the browser redirect (e.g. "2m")
        #[arg(long, default_value = "5m", value_parser = parse_wait)]
        timeout: Duration,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Node ID (unique within the region)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:4646")]
    bind: SocketAddr,

    /// Base URL other servers use to reach this one (defaults to http://<bind>)
    #[arg(long)]
    advertise: Option<String>,

    /// Region this server belongs to
    #[arg(long, default_value = "global")]
    region: String,

    /// Region that owns auth methods and ACL writes
    #[arg(long, default_value = "global")]
    authoritative_region: String,

    /// Disable ACL enforcement
    #[arg(long)]
    no_acl: bool,

    /// Secret of the management token minted when the token table is empty
    #[arg(long)]
    bootstrap_token: Option<String>,

    /// Servers of other regions (repeatable, format: "region=url")
    /// Example: --region-server global=http://10.0.0.2:4646
    #[arg(long = "region-server")]
    region_servers: Vec<String>,

    /// Token used to replicate auth methods from the authoritative region
    #[arg(long)]
    replication_token: Option<String>,

    /// Key signing OIDC login state; must match across the authoritative region
    #[arg(long)]
    oidc_state_key: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// HTTP address of a server
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:4646")]
    address: String,

    /// ACL token secret
    #[arg(long, short = 't')]
    token: Option<String>,

    /// Region to target (defaults to the server's own)
    #[arg(long)]
    region: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum AuthMethodCommands {
    /// List auth methods
    List {
        /// Only show methods whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show one auth method
    Info { name: String },
    /// Create or update an auth method from a JSON file
    Apply { file: PathBuf },
    /// Delete an auth method
    Delete { name: String },
}

#[derive(clap::Subcommand, Debug)]
enum RoleCommands {
    /// Create or update roles from a JSON file holding a list of roles
    Apply { file: PathBuf },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct IndexOutput {
    index: u64,
}

#[derive(Serialize)]
struct AuthMethodListOutput {
    auth_methods: Vec<AuthMethodStub>,
    index: u64,
}

#[derive(Serialize)]
struct LoginOutput {
    secret_id: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_wait(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

fn parse_region_servers(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((region, url)) if !region.is_empty() && !url.is_empty() => {
                Some((region.trim().to_string(), url.trim().to_string()))
            }
            _ => {
                tracing::warn!(entry, "Invalid region server, expected region=url");
                None
            }
        })
        .collect()
}

fn client(args: &ClientArgs) -> Result<ApiClient, Box<dyn std::error::Error>> {
    let mut client = ApiClient::new(args.address.clone())?;
    if let Some(token) = &args.token {
        client = client.with_token(token.clone());
    }
    if let Some(region) = &args.region {
        client = client.with_region(region.clone());
    }
    Ok(client)
}

fn print_index(index: u64, output: &OutputFormat, what: &str) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&IndexOutput { index })?),
        OutputFormat::Table => println!("{} (index {})", what, index),
    }
    Ok(())
}

// =============================================================================
// Agent
// =============================================================================

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::new(args.node_id, args.bind)
        .with_region(args.region)
        .with_authoritative_region(args.authoritative_region)
        .with_acl(!args.no_acl);
    if let Some(advertise) = args.advertise {
        config.advertise_addr = advertise;
    }
    if let Some(secret) = args.bootstrap_token {
        config = config.with_bootstrap_token(secret);
    }
    for (region, url) in parse_region_servers(&args.region_servers) {
        config = config.with_region_server(region, url);
    }
    config.replication.token = args.replication_token;
    if let Some(key) = args.oidc_state_key {
        config.oidc.state_key = key.into_bytes();
    }

    if !config.acl_enabled {
        tracing::warn!("ACLs are disabled; every request runs with management privileges");
    }
    if !config.is_authoritative() && config.replication.token.is_none() {
        tracing::warn!(
            authoritative = %config.authoritative_region,
            "No replication token set; auth method replication will be denied upstream"
        );
    }

    let shutdown = install_shutdown_handler();
    let (node, raft_rx) = ServerNode::new(config, shutdown)?;
    node.run(raft_rx).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_auth_method(
    client: &ApiClient,
    command: AuthMethodCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        AuthMethodCommands::List { prefix } => {
            let (auth_methods, index) = client.list_auth_methods(prefix.as_deref()).await?;
            match output {
                OutputFormat::Json => {
                    let out = AuthMethodListOutput { auth_methods, index };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    if auth_methods.is_empty() {
                        println!("No auth methods");
                        return Ok(());
                    }
                    println!("{:<32} {:<8} {:>12}", "NAME", "TYPE", "MODIFY INDEX");
                    for stub in &auth_methods {
                        println!(
                            "{:<32} {:<8} {:>12}",
                            stub.name, stub.method_type, stub.modify_index
                        );
                    }
                }
            }
        }
        AuthMethodCommands::Info { name } => match client.get_auth_method(&name).await? {
            Some(method) => match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&method)?),
                OutputFormat::Table => print_auth_method(&method),
            },
            None => return Err(format!("auth method {:?} not found", name).into()),
        },
        AuthMethodCommands::Apply { file } => {
            let raw = tokio::fs::read(&file).await?;
            let method: AuthMethod = serde_json::from_slice(&raw)?;
            let index = client.upsert_auth_method(&method).await?;
            print_index(index, output, &format!("Applied auth method {:?}", method.name))?;
        }
        AuthMethodCommands::Delete { name } => {
            let index = client.delete_auth_method(&name).await?;
            print_index(index, output, &format!("Deleted auth method {:?}", name))?;
        }
    }
    Ok(())
}

fn print_auth_method(method: &AuthMethod) {
    println!("Name            = {}", method.name);
    println!("Type            = {}", method.method_type);
    println!("Max Token TTL   = {}", format_duration(method.max_token_ttl));
    println!("Discovery URL   = {}", method.config.oidc_discovery_url);
    println!("Client ID       = {}", method.config.oidc_client_id);
    println!("Redirect URIs   = {}", method.config.allowed_redirect_uris.join(", "));
    println!("Create Index    = {}", method.create_index);
    println!("Modify Index    = {}", method.modify_index);
}

async fn handle_role(
    client: &ApiClient,
    command: RoleCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        RoleCommands::Apply { file } => {
            let raw = tokio::fs::read(&file).await?;
            let roles: Vec<AclRole> = serde_json::from_slice(&raw)?;
            let index = client.upsert_acl_roles(&roles).await?;
            print_index(index, output, &format!("Applied {} role(s)", roles.len()))?;
        }
    }
    Ok(())
}

async fn handle_login(
    client: &ApiClient,
    method: &str,
    callback_addr: SocketAddr,
    timeout: Duration,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let secret = client
        .login(method, callback_addr, timeout, &cancel, |url| {
            eprintln!("Complete the login with your identity provider by visiting:\n");
            eprintln!("    {}\n", url);
            eprintln!("Waiting for the provider to redirect back...");
        })
        .await?;

    match output {
        OutputFormat::Json => {
            let out = LoginOutput { secret_id: secret };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Successfully logged in via {}", method);
            println!("Secret ID = {}", secret);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Agent(agent_args) => {
            run_agent(agent_args).await?;
        }
        Commands::AuthMethod { client: args, command } => {
            let api = client(&args)?;
            handle_auth_method(&api, command, &args.output).await?;
        }
        Commands::Role { client: args, command } => {
            let api = client(&args)?;
            handle_role(&api, command, &args.output).await?;
        }
        Commands::Login {
            client: args,
            method,
            callback_addr,
            timeout,
        } => {
            let api = client(&args)?;
            handle_login(&api, &method, callback_addr, timeout, &args.output).await?;
        }
    }

    Ok(())
}
