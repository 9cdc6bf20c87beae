//! CLI command definitions and dispatch.
//!
//! Exit codes: 0 on success, 1 for configuration or setup errors, 2 for
//! operational errors.

use clap::Subcommand;
use depro_agent::{AgentConfig, Operation as AgentOperation};
use depro_core::shutdown::Shutdown;
use depro_core::Result;
use depro_deploy::{DeployConfig, Operation as DeployOperation, QueryOperation};
use depro_kv::{ConsulStore, KvStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a deployment agent on the local node
    Agent {
        /// JSON configuration file to read; repeatable
        #[arg(long = "config-file", value_name = "FILE")]
        config_file: Vec<PathBuf>,

        /// Directory of JSON configuration files to read; repeatable
        #[arg(long = "config-dir", value_name = "DIR")]
        config_dir: Vec<PathBuf>,

        /// HTTP address of a KV server in the cluster
        #[arg(long)]
        server: Option<String>,
    },

    /// Deploy a version of code to your cluster
    Deploy {
        /// The version to deploy
        version: String,

        /// JSON configuration file to read
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// HTTP address of a KV server in the cluster
        #[arg(long)]
        server: Option<String>,

        /// Key prefix the deployment lives under
        #[arg(long)]
        prefix: Option<String>,

        /// Minimum number of nodes required for the rollout
        #[arg(long)]
        nodes: Option<usize>,
    },

    /// List nodes and their state for the current or a given version
    Query {
        /// The version to inspect; defaults to the currently rolled out one
        version: Option<String>,

        /// JSON configuration file to read
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// HTTP address of a KV server in the cluster
        #[arg(long)]
        server: Option<String>,

        /// Key prefix the deployment lives under
        #[arg(long)]
        prefix: Option<String>,

        /// user:pass credentials for the KV server
        #[arg(long)]
        auth: Option<String>,

        /// ACL token for the KV server
        #[arg(long)]
        token: Option<String>,
    },

    /// Print the build version
    Version,
}

pub async fn run(command: Commands) -> i32 {
    match command {
        Commands::Agent {
            config_file,
            config_dir,
            server,
        } => agent(config_file, config_dir, server).await,
        Commands::Deploy {
            version,
            config,
            server,
            prefix,
            nodes,
        } => deploy(&version, config, server, prefix, nodes).await,
        Commands::Query {
            version,
            config,
            server,
            prefix,
            auth,
            token,
        } => query(version.as_deref().unwrap_or(""), config, server, prefix, auth, token).await,
        Commands::Version => {
            println!("depro v{}", env!("CARGO_PKG_VERSION"));
            0
        }
    }
}

async fn agent(
    config_files: Vec<PathBuf>,
    config_dirs: Vec<PathBuf>,
    server: Option<String>,
) -> i32 {
    let config = match agent_config(config_files, config_dirs, server) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let store: Arc<dyn KvStore> = match ConsulStore::new(&config.common) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let shutdown = Shutdown::install();
    let operation = AgentOperation::new(config, store, shutdown);
    match operation.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Failed to run agent: {}", e);
            2
        }
    }
}

fn agent_config(
    config_files: Vec<PathBuf>,
    config_dirs: Vec<PathBuf>,
    server: Option<String>,
) -> Result<AgentConfig> {
    let mut paths = config_files;
    paths.extend(config_dirs);

    let mut config = AgentConfig::load(&paths)?;
    if let Some(server) = server {
        config.common.server = server;
    }
    config.common.wait_time()?;
    Ok(config)
}

async fn deploy(
    version: &str,
    config: Option<PathBuf>,
    server: Option<String>,
    prefix: Option<String>,
    nodes: Option<usize>,
) -> i32 {
    let config = match DeployConfig::load(config.as_deref()) {
        Ok(mut config) => {
            if let Some(server) = server {
                config.common.server = server;
            }
            if let Some(prefix) = prefix {
                config.common.prefix = prefix;
            }
            if let Some(nodes) = nodes {
                config.nodes = nodes;
            }
            config
        }
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let store: Arc<dyn KvStore> = match ConsulStore::new(&config.common) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let operation = DeployOperation::new(version, config, store);
    match operation.run().await {
        Ok(()) => {
            println!("Version '{}' successfully deployed", version);
            0
        }
        Err(e) => {
            eprintln!("Failed to deploy '{}': {}", version, e);
            2
        }
    }
}

async fn query(
    version: &str,
    config: Option<PathBuf>,
    server: Option<String>,
    prefix: Option<String>,
    auth: Option<String>,
    token: Option<String>,
) -> i32 {
    let config = match DeployConfig::load(config.as_deref()) {
        Ok(mut config) => {
            if let Some(server) = server {
                config.common.server = server;
            }
            if let Some(prefix) = prefix {
                config.common.prefix = prefix;
            }
            if let Some(auth) = auth {
                match auth.split_once(':') {
                    Some((user, pass)) => {
                        config.common.username = user.to_string();
                        config.common.password = pass.to_string();
                    }
                    None => config.common.username = auth,
                }
            }
            if let Some(token) = token {
                config.common.token = token;
            }
            config.common
        }
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let store: Arc<dyn KvStore> = match ConsulStore::new(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let operation = QueryOperation::new(version, config, store);
    match operation.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Failed to query '{}': {}", version, e);
            2
        }
    }
}
