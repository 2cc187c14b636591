//! Locator node and lookup client.
//!
//! `serve` runs a responder: it answers multicast queries from a registry
//! populated on the command line and hosts the directory RPC service on an
//! iroh endpoint. The other subcommands are one-shot lookups.
//!
//! Entity lookups ping candidate endpoints over iroh, so only adapters whose
//! endpoint is an iroh endpoint descriptor can be found live. A node started
//! with `--host` registers its own descriptor under `--node-adapter`, which
//! defaults to the instance name.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- serve --adapter Printer=tcp://10.0.0.5:4000 --replica Hello:H1=tcp://10.0.0.6:4000
//! cargo run -- serve --host hello --node-adapter Hello
//! cargo run -- lookup-entity hello
//! cargo run -- lookup-adapter Printer
//! cargo run -- directories --wait-ms 500
//! ```
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use iroh::{Endpoint, RelayMode};
use tokio::time::Duration;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iroh_locator::{
    bind_channels, endpoint_descriptor, serve_rpc, DirectoryConfig, DirectoryResolver, Endpoints,
    Identity, IrohRpc, Locator, LocatorConfig, MulticastConfig, MulticastListener, Registry,
    Responder, ResponderConfig, RpcService, UdpChannel, LOCATOR_ALPN,
};

/// Multicast discovery of adapters, objects and directory services.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Multicast group address
    #[arg(long, global = true, default_value_t = iroh_locator::config::DEFAULT_MULTICAST_ADDR)]
    multicast_addr: Ipv4Addr,
    /// Multicast group port
    #[arg(long, global = true, default_value_t = iroh_locator::config::DEFAULT_MULTICAST_PORT)]
    port: u16,
    /// Local interface to use; repeat for several interfaces
    #[arg(long = "interface", global = true)]
    interfaces: Vec<Ipv4Addr>,
    /// Per-round query timeout in milliseconds
    #[arg(long, global = true, default_value_t = 300)]
    timeout_ms: u64,
    /// Rebroadcasts after the first round
    #[arg(long, global = true, default_value_t = iroh_locator::config::DEFAULT_RETRY_COUNT)]
    retries: u32,
    /// Replica merge window as a multiple of the first reply's latency
    #[arg(long, global = true, default_value_t = 1)]
    latency_multiplier: u32,
    /// Discovery domain; nodes in other domains are ignored
    #[arg(long, global = true, default_value = "")]
    domain: String,
    /// Directory service instance name
    #[arg(long, global = true)]
    instance: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer queries and host the directory service
    Serve {
        /// Adapter to register, as NAME=ENDPOINT
        #[arg(long = "adapter")]
        adapters: Vec<String>,
        /// Replica group member, as GROUP:ADAPTER=ENDPOINT
        #[arg(long = "replica")]
        replicas: Vec<String>,
        /// Object identity this node answers liveness probes for
        #[arg(long = "host")]
        hosted: Vec<String>,
        /// Adapter name for this node's own endpoint, registered when it hosts identities
        #[arg(long)]
        node_adapter: Option<String>,
    },
    /// Resolve an adapter or replica group by multicast
    LookupAdapter { name: String },
    /// Resolve a well-known object by multicast
    LookupEntity {
        name: String,
        #[arg(long, default_value = "")]
        category: String,
    },
    /// List every directory service that answers
    Directories {
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },
    /// Ask the directory service for an adapter
    FindAdapter { name: String },
}

impl CommonArgs {
    fn multicast(&self) -> MulticastConfig {
        let mut config = MulticastConfig {
            address: self.multicast_addr,
            port: self.port,
            ..MulticastConfig::default()
        };
        if !self.interfaces.is_empty() {
            config.interfaces = self.interfaces.clone();
        }
        config
    }

    fn locator(&self) -> LocatorConfig {
        LocatorConfig {
            domain_id: self.domain.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            retry_count: self.retries,
            latency_multiplier: self.latency_multiplier,
        }
    }

    fn directory(&self) -> Result<DirectoryConfig> {
        let config = DirectoryConfig {
            instance_name: self.instance.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            retry_count: self.retries,
            ..DirectoryConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn instance_name(&self) -> String {
        self.instance
            .clone()
            .unwrap_or_else(|| ResponderConfig::default().instance_name)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let multicast = cli.common.multicast();
    multicast.validate()?;

    match cli.command {
        Command::Serve {
            adapters,
            replicas,
            hosted,
            node_adapter,
        } => {
            let node_adapter = node_adapter.unwrap_or_else(|| cli.common.instance_name());
            serve(&cli.common, &multicast, adapters, replicas, hosted, node_adapter).await
        }
        Command::LookupAdapter { name } => {
            let locator = open_locator(&cli.common, &multicast)?;
            let endpoints = locator.resolve_adapter(&name).await?;
            println!("{name}: {endpoints}");
            Ok(())
        }
        Command::LookupEntity { name, category } => {
            let locator = open_locator(&cli.common, &multicast)?;
            let identity = Identity::with_category(category, name);
            let endpoints = locator.resolve_entity(&identity).await?;
            println!("{identity}: {endpoints}");
            Ok(())
        }
        Command::Directories { wait_ms } => {
            let locator = open_locator(&cli.common, &multicast)?;
            let instance = cli.common.instance.clone().unwrap_or_default();
            let found = locator
                .resolve_directory(&instance, Duration::from_millis(wait_ms))
                .await;
            if found.is_empty() {
                println!("no directory service answered");
            }
            for reference in found {
                println!("{}: {}", reference.instance_name, reference.endpoints);
            }
            Ok(())
        }
        Command::FindAdapter { name } => {
            let config = cli.common.directory()?;
            let locator = open_locator(&cli.common, &multicast)?;
            let endpoint = bind_endpoint().await?;
            let resolver = DirectoryResolver::new(locator, IrohRpc { endpoint }, config);
            let (endpoints, is_replica_group) = resolver.find_adapter(&name).await?;
            let kind = if is_replica_group {
                "replica group"
            } else {
                "adapter"
            };
            println!("{name} ({kind}): {endpoints}");
            Ok(())
        }
    }
}

async fn bind_endpoint() -> Result<Endpoint> {
    Endpoint::builder()
        .alpns(vec![LOCATOR_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await
        .map_err(|err| anyhow!("failed to bind iroh endpoint: {err}"))
}

/// Bind one channel per interface and start routing replies to a new locator.
fn open_locator(common: &CommonArgs, multicast: &MulticastConfig) -> Result<Locator<UdpChannel>> {
    let config = common.locator();
    config.validate()?;
    let channels = bind_channels(multicast.group(), &multicast.interfaces)?;
    let locator = Locator::new(config, channels);
    for channel in locator.channels() {
        channel.spawn_reply_loop(locator.downgrade());
    }
    Ok(locator)
}

async fn serve(
    common: &CommonArgs,
    multicast: &MulticastConfig,
    adapters: Vec<String>,
    replicas: Vec<String>,
    hosted: Vec<String>,
    node_adapter: String,
) -> Result<()> {
    let endpoint = bind_endpoint().await?;
    let descriptor = endpoint_descriptor(&endpoint.addr())?;
    let probe = IrohRpc {
        endpoint: endpoint.clone(),
    };

    let registry = Arc::new(Registry::new());
    let node = (!hosted.is_empty()).then(|| (node_adapter.as_str(), descriptor.clone()));
    populate_registry(&registry, &adapters, &replicas, node).await?;

    let service = Arc::new(RpcService::new(registry.clone(), probe.clone()));
    for name in hosted {
        service.host(Identity::new(name)).await;
    }
    let _router = serve_rpc(endpoint.clone(), service.spawn());

    let mut directory_endpoints = Endpoints::new();
    directory_endpoints.insert(descriptor);
    let config = ResponderConfig {
        domain_id: common.domain.clone(),
        instance_name: common.instance_name(),
        directory_endpoints,
    };

    info!(
        instance = %config.instance_name,
        group = %multicast.group(),
        adapters = registry.adapter_names().await.len(),
        replica_groups = registry.replica_group_names().await.len(),
        "locator responder started"
    );

    let listener = MulticastListener::bind(multicast.group(), &multicast.interfaces)?;
    let responder = Arc::new(Responder::new(config, registry, probe));
    responder.serve(listener).await
}

/// Register the command line adapters and replica members, plus this node's
/// own endpoint when it hosts identities.
async fn populate_registry(
    registry: &Registry,
    adapters: &[String],
    replicas: &[String],
    node: Option<(&str, String)>,
) -> Result<()> {
    for arg in adapters {
        let (name, endpoint) = parse_adapter(arg)?;
        registry
            .register_adapter(name, std::iter::once(endpoint).collect())
            .await;
    }
    for arg in replicas {
        let (group, rest) = arg
            .split_once(':')
            .with_context(|| format!("replica {arg:?} is not GROUP:ADAPTER=ENDPOINT"))?;
        let (name, endpoint) = parse_adapter(rest)?;
        registry
            .register_replicated_adapter(name, group, std::iter::once(endpoint).collect())
            .await;
    }
    if let Some((name, descriptor)) = node {
        info!(adapter = name, "registering this node for its hosted identities");
        registry
            .register_adapter(name, std::iter::once(descriptor).collect())
            .await;
    }
    Ok(())
}

fn parse_adapter(arg: &str) -> Result<(&str, String)> {
    let (name, endpoint) = arg
        .split_once('=')
        .with_context(|| format!("adapter {arg:?} is not NAME=ENDPOINT"))?;
    if name.is_empty() || endpoint.is_empty() {
        return Err(anyhow!("adapter {arg:?} is not NAME=ENDPOINT"));
    }
    Ok((name, endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("iroh-locator").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn zero_directory_timeout_is_rejected() {
        let cli = parse(&["--timeout-ms", "0", "find-adapter", "A1"]);
        assert!(cli.common.directory().is_err());

        let cli = parse(&["--timeout-ms", "50", "find-adapter", "A1"]);
        let config = cli.common.directory().expect("valid");
        assert_eq!(config.timeout, Duration::from_millis(50));
    }

    #[test]
    fn node_adapter_defaults_to_the_instance_name() {
        let cli = parse(&["serve", "--host", "hello"]);
        assert_eq!(cli.common.instance_name(), "Locator");

        let cli = parse(&["--instance", "Dir", "serve"]);
        assert_eq!(cli.common.instance_name(), "Dir");
    }

    #[tokio::test]
    async fn hosting_node_is_registered_as_an_adapter() {
        let descriptor = r#"{"id":"node"}"#.to_string();
        let registry = Registry::new();
        populate_registry(
            &registry,
            &["Printer=tcp://10.0.0.5:4000".to_string()],
            &["Hello:H1=tcp://10.0.0.6:4000".to_string()],
            Some(("Node", descriptor.clone())),
        )
        .await
        .expect("registered");

        let (found, is_group) = registry.lookup_adapter("Node").await.expect("node adapter");
        assert_eq!(found, std::iter::once(descriptor).collect::<Endpoints>());
        assert!(!is_group);
        assert!(registry.lookup_adapter("Printer").await.is_some());
        let (_, is_group) = registry.lookup_adapter("Hello").await.expect("group");
        assert!(is_group);
    }

    #[tokio::test]
    async fn node_without_hosted_identities_is_not_registered() {
        let registry = Registry::new();
        populate_registry(&registry, &[], &[], None)
            .await
            .expect("registered");
        assert!(registry.adapter_names().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_adapter_is_rejected() {
        let registry = Registry::new();
        let err = populate_registry(&registry, &["Printer".to_string()], &[], None).await;
        assert!(err.is_err());
    }
}
