use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use nimbus::{Config, NimbusError, NimbusOrchestrator, NimbusResult};
use nimbus_core::catalog::{Catalog, CatalogFile};
use nimbus_core::ledger::{BillingService, Ledger};
use nimbus_core::storage::Store;
use rust_decimal::Decimal;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Cloud VM billing and provisioning daemon", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log output format ("pretty" or "json")
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the daemon until Ctrl-C
    Run {
        /// Use the in-process mock control plane
        #[arg(long)]
        mock: bool,
    },
    /// Validate a configuration file
    CheckConfig,
    /// Wallet operations (the daemon must not be running)
    Wallet {
        #[command(subcommand)]
        command: WalletCommands,
    },
    /// Product catalog operations (the daemon must not be running)
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(clap::Subcommand)]
enum WalletCommands {
    /// Credit a user's wallet
    Recharge {
        #[arg(long)]
        user: u64,
        #[arg(long)]
        amount: String,
    },
    /// Show balance and recent ledger entries
    Show {
        #[arg(long)]
        user: u64,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[derive(clap::Subcommand)]
enum CatalogCommands {
    /// Load products and prices from a TOML catalog
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// List products
    List,
}

#[tokio::main]
async fn main() -> NimbusResult<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(dir) = &cli.data_dir {
        config.node.data_dir = dir.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    if let Commands::Run { mock: true } = cli.command {
        config.node.control_plane = "mock".to_string();
    }

    init_logging(&config)?;

    match cli.command {
        Commands::Run { .. } => run(config).await,
        Commands::CheckConfig => {
            config.validate()?;
            println!("configuration OK");
            println!("  data_dir:      {}", config.node.data_dir.display());
            println!("  control_plane: {}", config.node.control_plane);
            println!("  hourly_rate:   {}", config.billing.hourly_rate);
            Ok(())
        }
        Commands::Wallet { command } => wallet(config, command).await,
        Commands::Catalog { command } => catalog(config, command).await,
    }
}

fn init_logging(config: &Config) -> NimbusResult<()> {
    let directive = |target: &str| -> NimbusResult<Directive> {
        format!("{}={}", target, config.logging.level)
            .parse()
            .map_err(|e| NimbusError::configuration("logging", format!("Invalid log directive: {}", e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(directive("nimbus")?)
        .add_directive(directive("nimbus_core")?)
        .add_directive(directive("nimbus_capability")?);

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

async fn run(config: Config) -> NimbusResult<()> {
    let mut orchestrator = NimbusOrchestrator::new(config)?;
    orchestrator.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");

    orchestrator.stop().await;
    Ok(())
}

async fn wallet(config: Config, command: WalletCommands) -> NimbusResult<()> {
    let store = Store::open(&config.node.data_dir)?;
    let billing = BillingService::new(store.clone(), Ledger::new(store), config.billing.min_recharge);

    match command {
        WalletCommands::Recharge { user, amount } => {
            let amount = Decimal::from_str(&amount)?;
            let entry = billing.recharge(user, amount).await?;
            println!("user {} balance is now {}", user, entry.balance_after);
        }
        WalletCommands::Show { user, limit } => {
            let wallet = billing.wallet(user).await?;
            println!("user {} balance {}", user, wallet.balance);
            for entry in billing.entries(user, None, None).await?.into_iter().take(limit) {
                println!(
                    "  {}  {:>10}  {:<8}  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.delta,
                    entry.kind,
                    entry.remark
                );
            }
        }
    }
    Ok(())
}

async fn catalog(config: Config, command: CatalogCommands) -> NimbusResult<()> {
    let catalog = Catalog::new(Store::open(&config.node.data_dir)?);

    match command {
        CatalogCommands::Import { file } => {
            let products = catalog.import(&CatalogFile::from_file(&file)?).await?;
            println!("imported {} products from {}", products.len(), file.display());
        }
        CatalogCommands::List => {
            for product in catalog.products().await? {
                let prices: Vec<String> = product
                    .prices
                    .iter()
                    .map(|p| format!("{}/{}", p.unit_price, p.billing_cycle))
                    .collect();
                println!(
                    "{:>4}  {:<20} {}c/{}G/{}G  {:?}  {}",
                    product.id,
                    product.name,
                    product.cpu,
                    product.memory_gb,
                    product.disk_gb,
                    product.status,
                    prices.join(", ")
                );
            }
        }
    }
    Ok(())
}
