use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use aliyun_machine::{
    Driver, DriverConfig, Error, ErrorKind, InstanceDescriptor, MachineStore, Result,
};

#[derive(Parser)]
#[command(name = "aliyun-machine", version, about = "Provision a container host on Aliyun ECS")]
struct Cli {
    /// Directory holding machine descriptors and key pairs [default: ~/.aliyun-machine]
    #[arg(long, env = "MACHINE_STORAGE_PATH", global = true)]
    storage_path: Option<PathBuf>,

    /// Machine name
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the security group, instance and key pair
    Create,
    Start,
    Stop {
        #[arg(long)]
        force: bool,
    },
    Restart {
        #[arg(long)]
        force: bool,
    },
    /// Force stop
    Kill,
    /// Delete the instance and any security group created for it
    Remove,
    State,
    Ip,
    Url,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        if e.is_warning() {
            eprintln!("Warning: {e}");
        } else {
            eprintln!("Error: {e}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let root = cli
        .storage_path
        .or_else(MachineStore::default_root)
        .unwrap_or_else(|| PathBuf::from(".aliyun-machine"));
    let store = MachineStore::new(root);
    let config = DriverConfig::from_env()?;

    let stored = store.load(&cli.name).await?;
    let descriptor = match (&cli.command, stored) {
        (_, Some(descriptor)) => descriptor,
        (Command::Create, None) => InstanceDescriptor::from_config(&cli.name, &config),
        (_, None) => return Err(Error::NotFound(format!("machine {}", cli.name))),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let mut driver = Driver::for_ecs(config, descriptor, store.key_path(&cli.name))?
        .with_cancellation(cancel);

    match cli.command {
        Command::Create => {
            let result = driver.create().await;
            // Persist even on failure: rollback errors leave IDs to clean up.
            store.save(driver.descriptor()).await?;
            result?;
            println!("{}", driver.url().await?);
        }
        Command::Start => driver.start().await?,
        Command::Stop { force } => driver.stop(force).await?,
        Command::Restart { force } => driver.restart(force).await?,
        Command::Kill => driver.kill().await?,
        Command::Remove => match driver.remove().await {
            Ok(()) => store.delete(&cli.name).await?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(error = %e, "instance already gone, forgetting machine");
                store.delete(&cli.name).await?;
            }
            Err(e) => {
                store.save(driver.descriptor()).await?;
                return Err(e);
            }
        },
        Command::State => println!("{}", driver.state().await?),
        Command::Ip => println!("{}", driver.ip().await?),
        Command::Url => println!("{}", driver.url().await?),
    }
    Ok(())
}
