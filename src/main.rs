// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use client::{
    property::VSphereConnector,
    session::test_connect,
    source::{SessionPolicy, VSphereSource},
    Timeouts,
};
use config::{settings, VmigrateConfig};
use dal::Store;
use models::{
    inventory::{Host, Inventory, Kind, Page, Ref, Vm},
    migration::Phase,
    plan::Plan,
    provider::Provider,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use workflows::{
    analyzer,
    builder::converter_transfers,
    collector::{Collector, CollectorError},
    conversion::CommandConverter,
    destination::LocalDestination,
    mover::CommandMover,
    orchestrator::{Endpoints, Migrator, PlanRunner, Settings},
    validator,
};

#[derive(Parser, Debug)]
#[command(name = "vmigrate", author, version, about = "Migrates vSphere VMs into a KubeVirt cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate every VM of a plan
    Run {
        #[arg(long)]
        plan: PathBuf,
    },

    /// Check a plan against the current inventory without migrating anything
    Validate {
        #[arg(long)]
        plan: PathBuf,
    },

    /// List the VMs of the inventory, read from a snapshot file or synced live
    Inventory {
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Log in to the provider and out again
    TestConnect,
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt::fmt().pretty();

    let subscriber = subscriber.with_max_level(settings().logging.max_level);

    if let Some(output_file) = settings().logging.log_file.clone() {
        let file = std::fs::File::create(&output_file).expect("couldn't open log file");
        let file = std::sync::Mutex::new(file);

        let subscriber = subscriber.with_writer(file).finish();

        tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");
    } else {
        let subscriber = subscriber.finish();

        tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");
    };

    tracing::info!("tracing has been started");
}

fn load_provider(cfg: &VmigrateConfig) -> anyhow::Result<Provider> {
    let path = &cfg.provider.secret_file;
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("couldn't read provider secret {}", path.display()))?;
    let secret: BTreeMap<String, String> =
        serde_yaml::from_str(&body).with_context(|| format!("invalid provider secret {}", path.display()))?;

    Ok(Provider::from_settings(&cfg.provider, &secret)?)
}

fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let body = std::fs::read_to_string(path).with_context(|| format!("couldn't read plan {}", path.display()))?;
    serde_yaml::from_str(&body).with_context(|| format!("invalid plan {}", path.display()))
}

struct InventorySync {
    collector: Arc<Collector>,
    handle: JoinHandle<Result<(), CollectorError>>,
    cancel: CancellationToken,
}

impl InventorySync {
    /// Starts the collector and waits for the first full pass
    async fn start(cfg: &VmigrateConfig, provider: &Provider) -> anyhow::Result<Self> {
        let connector = VSphereConnector::new(
            provider.clone(),
            Timeouts::from_settings(&cfg.migration),
            cfg.collector.max_object_updates,
        );
        let collector = Arc::new(Collector::new(
            Arc::new(Store::new()),
            Arc::new(connector),
            cfg.collector.clone(),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let collector = collector.clone();
            let cancel = cancel.clone();
            async move { collector.run(cancel).await }
        });

        let mut sync = Self {
            collector,
            handle,
            cancel,
        };

        tokio::select! {
            _ = sync.collector.wait_for_parity() => {}
            r = &mut sync.handle => {
                r.context("collector panicked")??;
                bail!("collector stopped before reaching parity");
            }
        }
        tracing::info!("Inventory of {} in sync", provider.name);

        Ok(sync)
    }

    fn store(&self) -> Arc<Store> {
        self.collector.store().clone()
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        Ok(self.handle.await.context("collector panicked")??)
    }
}

fn host_thumbprints(store: &Store) -> HashMap<String, String> {
    let view = store.snapshot();
    Inventory::new(&view)
        .list::<Host, _>(|h| !h.thumbprint.is_empty(), Page::default())
        .map(|h| (h.id, h.thumbprint))
        .collect()
}

async fn run(cfg: &VmigrateConfig, plan_file: &Path) -> anyhow::Result<()> {
    let plan = load_plan(plan_file)?;
    let provider = load_provider(cfg)?;
    let sync = InventorySync::start(cfg, &provider).await?;
    let store = sync.store();

    let timeouts = Timeouts::from_settings(&cfg.migration);
    let local = cfg.destination.local;
    let policy = SessionPolicy {
        converter_transfers: converter_transfers(&plan, local),
        cold_local: !plan.warm && local,
        esxi: provider.is_esxi(),
    };
    // built before the source session so a failure here leaves nothing logged in
    let destination = Arc::new(LocalDestination::from_settings(&cfg.destination).await?);
    let source = VSphereSource::connect(
        provider.clone(),
        timeouts,
        policy,
        plan.host_overrides.clone(),
        host_thumbprints(&store),
    )
    .await
    .context("couldn't connect to the provider")?;
    let fingerprint = source
        .fingerprint()
        .map(str::to_owned)
        .or_else(|| provider.credentials.thumbprint.clone())
        .unwrap_or_default();

    let endpoints = Endpoints {
        source: Arc::new(source),
        destination,
        mover: Arc::new(CommandMover::new(&cfg.mover)),
        converter: Arc::new(CommandConverter::new(&cfg.conversion)),
    };

    let runner = Arc::new(PlanRunner::new(Migrator::new(
        plan,
        provider,
        fingerprint,
        store,
        endpoints,
        Settings::from(cfg),
    )));

    tokio::spawn(interrupts(runner.clone()));

    let results = runner.run().await;

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(status) => {
                println!("{}: {}", status.vm, status.phase);
                if status.phase != Phase::Completed {
                    failed += 1;
                }
            }
            Err(e) => {
                println!("task error: {e:?}");
                failed += 1;
            }
        }
    }

    sync.stop().await?;

    if failed > 0 {
        bail!("{failed} of {} migrations did not complete", results.len());
    }
    Ok(())
}

/// The first interrupt cancels the plan cleanly, the second stops it dead.
/// SIGUSR1 requests cutover of warm migrations.
async fn interrupts(runner: Arc<PlanRunner>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut usr1) = signal(SignalKind::user_defined1()) {
            let runner = runner.clone();
            tokio::spawn(async move {
                while usr1.recv().await.is_some() {
                    runner.cutover();
                }
            });
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupted, cancelling the plan");
        runner.cancel();
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::error!("Interrupted again, aborting");
        runner.abort();
    }
}

async fn validate(cfg: &VmigrateConfig, plan_file: &Path) -> anyhow::Result<()> {
    let plan = load_plan(plan_file)?;
    let provider = load_provider(cfg)?;
    let sync = InventorySync::start(cfg, &provider).await?;

    let destination = LocalDestination::from_settings(&cfg.destination).await?;
    let view = sync.store().snapshot();
    let mut report = validator::validate_plan(&plan, &view, &destination).await?;
    report
        .checks
        .push(validator::provider_connection(&provider, Timeouts::from_settings(&cfg.migration)).await);

    for check in report.checks.iter().filter(|c| !c.ok) {
        println!(
            "{:<10} {:<28} {}",
            check.vm.as_deref().unwrap_or("-"),
            check.reason.condition(),
            check.message
        );
    }

    sync.stop().await?;

    let blocking = report.blocking().count();
    if blocking > 0 {
        bail!("plan {} has {blocking} blocking problems", plan.name);
    }
    println!("plan {} is ready", plan.name);
    Ok(())
}

async fn inventory(cfg: &VmigrateConfig, snapshot: Option<&Path>) -> anyhow::Result<()> {
    let (store, sync) = match snapshot {
        Some(path) => (
            Arc::new(Store::load_snapshot(path).with_context(|| format!("couldn't load {}", path.display()))?),
            None,
        ),
        None => {
            let sync = InventorySync::start(cfg, &load_provider(cfg)?).await?;
            (sync.store(), Some(sync))
        }
    };

    let view = store.snapshot();
    let inventory = Inventory::new(&view);
    for vm in inventory.list::<Vm, _>(|_| true, Page::default()) {
        let path = inventory
            .path(&Ref::new(Kind::Vm, vm.id.clone()))
            .unwrap_or_else(|_| vm.name.clone());
        let concerns = analyzer::concerns(&vm);
        println!(
            "{:<12} {:<12} {:>3} concerns  {}",
            vm.id,
            vm.power_state,
            concerns.len(),
            path
        );
    }

    if let Some(sync) = sync {
        sync.stop().await?;
    }
    Ok(())
}

async fn connect(cfg: &VmigrateConfig) -> anyhow::Result<()> {
    let provider = load_provider(cfg)?;
    test_connect(&provider.url, &provider.credentials, Timeouts::from_settings(&cfg.migration))
        .await
        .with_context(|| format!("couldn't connect to {}", provider.url))?;
    println!("connected to {}", provider.url);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing();

    let cfg = settings();
    match cli.command {
        Command::Run { plan } => run(cfg, &plan).await,
        Command::Validate { plan } => validate(cfg, &plan).await,
        Command::Inventory { snapshot } => inventory(cfg, snapshot.as_deref()).await,
        Command::TestConnect => connect(cfg).await,
    }
}
