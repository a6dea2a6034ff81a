//! Drive one storage object on two simulated SPs through quiesce/unquiesce
//! cycles, with the non-paged record persisted under `--workdir`.
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use storage_object::config::StorageObjectConf;
use storage_object::control_file::FileStorage;
use storage_object::metadata_memory::QuiesceState;
use storage_object::monitor::{self, ObjectMonitorCtl};
use storage_object::nonpaged::NonPagedState;
use storage_object::object::StorageObject;
use storage_object::sim::{SimCluster, SimMetadata, SimSp};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::logging;

#[derive(Parser)]
#[command(about = "Quiesce and unquiesce a storage object on simulated SPs")]
struct Args {
    /// JSON object config; flags below override it.
    #[arg(long, value_name = "FILE")]
    config: Option<Utf8PathBuf>,
    #[arg(long, default_value = "plain")]
    log_format: String,
    /// Where the non-paged control files live.
    #[arg(long)]
    workdir: Option<Utf8PathBuf>,
    #[arg(long, default_value_t = 3)]
    cycles: u32,
    /// Run a single SP.
    #[arg(long, default_value = "false")]
    no_peer: bool,
    #[arg(long, default_value = "false")]
    no_sync: bool,
}

type Object = StorageObject<SimMetadata<FileStorage>>;

struct RunningSp {
    name: &'static str,
    object: Arc<Object>,
    ctl: ObjectMonitorCtl,
    task: JoinHandle<()>,
}

fn spawn_monitor(
    name: &'static str,
    sp: SimSp<FileStorage>,
    conf: &StorageObjectConf,
    cancel: &CancellationToken,
) -> anyhow::Result<RunningSp> {
    let SimSp {
        object,
        cmi,
        updates,
        ..
    } = sp;
    let ctl = ObjectMonitorCtl::new();
    let rx = ctl
        .bootstrap_monitor()
        .context("monitor already bootstrapped")?;
    let task = tokio::spawn(monitor::main_task(
        Arc::clone(&object),
        updates,
        cmi,
        conf.monitor_interval,
        cancel.clone(),
        rx,
    ));
    Ok(RunningSp {
        name,
        object,
        ctl,
        task,
    })
}

async fn open_storage(conf: &StorageObjectConf, sp: &str) -> anyhow::Result<FileStorage> {
    let mut sp_conf = conf.clone();
    sp_conf.workdir = conf.workdir.join(sp);
    let dir = sp_conf.object_dir();
    FileStorage::open(&dir, conf.nonpaged_data_size, conf.no_sync)
        .await
        .with_context(|| format!("failed to open non-paged storage of {sp} in {dir}"))
}

/// Give a new object its signature and mark it initialized.
async fn initialize_nonpaged(object: &Object) -> anyhow::Result<()> {
    if object.is_metadata_initialized() {
        info!("non-paged metadata already initialized");
        return Ok(());
    }
    let lock = object.acquire_np_lock().await?;
    let res = async {
        object.set_default_nonpaged_metadata().await?;
        object
            .set_nonpaged_metadata_state(NonPagedState::Initialized)
            .await
    }
    .await;
    lock.release().await;
    res?;
    info!("non-paged metadata initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(logging::LogFormat::from_config(&args.log_format)?)?;
    let _panic_hook_guard = logging::replace_panic_hook_with_tracing_panic_hook();

    let mut conf = match &args.config {
        Some(path) => {
            info!("Reading config from {path}");
            StorageObjectConf::from_json_file(path)?
        }
        None => StorageObjectConf::default(),
    };
    if let Some(workdir) = args.workdir {
        conf.workdir = workdir;
    }
    conf.no_sync |= args.no_sync;
    // quiesce is held across write-verify until the cycle unquiesces
    conf.user_initiated_quiesce = true;

    let cancel = CancellationToken::new();
    let mut sps = Vec::new();
    if args.no_peer {
        let storage = open_storage(&conf, "sp-a").await?;
        let sp = SimSp::build(&conf, SimMetadata::<FileStorage>::new(), storage)?;
        sp.object.join();
        sps.push(spawn_monitor("sp-a", sp, &conf, &cancel)?);
    } else {
        let (ma, mb) = SimMetadata::<FileStorage>::pair();
        let a = SimSp::build(&conf, ma, open_storage(&conf, "sp-a").await?)?;
        let b = SimSp::build(&conf, mb, open_storage(&conf, "sp-b").await?)?;
        let mut cluster = SimCluster::connect(a, b);
        cluster.join();
        let SimCluster { a, b } = cluster;
        sps.push(spawn_monitor("sp-a", a, &conf, &cancel)?);
        sps.push(spawn_monitor("sp-b", b, &conf, &cancel)?);
    }

    let leader = &sps[0];
    initialize_nonpaged(&leader.object).await?;
    for sp in &sps[1..] {
        // the peer got the record through mirroring, make it durable there too
        sp.object.nonpaged_persist().await?;
    }

    for cycle in 1..=args.cycles {
        let started = Instant::now();
        leader.ctl.quiesce(false).await?;
        info!(
            "cycle {cycle}: quiesced in {}",
            humantime::format_duration(started.elapsed())
        );

        let verify = leader.object.nonpaged_write_verify().await;
        if !verify.success {
            warn!("cycle {cycle}: write verify failed, retryable {}", verify.retryable);
        }
        leader.object.set_last_io_time(u64::from(cycle));

        leader.ctl.unquiesce().await?;
        for sp in &sps[1..] {
            while sp.object.quiesce_state() != QuiesceState::NotStarted {
                tokio::time::sleep(conf.monitor_interval).await;
            }
        }
        let snapshots =
            futures::future::try_join_all(sps.iter().map(|sp| sp.ctl.snapshot())).await?;
        for (sp, snapshot) in sps.iter().zip(snapshots) {
            info!(
                "cycle {cycle}: {} {}",
                sp.name,
                serde_json::to_string(&snapshot)?
            );
        }
        info!(
            "cycle {cycle}: done in {}",
            humantime::format_duration(started.elapsed())
        );
    }

    cancel.cancel();
    for sp in sps {
        if let Err(e) = sp.task.await {
            warn!("{} monitor task failed: {e:?}", sp.name);
        }
    }
    Ok(())
}
