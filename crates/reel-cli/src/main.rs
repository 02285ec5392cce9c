use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, Instant, sleep};
use tracing_subscriber::EnvFilter;

use reel_core::app::{
    Scheduler, SchedulerBuilder, SchedulerConfig, TaskStatistics, WorkerStatistics,
};
use reel_core::domain::{
    EncodeConfig, HlsConfig, HlsSegment, LoadSnapshot, NewTask, RenditionSpec, SchedulerError,
    TaskId, WorkerId,
};
use reel_core::impls::{ChannelNotifier, InMemoryTaskStore, InMemoryWorkerStore};
use reel_core::ports::Assignment;

#[derive(Parser, Debug)]
#[command(name = "reel")]
#[command(version)]
#[command(about = "Task scheduler for a distributed transcoding fleet")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the assign, expiry and retry loops until Ctrl-C
    Run {
        /// TOML configuration; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Push a few tasks through simulated workers and print the statistics
    Demo {
        #[arg(long, default_value_t = 2)]
        workers: u32,

        /// Plain tasks to submit (one HLS task is always added)
        #[arg(long, default_value_t = 4)]
        tasks: u32,

        /// Jobs the first worker fails before it starts succeeding
        #[arg(long, default_value_t = 1)]
        failures: u32,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Load and validate a configuration file
    CheckConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), SchedulerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reel_core=debug")),
        )
        .init();

    match Args::parse().command {
        Commands::Run { config } => run(config).await,
        Commands::Demo {
            workers,
            tasks,
            failures,
            timeout_secs,
        } => demo(workers, tasks, failures, Duration::from_secs(timeout_secs)).await,
        Commands::CheckConfig { path } => {
            let config = SchedulerConfig::load(&path)?;
            config.validate()?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

async fn run(config: Option<PathBuf>) -> Result<(), SchedulerError> {
    let config = match config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };
    let grace = config.shutdown_grace();

    let app = SchedulerBuilder::new()
        .config(config)
        .task_store(Arc::new(InMemoryTaskStore::new()))
        .worker_store(Arc::new(InMemoryWorkerStore::new()))
        .build()?;
    let handle = app.spawn();
    tracing::info!("scheduler running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for Ctrl-C, shutting down");
    }
    tracing::info!(?grace, "shutting down");
    if tokio::time::timeout(grace, handle.shutdown_and_join())
        .await
        .is_err()
    {
        tracing::warn!(?grace, "loops did not stop within the grace period");
    }
    Ok(())
}

// ---- demo ----

/// The transcoding engine as a worker sees it.
#[async_trait]
trait Transcoder: Send + Sync {
    /// Encodes one rendition and returns how many segments were written.
    async fn transcode(&self, source: &str, rendition: &str) -> Result<u32, String>;
}

struct SimulatedEncoder {
    remaining_failures: AtomicU32,
    per_job: Duration,
}

impl SimulatedEncoder {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            per_job: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl Transcoder for SimulatedEncoder {
    async fn transcode(&self, source: &str, rendition: &str) -> Result<u32, String> {
        sleep(self.per_job).await;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!(
                "simulated encoder crash on {source} ({rendition}), {left} left"
            ));
        }
        Ok(3)
    }
}

#[derive(Serialize)]
struct DemoSummary {
    tasks: TaskStatistics,
    workers: WorkerStatistics,
    master_playlist: Option<String>,
}

async fn demo(
    workers: u32,
    tasks: u32,
    failures: u32,
    timeout: Duration,
) -> Result<(), SchedulerError> {
    let mut config = SchedulerConfig::default();
    config.loops.assign_interval_secs = 1;
    config.loops.retry_interval_secs = 1;
    config.loops.expiry_interval_secs = 5;
    config.backoff.base_delay_secs = 1;
    config.backoff.max_delay_secs = 5;

    let notifier = Arc::new(ChannelNotifier::new());
    let app = SchedulerBuilder::new()
        .config(config)
        .task_store(Arc::new(InMemoryTaskStore::new()))
        .worker_store(Arc::new(InMemoryWorkerStore::new()))
        .notifier(notifier.clone())
        .build()?;
    let scheduler = app.scheduler.clone();

    let mut fleet = Vec::new();
    for n in 0..workers {
        let id = WorkerId::new(format!("sim-{n}"));
        scheduler
            .register_worker(id.clone(), format!("simulated encoder {n}"), 1)
            .await?;
        let inbox = notifier.subscribe(id.clone());
        let encoder: Arc<dyn Transcoder> =
            Arc::new(SimulatedEncoder::new(if n == 0 { failures } else { 0 }));
        fleet.push(tokio::spawn(simulated_worker(
            scheduler.clone(),
            id,
            inbox,
            encoder,
        )));
    }

    let mut submitted: Vec<TaskId> = Vec::new();
    for n in 0..tasks {
        submitted.push(scheduler.create_task(demo_task(n, false)).await?.id);
    }
    let hls_task = scheduler.create_task(demo_task(tasks, true)).await?.id;
    submitted.push(hls_task);

    let handle = app.spawn();
    let deadline = Instant::now() + timeout;
    loop {
        let mut open = 0;
        for id in &submitted {
            if !scheduler.get_task(*id).await?.task.is_terminal() {
                open += 1;
            }
        }
        if open == 0 {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(open, "demo timed out with unfinished tasks");
            break;
        }
        sleep(Duration::from_millis(250)).await;
    }

    handle.shutdown_and_join().await;
    for worker in fleet {
        worker.abort();
    }

    let summary = DemoSummary {
        tasks: scheduler.task_statistics().await?,
        workers: scheduler.worker_statistics().await?,
        master_playlist: scheduler
            .get_master_playlist(hls_task)
            .await
            .ok()
            .map(|p| p.content),
    };
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "could not render summary"),
    }
    Ok(())
}

fn demo_task(n: u32, hls: bool) -> NewTask {
    NewTask {
        user_id: "demo".into(),
        source: format!("s3://ingest/clip-{n}.mov"),
        output: format!("s3://vod/clip-{n}/"),
        encode: EncodeConfig {
            resolution: "720p".into(),
            bitrate: "2500k".into(),
            codec: "h264".into(),
            preset: Some("veryfast".into()),
            container: (if hls { "ts" } else { "mp4" }).into(),
        },
        priority: (n % 10 + 1) as u8,
        max_retries: None,
        hls: hls.then(|| {
            HlsConfig::new(vec![
                RenditionSpec::new("1080p", "5000k"),
                RenditionSpec::new("720p", "2800k"),
                RenditionSpec::new("480p", "1400k"),
            ])
        }),
        estimated_duration_secs: Some(5),
    }
}

/// worker：通知を受けて報告を返す。ジョブは 1 件ずつ順番に処理する
async fn simulated_worker(
    scheduler: Arc<Scheduler>,
    id: WorkerId,
    mut inbox: UnboundedReceiver<Assignment>,
    encoder: Arc<dyn Transcoder>,
) {
    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            // queued work first, so a heartbeat never reports an idle worker
            // while an assignment is waiting
            biased;
            assignment = inbox.recv() => {
                let Some(assignment) = assignment else {
                    break;
                };
                if let Err(e) = execute(&scheduler, &id, &assignment, encoder.as_ref()).await {
                    if e.is_benign() {
                        tracing::debug!(worker_id = %id, task_id = %assignment.task_id, error = %e, "stale assignment");
                    } else {
                        tracing::warn!(worker_id = %id, task_id = %assignment.task_id, error = %e, "report rejected");
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = scheduler.heartbeat(&id, LoadSnapshot { current_tasks: 0 }).await {
                    tracing::warn!(worker_id = %id, error = %e, "heartbeat failed");
                }
            }
        }
    }
}

async fn execute(
    scheduler: &Scheduler,
    worker: &WorkerId,
    assignment: &Assignment,
    encoder: &dyn Transcoder,
) -> Result<(), SchedulerError> {
    let task = scheduler.report_started(assignment.task_id, worker).await?;

    if !task.is_hls() {
        scheduler.report_progress(task.id, worker, 50).await?;
        match encoder
            .transcode(&assignment.source, &assignment.encode.resolution)
            .await
        {
            Ok(_) => scheduler.report_completed(task.id, worker).await?,
            Err(reason) => scheduler.report_failed(task.id, worker, reason).await?,
        };
        return Ok(());
    }

    for sub in scheduler.list_sub_tasks(task.id).await? {
        scheduler.report_subtask_started(sub.id, worker).await?;
        let segments = match encoder
            .transcode(&assignment.source, &sub.rendition.label)
            .await
        {
            Ok(segments) => segments,
            Err(reason) => {
                // one failed rendition fails the whole task
                scheduler.report_subtask_failed(sub.id, reason).await?;
                return Ok(());
            }
        };

        for index in 0..segments {
            let filename = format!("segment_{}_{index:03}.ts", sub.rendition.label);
            scheduler
                .record_segment(HlsSegment {
                    sub_task_id: sub.id,
                    index,
                    path: format!("{}{filename}", assignment.output),
                    filename,
                    duration_secs: 10.0,
                    size_bytes: 512 * 1024,
                })
                .await?;
            let progress = ((index + 1) * 100 / segments) as u8;
            scheduler.report_subtask_progress(sub.id, progress).await?;
        }
        scheduler
            .report_subtask_completed(
                sub.id,
                format!("{}{}", assignment.output, sub.rendition.media_playlist_name()),
            )
            .await?;
    }
    Ok(())
}
