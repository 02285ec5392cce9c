//! HLS model: configuration, per-resolution sub-tasks, segments and playlists.
//!
//! A task with an `HlsConfig` is expanded into one `SubTaskRecord` per
//! rendition when it starts processing. Once every sub-task has completed,
//! the master playlist is rendered from the renditions and their media
//! playlist references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::errors::SchedulerError;
use super::ids::{SubTaskId, TaskId, WorkerId};
use super::state::SubTaskStatus;

const KNOWN_LABELS: [&str; 14] = [
    "2160p", "1440p", "1080p", "720p", "480p", "360p", "240p", "4k", "2k", "1080", "720", "480",
    "360", "240",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HlsFormat {
    #[default]
    Mpegts,
    Fmp4,
}

/// One requested output variant, as written by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenditionSpec {
    /// "720p", "1080", "4K", ...
    pub resolution: String,
    /// "2000k", "2.5m", "800kbps", ... (bare numbers are bits per second)
    pub bitrate: String,
}

impl RenditionSpec {
    pub fn new(resolution: impl Into<String>, bitrate: impl Into<String>) -> Self {
        Self {
            resolution: resolution.into(),
            bitrate: bitrate.into(),
        }
    }
}

/// A resolved rendition: the label plus the numbers that go into manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rendition {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
}

impl Rendition {
    pub fn resolve(spec: &RenditionSpec) -> Result<Self, SchedulerError> {
        let height = parse_height(&spec.resolution)?;
        let bitrate_bps = parse_bitrate_bps(&spec.bitrate)?;
        Ok(Self {
            label: spec.resolution.trim().to_string(),
            width: width_for_height(height),
            height,
            bitrate_bps,
        })
    }

    /// File name of this rendition's media playlist.
    pub fn media_playlist_name(&self) -> String {
        format!("playlist_{}.m3u8", self.label)
    }
}

/// 16:9 width, rounded down to an even number (encoders reject odd widths).
pub fn width_for_height(height: u32) -> u32 {
    let width = height * 16 / 9;
    width - width % 2
}

/// Parses a resolution label into a pixel height.
pub fn parse_height(label: &str) -> Result<u32, SchedulerError> {
    let s = label.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(SchedulerError::Validation("resolution must not be empty".into()));
    }
    if !KNOWN_LABELS.contains(&s.as_str()) {
        return Err(SchedulerError::Validation(format!(
            "unsupported resolution: {label}"
        )));
    }
    match s.as_str() {
        "4k" => Ok(2160),
        "2k" => Ok(1440),
        other => other
            .trim_end_matches('p')
            .parse::<u32>()
            .map_err(|_| SchedulerError::Validation(format!("unsupported resolution: {label}"))),
    }
}

/// Parses a bitrate string into bits per second.
pub fn parse_bitrate_bps(bitrate: &str) -> Result<u64, SchedulerError> {
    let s = bitrate.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(SchedulerError::Validation("bitrate must not be empty".into()));
    }

    let (number, factor) = if let Some(n) = s.strip_suffix("kbps") {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix("mbps") {
        (n, 1_000_000.0)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1_000_000.0)
    } else {
        (s.as_str(), 1.0)
    };

    match number.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok((v * factor) as u64),
        _ => Err(SchedulerError::Validation(format!("invalid bitrate: {bitrate}"))),
    }
}

fn default_segment_duration() -> u32 {
    10
}

/// HLS packaging options attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlsConfig {
    /// Target segment length in seconds (1..=60).
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,

    /// Media playlist window; 0 keeps every segment.
    #[serde(default)]
    pub list_size: u32,

    #[serde(default)]
    pub format: HlsFormat,

    pub renditions: Vec<RenditionSpec>,
}

impl HlsConfig {
    pub fn new(renditions: Vec<RenditionSpec>) -> Self {
        Self {
            segment_duration_secs: default_segment_duration(),
            list_size: 0,
            format: HlsFormat::default(),
            renditions,
        }
    }

    /// Checks the packaging options and resolves every rendition.
    ///
    /// Rejects an empty rendition list, out-of-range segment durations and
    /// duplicate (width, height, bitrate) triples.
    pub fn resolve(&self) -> Result<Vec<Rendition>, SchedulerError> {
        if self.renditions.is_empty() {
            return Err(SchedulerError::Validation(
                "hls requires at least one rendition".into(),
            ));
        }
        if !(1..=60).contains(&self.segment_duration_secs) {
            return Err(SchedulerError::Validation(format!(
                "segment duration must be within 1..=60 seconds, got {}",
                self.segment_duration_secs
            )));
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.renditions.len());
        for (i, spec) in self.renditions.iter().enumerate() {
            let rendition = Rendition::resolve(spec).map_err(|e| match e {
                SchedulerError::Validation(msg) => {
                    SchedulerError::Validation(format!("rendition[{i}]: {msg}"))
                }
                other => other,
            })?;
            if !seen.insert((rendition.width, rendition.height, rendition.bitrate_bps)) {
                return Err(SchedulerError::Validation(format!(
                    "rendition[{i}] duplicates {}x{}@{}",
                    rendition.width, rendition.height, rendition.bitrate_bps
                )));
            }
            resolved.push(rendition);
        }
        Ok(resolved)
    }
}

/// Per-resolution unit of work under an HLS task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskRecord {
    pub id: SubTaskId,
    pub task_id: TaskId,
    /// Parent's `retry_count` when this set was expanded. Each processing
    /// round of the parent gets its own generation.
    pub attempt: u32,
    pub rendition: Rendition,
    pub status: SubTaskStatus,
    pub progress: u8,
    pub error: Option<String>,

    /// Defaults to the parent's worker; overwritten by whoever starts it.
    pub worker_id: Option<WorkerId>,

    /// Reported by the worker on completion.
    pub media_playlist: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Row version for conditional writes. Owned by the store.
    pub version: u64,
}

impl SubTaskRecord {
    pub fn new(
        id: SubTaskId,
        task_id: TaskId,
        attempt: u32,
        rendition: Rendition,
        worker_id: Option<WorkerId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            attempt,
            rendition,
            status: SubTaskStatus::Pending,
            progress: 0,
            error: None,
            worker_id,
            media_playlist: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn start(&mut self, worker_id: WorkerId, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(SubTaskStatus::Processing)?;
        self.status = SubTaskStatus::Processing;
        self.worker_id = Some(worker_id);
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.status != SubTaskStatus::Processing {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.as_str(),
                to: SubTaskStatus::Processing.as_str(),
            });
        }
        self.progress = progress.min(100);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(
        &mut self,
        media_playlist: String,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.status.check_transition(SubTaskStatus::Completed)?;
        self.status = SubTaskStatus::Completed;
        self.progress = 100;
        self.media_playlist = Some(media_playlist);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(SubTaskStatus::Failed)?;
        self.status = SubTaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// One written media segment. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsSegment {
    pub sub_task_id: SubTaskId,
    pub index: u32,
    pub filename: String,
    pub path: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistKind {
    Master,
    Media,
}

/// A generated manifest. One master per task, one media per sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlsPlaylist {
    pub task_id: TaskId,
    pub kind: PlaylistKind,
    pub sub_task_id: Option<SubTaskId>,
    pub name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Renders the master playlist. Each entry is a rendition and the URI of its
/// media playlist.
pub fn render_master_playlist<'a>(
    variants: impl IntoIterator<Item = (&'a Rendition, &'a str)>,
) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n\n");
    for (rendition, uri) in variants {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
            rendition.bitrate_bps, rendition.width, rendition.height, uri
        ));
    }
    out
}

/// Renders a VOD media playlist from recorded segments (ordered by index).
pub fn render_media_playlist(config: &HlsConfig, segments: &[HlsSegment]) -> String {
    let mut ordered: Vec<&HlsSegment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.index);

    let window = match config.list_size {
        0 => ordered.len(),
        n => n as usize,
    };
    let skip = ordered.len().saturating_sub(window);
    let shown = &ordered[skip..];

    let target = shown
        .iter()
        .map(|s| s.duration_secs.ceil() as u32)
        .max()
        .unwrap_or(config.segment_duration_secs)
        .max(1);
    let first_index = shown.first().map(|s| s.index).unwrap_or(0);

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_index}\n"));
    for segment in shown {
        out.push_str(&format!(
            "#EXTINF:{:.3},\n{}\n",
            segment.duration_secs, segment.filename
        ));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}
