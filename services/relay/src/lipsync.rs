//! Offline Lip-Sync Compositor
//!
//! Turns a source video plus a synthesized audio clip into a single mp4.
//! When the wav2lip engine is installed and enabled it renders a lip-synced
//! video; otherwise the normalized video and audio are simply muxed, so the
//! caller always gets a playable file for well-formed media.
//!
//! External tools (`ffmpeg`, the engine's Python entry point) run as isolated
//! subprocesses. Only one engine render may run per process at a time.

use crate::config::LipSyncConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{info, instrument, warn};

pub const WAV2LIP_ENGINE: &str = "wav2lip";
const CHECKPOINT: &str = "checkpoints/wav2lip_gan.pth";
const INFERENCE_SCRIPT: &str = "inference.py";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("lip-sync engine is busy with another render")]
    EngineBusy,
    #[error("render failed: {0}")]
    RenderFailure(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing result of [`LipSyncCompositor::generate_synced_video`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Files of one render. The scoped `work_dir` removes every intermediate when
/// the job is dropped, whichever way the render ended. The output lives beside
/// it and is removed too unless the job was finished with
/// [`RenderJob::into_output`].
struct RenderJob {
    source_video_path: PathBuf,
    work_dir: tempfile::TempDir,
    video_base: PathBuf,
    audio_in: PathBuf,
    audio_norm: PathBuf,
    output_path: PathBuf,
    keep_output: bool,
}

impl RenderJob {
    fn create(source_video_path: &Path, temp_dir: &Path) -> std::io::Result<Self> {
        let work_dir = tempfile::Builder::new().prefix("job_").tempdir_in(temp_dir)?;
        let ts = chrono::Utc::now().timestamp_millis();
        let unique = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let dir = work_dir.path();
        Ok(Self {
            source_video_path: source_video_path.to_path_buf(),
            video_base: dir.join(format!("base_{}.mp4", ts)),
            audio_in: dir.join(format!("in_{}.bin", ts)),
            audio_norm: dir.join(format!("audio_{}.wav", ts)),
            output_path: temp_dir.join(format!("out_{}_{}.mp4", ts, unique)),
            work_dir,
            keep_output: false,
        })
    }

    fn into_output(mut self) -> PathBuf {
        self.keep_output = true;
        self.output_path.clone()
    }
}

impl Drop for RenderJob {
    fn drop(&mut self) {
        if !self.keep_output && self.output_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.output_path) {
                warn!(output = %self.output_path.display(), error = %e, "Could not remove partial render output.");
            }
        }
    }
}

/// Clears the processing flag when the engine render ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LipSyncCompositor {
    config: LipSyncConfig,
    is_processing: AtomicBool,
}

impl LipSyncCompositor {
    pub fn new(config: LipSyncConfig) -> Self {
        Self {
            config,
            is_processing: AtomicBool::new(false),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    /// Probes the engine installation. Evaluated fresh on every call.
    pub async fn is_engine_ready(&self) -> bool {
        if !self.config.enabled || self.config.engine != WAV2LIP_ENGINE {
            return false;
        }
        let root = &self.config.engine_root;
        let checkpoint = tokio::fs::try_exists(root.join(CHECKPOINT)).await;
        let script = tokio::fs::try_exists(root.join(INFERENCE_SCRIPT)).await;
        matches!((checkpoint, script), (Ok(true), Ok(true)))
    }

    fn try_acquire(&self) -> Result<ProcessingGuard<'_>, RenderError> {
        self.is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ProcessingGuard(&self.is_processing))
            .map_err(|_| RenderError::EngineBusy)
    }

    /// Renders and reports the outcome as `{success, videoPath | error}`.
    pub async fn generate_synced_video(&self, source_video_path: &Path, audio: &[u8]) -> RenderOutcome {
        match self.render(source_video_path, audio).await {
            Ok(path) => RenderOutcome {
                success: true,
                video_path: Some(path),
                error: None,
            },
            Err(e) => RenderOutcome {
                success: false,
                video_path: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Renders and returns the output path.
    #[instrument(skip(self, audio), fields(audio_bytes = audio.len()))]
    pub async fn render(&self, source_video_path: &Path, audio: &[u8]) -> Result<PathBuf, RenderError> {
        let ready = self.is_engine_ready().await;
        // Taken before any work so a concurrent engine request fails fast.
        let _guard = if ready { Some(self.try_acquire()?) } else { None };

        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let temp_dir = std::path::absolute(&self.config.temp_dir)?;
        let source = std::path::absolute(source_video_path)?;
        let job = RenderJob::create(&source, &temp_dir)?;

        self.normalize_video(&job).await?;
        tokio::fs::write(&job.audio_in, audio).await?;
        self.normalize_audio(&job).await?;

        if ready {
            info!("Rendering with the lip-sync engine.");
            self.run_engine(&job).await?;
        } else {
            info!(enabled = self.config.enabled, engine = %self.config.engine, "Engine not ready; muxing without lip-sync.");
            self.mux(&job).await?;
        }

        if !tokio::fs::try_exists(&job.output_path).await.unwrap_or(false) {
            return Err(RenderError::RenderFailure(
                "renderer exited cleanly but produced no output".to_string(),
            ));
        }
        info!(output = %job.output_path.display(), work_dir = %job.work_dir.path().display(), "Render complete.");
        Ok(job.into_output())
    }

    async fn normalize_video(&self, job: &RenderJob) -> Result<(), RenderError> {
        let mut command = Command::new(&self.config.ffmpeg);
        command
            .arg("-y")
            .arg("-i")
            .arg(&job.source_video_path)
            .args(["-an", "-vf", "fps=25,scale=720:1280"])
            .arg(&job.video_base);
        self.run_tool(command, "ffmpeg (video)").await
    }

    async fn normalize_audio(&self, job: &RenderJob) -> Result<(), RenderError> {
        let mut command = Command::new(&self.config.ffmpeg);
        command
            .arg("-y")
            .arg("-i")
            .arg(&job.audio_in)
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
            .arg(&job.audio_norm);
        self.run_tool(command, "ffmpeg (audio)").await
    }

    async fn run_engine(&self, job: &RenderJob) -> Result<(), RenderError> {
        let root = std::path::absolute(&self.config.engine_root)?;
        let mut command = Command::new(&self.config.python);
        command
            .arg(root.join(INFERENCE_SCRIPT))
            .arg("--checkpoint_path")
            .arg(root.join(CHECKPOINT))
            .arg("--face")
            .arg(&job.video_base)
            .arg("--audio")
            .arg(&job.audio_norm)
            .arg("--outfile")
            .arg(&job.output_path)
            .current_dir(&root)
            .env("PYTHONUNBUFFERED", "1");
        self.run_tool(command, WAV2LIP_ENGINE).await
    }

    async fn mux(&self, job: &RenderJob) -> Result<(), RenderError> {
        let mut command = Command::new(&self.config.ffmpeg);
        command
            .arg("-y")
            .arg("-i")
            .arg(&job.video_base)
            .arg("-i")
            .arg(&job.audio_norm)
            .args(["-c:v", "libx264", "-c:a", "aac", "-shortest"])
            .arg(&job.output_path);
        self.run_tool(command, "ffmpeg (mux)").await
    }

    /// Runs one tool to completion under the render timeout. A timed-out
    /// child is killed when its handle drops.
    async fn run_tool(&self, mut command: Command, label: &str) -> Result<(), RenderError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RenderError::RenderFailure(format!("failed to spawn {}: {}", label, e)))?;

        let output = match self.config.render_timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    warn!(label, "Render step timed out; killing subprocess.");
                    RenderError::RenderFailure(format!(
                        "{} timed out after {} seconds",
                        label,
                        limit.as_secs()
                    ))
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::RenderFailure(format!(
                "{} failed ({}): {}",
                label,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records its arguments, then writes a placeholder to its last argument.
    const FAKE_FFMPEG: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/ffmpeg.log"
for last; do :; done
printf 'media' > "$last"
"#;

    /// Takes a while, then writes the file named by `--outfile`.
    const FAKE_ENGINE: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--outfile" ]; then out="$2"; fi
  shift
done
sleep 1
printf 'synced' > "$out"
"#;

    const FAILING_ENGINE: &str = "#!/bin/sh\necho 'CUDA out of memory' >&2\nexit 3\n";

    /// Writes part of its output before failing.
    const PARTIAL_ENGINE: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--outfile" ]; then out="$2"; fi
  shift
done
printf 'half a video' > "$out"
echo 'segfault in face detector' >&2
exit 3
"#;

    /// Starts writing its output, then hangs.
    const HANGING_ENGINE: &str = r#"#!/bin/sh
for last; do :; done
printf 'partial' > "$last"
sleep 30
"#;

    /// Writes a partial mux output, then fails.
    const FAILING_MUX_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
case "$*" in
  *libx264*) printf 'partial' > "$last"; echo 'Conversion failed!' >&2; exit 1 ;;
esac
printf 'media' > "$last"
"#;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        root: TempDir,
        source: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let source = root.path().join("source.mp4");
            std::fs::write(&source, b"not really a video").unwrap();
            Self { root, source }
        }

        fn bin(&self) -> PathBuf {
            let bin = self.root.path().join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            bin
        }

        /// A config whose engine is absent.
        fn fallback_config(&self) -> LipSyncConfig {
            LipSyncConfig {
                enabled: true,
                engine: WAV2LIP_ENGINE.to_string(),
                engine_root: self.root.path().join("engine"),
                temp_dir: self.root.path().join("tmp"),
                python: PathBuf::from("/nonexistent/python"),
                ffmpeg: script(&self.bin(), "ffmpeg", FAKE_FFMPEG),
                render_timeout: Some(Duration::from_secs(30)),
            }
        }

        /// A config with an installed engine driven by `engine_script`.
        fn engine_config(&self, engine_script: &str) -> LipSyncConfig {
            let engine_root = self.root.path().join("engine");
            std::fs::create_dir_all(engine_root.join("checkpoints")).unwrap();
            std::fs::write(engine_root.join(CHECKPOINT), b"weights").unwrap();
            std::fs::write(engine_root.join(INFERENCE_SCRIPT), b"# entry point").unwrap();
            LipSyncConfig {
                python: script(&self.bin(), "python", engine_script),
                ..self.fallback_config()
            }
        }

        fn ffmpeg_log(&self) -> String {
            std::fs::read_to_string(self.root.path().join("bin/ffmpeg.log")).unwrap_or_default()
        }

        fn leftovers(&self, prefix: &str) -> usize {
            std::fs::read_dir(self.root.path().join("tmp"))
                .unwrap()
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
                .count()
        }

        fn leftover_jobs(&self) -> usize {
            self.leftovers("job_")
        }

        fn leftover_outputs(&self) -> usize {
            self.leftovers("out_")
        }
    }

    #[tokio::test]
    async fn test_engine_readiness_is_rechecked() {
        let fixture = Fixture::new();
        let compositor = LipSyncCompositor::new(fixture.fallback_config());
        assert!(!compositor.is_engine_ready().await);

        let config = fixture.engine_config(FAKE_ENGINE);
        assert!(LipSyncCompositor::new(config.clone()).is_engine_ready().await);

        let disabled = LipSyncConfig {
            enabled: false,
            ..config.clone()
        };
        assert!(!LipSyncCompositor::new(disabled).is_engine_ready().await);

        let other_engine = LipSyncConfig {
            engine: "sadtalker".to_string(),
            ..config.clone()
        };
        assert!(!LipSyncCompositor::new(other_engine).is_engine_ready().await);

        // Not cached: removing the checkpoint is noticed on the next check.
        let compositor = LipSyncCompositor::new(config.clone());
        std::fs::remove_file(config.engine_root.join(CHECKPOINT)).unwrap();
        assert!(!compositor.is_engine_ready().await);
    }

    #[tokio::test]
    async fn test_missing_model_falls_back_to_mux() {
        let fixture = Fixture::new();
        let compositor = LipSyncCompositor::new(fixture.fallback_config());

        let outcome = compositor
            .generate_synced_video(&fixture.source, b"RIFF....WAVE")
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        let video_path = outcome.video_path.unwrap();
        assert!(video_path.exists());
        assert!(
            video_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("out_")
        );

        let log = fixture.ffmpeg_log();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("-an -vf fps=25,scale=720:1280"));
        assert!(lines[1].contains("-ar 16000 -ac 1 -c:a pcm_s16le"));
        assert!(lines[2].contains("-c:v libx264 -c:a aac -shortest"));

        assert_eq!(fixture.leftover_jobs(), 0);
    }

    #[tokio::test]
    async fn test_engine_render_succeeds() {
        let fixture = Fixture::new();
        let compositor = LipSyncCompositor::new(fixture.engine_config(FAKE_ENGINE));

        let path = compositor.render(&fixture.source, b"audio").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"synced");
        assert!(!compositor.is_processing());
        // Only the two normalization passes; no mux.
        assert_eq!(fixture.ffmpeg_log().lines().count(), 2);
        assert_eq!(fixture.leftover_jobs(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_render_fails_fast_with_engine_busy() {
        let fixture = Fixture::new();
        let compositor = Arc::new(LipSyncCompositor::new(fixture.engine_config(FAKE_ENGINE)));

        let first = {
            let compositor = compositor.clone();
            let source = fixture.source.clone();
            tokio::spawn(async move { compositor.render(&source, b"first").await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !compositor.is_processing() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let second = compositor.render(&fixture.source, b"second").await;
        assert!(matches!(second, Err(RenderError::EngineBusy)));
        assert!(started.elapsed() < Duration::from_millis(500));

        let first = first.await.unwrap().unwrap();
        assert_eq!(std::fs::read(first).unwrap(), b"synced");
        assert!(!compositor.is_processing());
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces_stderr_and_releases_guard() {
        let fixture = Fixture::new();
        let compositor = LipSyncCompositor::new(fixture.engine_config(FAILING_ENGINE));

        let outcome = compositor.generate_synced_video(&fixture.source, b"audio").await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("CUDA out of memory"), "{}", error);
        assert!(!compositor.is_processing());
        assert_eq!(fixture.leftover_jobs(), 0);
        assert_eq!(fixture.leftover_outputs(), 0);
    }

    #[tokio::test]
    async fn test_failed_engine_render_removes_partial_output() {
        let fixture = Fixture::new();
        let compositor = LipSyncCompositor::new(fixture.engine_config(PARTIAL_ENGINE));

        let outcome = compositor.generate_synced_video(&fixture.source, b"audio").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("segfault"));
        assert_eq!(outcome.video_path, None);
        assert_eq!(fixture.leftover_jobs(), 0);
        assert_eq!(fixture.leftover_outputs(), 0);
    }

    #[tokio::test]
    async fn test_failed_mux_removes_partial_output() {
        let fixture = Fixture::new();
        let mut config = fixture.fallback_config();
        config.ffmpeg = script(&fixture.bin(), "ffmpeg-failing-mux", FAILING_MUX_FFMPEG);
        let compositor = LipSyncCompositor::new(config);

        let outcome = compositor.generate_synced_video(&fixture.source, b"audio").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Conversion failed"));
        assert_eq!(fixture.leftover_jobs(), 0);
        assert_eq!(fixture.leftover_outputs(), 0);
    }

    #[tokio::test]
    async fn test_render_timeout_kills_engine() {
        let fixture = Fixture::new();
        let config = LipSyncConfig {
            render_timeout: Some(Duration::from_millis(300)),
            ..fixture.engine_config(HANGING_ENGINE)
        };
        let compositor = LipSyncCompositor::new(config);

        let err = compositor.render(&fixture.source, b"audio").await.unwrap_err();
        assert!(matches!(err, RenderError::RenderFailure(ref m) if m.contains("timed out")));
        assert!(!compositor.is_processing());
        assert_eq!(fixture.leftover_jobs(), 0);
        assert_eq!(fixture.leftover_outputs(), 0);
    }

    #[tokio::test]
    async fn test_malformed_media_fails() {
        let fixture = Fixture::new();
        let mut config = fixture.fallback_config();
        config.ffmpeg = script(
            &fixture.bin(),
            "ffmpeg-rejecting",
            "#!/bin/sh\necho 'Invalid data found when processing input' >&2\nexit 1\n",
        );
        let compositor = LipSyncCompositor::new(config);

        let outcome = compositor.generate_synced_video(&fixture.source, b"").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Invalid data"));
        // The fake encoder never ran.
        assert!(fixture.ffmpeg_log().is_empty());
        assert_eq!(fixture.leftover_jobs(), 0);
        assert_eq!(fixture.leftover_outputs(), 0);
    }

    /// Needs a real ffmpeg on PATH.
    #[tokio::test]
    #[ignore]
    async fn test_fallback_with_real_ffmpeg_produces_audio_and_video() {
        let fixture = Fixture::new();
        let source = fixture.root.path().join("real.mp4");
        let wav = fixture.root.path().join("tone.wav");
        let gen_video = std::process::Command::new("ffmpeg")
            .args(["-y", "-f", "lavfi", "-i", "testsrc=duration=1:size=320x240:rate=25"])
            .arg(&source)
            .status()
            .unwrap();
        assert!(gen_video.success());
        let gen_audio = std::process::Command::new("ffmpeg")
            .args(["-y", "-f", "lavfi", "-i", "sine=frequency=440:duration=1"])
            .arg(&wav)
            .status()
            .unwrap();
        assert!(gen_audio.success());

        let config = LipSyncConfig {
            ffmpeg: PathBuf::from("ffmpeg"),
            ..fixture.fallback_config()
        };
        let compositor = LipSyncCompositor::new(config);
        let audio = std::fs::read(&wav).unwrap();
        let path = compositor.render(&source, &audio).await.unwrap();

        let probe = std::process::Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "stream=codec_type", "-of", "csv=p=0"])
            .arg(&path)
            .output()
            .unwrap();
        let streams = String::from_utf8_lossy(&probe.stdout);
        assert!(streams.contains("video"));
        assert!(streams.contains("audio"));
    }
}
