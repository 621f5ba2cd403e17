//! Job processing for the Kontext image-edit worker.
//!
//! A [`HandlerContext`] is built once per process and holds the loaded
//! model. [`handle_job`] then runs one job through validation, geometry,
//! seeding, generation and materialization, and always returns a response
//! envelope: job-level failures never escape as errors.

pub mod config;
pub mod invoker;
pub mod materialize;
pub mod model;
pub mod provision;
pub mod seed;
pub mod source;
pub mod workspace;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use kontext_contracts::events::{JobEventLog, StateDetail};
use kontext_contracts::geometry::{AspectRatio, InvalidAspectRatio};
use kontext_contracts::job::{FailureKind, Job, JobInput, JobResponse};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::config::HandlerConfig;
use crate::invoker::ModelInvoker;
use crate::materialize::Materializer;
use crate::model::{GenerationRequest, ImageEditModel};
use crate::workspace::{sanitize_job_id, JobWorkspace};

pub use kontext_contracts::events::JobState;

/// Process-wide state shared by every job. Read-only once built.
pub struct HandlerContext {
    invoker: ModelInvoker,
    materializer: Materializer,
    http: HttpClient,
    work_dir: PathBuf,
    fetch_timeout_s: f64,
    events: Option<JobEventLog>,
}

impl HandlerContext {
    pub fn new(
        model: Arc<dyn ImageEditModel>,
        materializer: Materializer,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            invoker: ModelInvoker::new(model),
            materializer,
            http: HttpClient::new(),
            work_dir: work_dir.into(),
            fetch_timeout_s: 60.0,
            events: None,
        }
    }

    /// Loads the configured model and prepares the job root directory.
    pub fn from_config(config: &HandlerConfig) -> Result<Self> {
        fs::create_dir_all(&config.work_dir).with_context(|| {
            format!("failed to create work dir {}", config.work_dir.display())
        })?;
        let model = model::load_model(config)?;
        let mut context = Self::new(model, Materializer::from_config(config), &config.work_dir);
        if let Some(path) = &config.events_path {
            context = context.with_events(JobEventLog::new(path, uuid::Uuid::new_v4().to_string()));
        }
        Ok(context)
    }

    pub fn with_events(mut self, events: JobEventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn model_name(&self) -> &str {
        self.invoker.model_name()
    }

    pub fn uploads(&self) -> bool {
        self.materializer.uploads()
    }
}

/// Runs one job to completion and shapes its response envelope.
pub fn handle_job(ctx: &HandlerContext, job: &Job) -> JobResponse {
    let job_id = job
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut run = JobRun::new(ctx, job_id);
    tracing::debug!(job_id = %run.job_id, input = %job.input, "job received");
    run.advance(JobState::Received, None);

    let response = match run.execute(&job.input) {
        Ok(response) => response,
        Err(response) => {
            run.advance(JobState::Error, StateDetail::failure(&response));
            response
        }
    };
    run.advance(JobState::Responded, None);
    response
}

struct JobRun<'a> {
    ctx: &'a HandlerContext,
    job_id: String,
    state: JobState,
}

impl<'a> JobRun<'a> {
    fn new(ctx: &'a HandlerContext, job_id: String) -> Self {
        Self {
            ctx,
            job_id,
            state: JobState::Received,
        }
    }

    fn advance(&mut self, next: JobState, detail: Option<StateDetail>) {
        tracing::debug!(job_id = %self.job_id, from = %self.state, to = %next, "job state");
        self.state = next;
        let Some(events) = &self.ctx.events else {
            return;
        };
        if let Err(err) = events.record(&self.job_id, next, detail) {
            tracing::warn!("event log write failed: {err:#}");
        }
    }

    /// The `Err` side carries the failure envelope to return.
    fn execute(&mut self, raw: &Value) -> Result<JobResponse, JobResponse> {
        let ctx = self.ctx;
        let input = JobInput::from_raw(raw).map_err(|errors| {
            tracing::warn!(job_id = %self.job_id, "input validation failed: {errors}");
            JobResponse::invalid_input(errors)
        })?;
        self.advance(JobState::Validated, None);

        let ratio: AspectRatio = input
            .aspect_ratio
            .parse()
            .map_err(|err: InvalidAspectRatio| self.fail(FailureKind::Input, err.to_string()))?;
        let storage_id = sanitize_job_id(&self.job_id);
        let workspace = JobWorkspace::create(&ctx.work_dir, &storage_id)
            .map_err(|err| self.fail(FailureKind::Storage, format!("{err:#}")))?;

        let source_path =
            source::fetch_source(&ctx.http, &input.image, workspace.path(), ctx.fetch_timeout_s)
                .map_err(|err| self.fail(FailureKind::Input, format!("{err:#}")))?;
        let source_image = source::load_rgb(&source_path)
            .map_err(|err| self.fail(FailureKind::Input, format!("{err:#}")))?;
        let native = source::dimensions(&source_image);
        let size = ratio.resolve(native);
        let image = source::resample(&source_image, size);
        drop(source_image);
        self.advance(
            JobState::GeometryResolved,
            Some(StateDetail::Geometry {
                aspect_ratio: ratio.name().to_string(),
                source: native.to_string(),
                width: size.width,
                height: size.height,
            }),
        );

        let seed = seed::resolve_seed(input.seed);
        self.advance(
            JobState::Seeded,
            Some(StateDetail::Seed {
                seed,
                synthesized: input.seed.is_none(),
            }),
        );

        let request = GenerationRequest {
            prompt: input.prompt,
            image,
            width: size.width,
            height: size.height,
            num_inference_steps: input.num_inference_steps,
            guidance_scale: input.guidance_scale,
            seed,
        };
        tracing::info!(
            job_id = %self.job_id,
            size = %size,
            steps = request.num_inference_steps,
            guidance = request.guidance_scale,
            seed,
            "generating"
        );
        let output = ctx
            .invoker
            .invoke(&request)
            .map_err(|failure| JobResponse::failure(failure.kind, failure.message))?;
        drop(request);
        self.advance(JobState::Generated, None);

        let image_url = ctx
            .materializer
            .materialize(&output, &storage_id, workspace)
            .map_err(|err| self.fail(FailureKind::Storage, format!("Failed to store result: {err:#}")))?;
        self.advance(
            JobState::Materialized,
            Some(StateDetail::Output {
                uploaded: ctx.materializer.uploads(),
            }),
        );
        tracing::info!(job_id = %self.job_id, seed, "job finished");
        Ok(JobResponse::success(image_url, seed))
    }

    fn fail(&self, kind: FailureKind, message: String) -> JobResponse {
        tracing::error!(job_id = %self.job_id, kind = ?kind, "{message}");
        JobResponse::failure(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{Rgb, RgbImage};
    use kontext_contracts::events::JobEvent;
    use kontext_contracts::job::ErrorDetail;
    use serde_json::json;

    use super::*;
    use crate::materialize::ObjectStore;
    use crate::model::{DryrunModel, ModelFault};

    struct FaultyModel {
        calls: AtomicUsize,
    }

    impl ImageEditModel for FaultyModel {
        fn name(&self) -> &str {
            "faulty"
        }

        fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<RgbImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ModelFault::OutOfMemory("CUDA out of memory".to_string()).into())
        }
    }

    struct PanickingModel;

    impl ImageEditModel for PanickingModel {
        fn name(&self) -> &str {
            "panicking"
        }

        fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<RgbImage> {
            panic!("attention kernel index out of range");
        }
    }

    /// Records the storage key and the directory of every uploaded file.
    #[derive(Clone, Default)]
    struct KeyedStore {
        uploads: Arc<Mutex<Vec<(String, PathBuf)>>>,
        fail: bool,
    }

    impl ObjectStore for KeyedStore {
        fn upload(&self, job_id: &str, path: &Path) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("bucket rejected the upload");
            }
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            self.uploads
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push((job_id.to_string(), dir));
            Ok(format!("https://bucket.test/{job_id}/output.png"))
        }
    }

    fn write_source(dir: &Path, width: u32, height: u32) -> anyhow::Result<String> {
        let path = dir.join("source.png");
        RgbImage::from_pixel(width, height, Rgb([90, 140, 200])).save(&path)?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn job(id: &str, input: Value) -> Job {
        Job {
            id: Some(id.to_string()),
            input,
        }
    }

    fn decode_data_uri(url: &str) -> anyhow::Result<RgbImage> {
        let encoded = url
            .strip_prefix("data:image/png;base64,")
            .ok_or_else(|| anyhow::anyhow!("not a png data uri: {url}"))?;
        Ok(image::load_from_memory(&BASE64.decode(encoded)?)?.to_rgb8())
    }

    fn dir_is_empty(path: &Path) -> anyhow::Result<bool> {
        Ok(fs::read_dir(path)?.next().is_none())
    }

    #[test]
    fn square_ratio_scenario_applies_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let work = temp.path().join("jobs");
        fs::create_dir_all(&work)?;
        let source = write_source(temp.path(), 300, 200)?;
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::inline(), &work);

        let response = handle_job(
            &ctx,
            &job("job-cat", json!({"prompt": "a cat", "image": source, "aspect_ratio": "1:1"})),
        );

        let JobResponse::Success { image_url, seed } = response else {
            panic!("expected success, got {response:?}");
        };
        assert!(seed <= 65_535);
        let output = decode_data_uri(&image_url)?;
        assert_eq!(output.dimensions(), (1024, 1024));
        assert!(dir_is_empty(&work)?);
        Ok(())
    }

    #[test]
    fn match_input_keeps_native_geometry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), 123, 77)?;
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::inline(), temp.path());

        let response = handle_job(&ctx, &job("job-native", json!({"prompt": "x", "image": source})));
        let JobResponse::Success { image_url, .. } = response else {
            panic!("expected success, got {response:?}");
        };
        assert_eq!(decode_data_uri(&image_url)?.dimensions(), (123, 77));
        Ok(())
    }

    #[test]
    fn fixed_seed_is_echoed_and_reproducible() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), 64, 64)?;
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::inline(), temp.path());
        let input = json!({"prompt": "snow", "image": source, "seed": 123456789, "aspect_ratio": "4:3"});

        let first = handle_job(&ctx, &job("a", input.clone()));
        let second = handle_job(&ctx, &job("b", input));
        assert_eq!(first, second);
        assert!(matches!(first, JobResponse::Success { seed: 123_456_789, .. }));
        Ok(())
    }

    #[test]
    fn missing_prompt_reports_fields_without_refresh() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::inline(), temp.path());

        let response = handle_job(&ctx, &job("job-bad", json!({"image": "https://x.test/a.png"})));
        let value = serde_json::to_value(&response)?;
        assert_eq!(value, json!({"error": ["prompt is a required input."]}));
        assert!(value.get("refresh_worker").is_none());
        assert!(dir_is_empty(temp.path())?);
        Ok(())
    }

    #[test]
    fn unknown_ratio_fails_before_fetch_or_generation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(FaultyModel {
            calls: AtomicUsize::new(0),
        });
        let ctx = HandlerContext::new(model.clone(), Materializer::inline(), temp.path());

        let response = handle_job(
            &ctx,
            &job(
                "job-ratio",
                json!({"prompt": "x", "image": "http://127.0.0.1:9/a.png", "aspect_ratio": "7:5"}),
            ),
        );
        let JobResponse::Failure {
            error: ErrorDetail::Fields(messages),
            refresh_worker,
        } = response
        else {
            panic!("expected field errors, got {response:?}");
        };
        assert!(!refresh_worker);
        assert!(messages[0].starts_with("aspect_ratio must be one of"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert!(dir_is_empty(temp.path())?);
        Ok(())
    }

    #[test]
    fn resource_fault_requests_worker_refresh_and_cleans_up() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let work = temp.path().join("jobs");
        let source = write_source(temp.path(), 32, 32)?;
        let model = Arc::new(FaultyModel {
            calls: AtomicUsize::new(0),
        });
        let ctx = HandlerContext::new(model.clone(), Materializer::inline(), &work);

        let response = handle_job(&ctx, &job("job-oom", json!({"prompt": "x", "image": source})));
        let value = serde_json::to_value(&response)?;
        assert_eq!(value["refresh_worker"], json!(true));
        assert!(value["error"]
            .as_str()
            .is_some_and(|error| error.contains("CUDA out of memory")));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert!(!work.join("job-oom").exists());
        Ok(())
    }

    #[test]
    fn unreadable_source_is_an_input_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::inline(), temp.path());
        let junk = format!("data:image/png;base64,{}", BASE64.encode(b"junk"));

        let response = handle_job(&ctx, &job("job-junk", json!({"prompt": "x", "image": junk})));
        assert!(!response.is_success());
        assert!(!response.refresh_worker());
        assert!(!temp.path().join("job-junk").exists());
        Ok(())
    }

    #[test]
    fn events_follow_the_state_machine() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let source = write_source(temp.path(), 16, 16)?;
        let ctx = HandlerContext::new(
            Arc::new(DryrunModel),
            Materializer::inline(),
            temp.path().join("jobs"),
        )
        .with_events(JobEventLog::new(&events_path, "worker-test"));

        handle_job(&ctx, &job("ok", json!({"prompt": "x", "image": source})));
        handle_job(&ctx, &job("bad", json!({})));

        let events = fs::read_to_string(events_path)?
            .lines()
            .map(serde_json::from_str::<JobEvent>)
            .collect::<Result<Vec<_>, _>>()?;
        let states_for = |job_id: &str| -> Vec<JobState> {
            events
                .iter()
                .filter(|event| event.job_id == job_id)
                .map(|event| event.state)
                .collect()
        };
        assert_eq!(
            states_for("ok"),
            [
                JobState::Received,
                JobState::Validated,
                JobState::GeometryResolved,
                JobState::Seeded,
                JobState::Generated,
                JobState::Materialized,
                JobState::Responded,
            ]
        );
        assert_eq!(
            states_for("bad"),
            [JobState::Received, JobState::Error, JobState::Responded]
        );

        let seeded = events
            .iter()
            .find(|event| event.state == JobState::Seeded)
            .and_then(|event| event.detail.clone());
        assert!(matches!(
            seeded,
            Some(StateDetail::Seed {
                synthesized: true,
                ..
            })
        ));
        let failed = events
            .iter()
            .find(|event| event.state == JobState::Error)
            .and_then(|event| event.detail.clone());
        assert!(matches!(
            failed,
            Some(StateDetail::Failure {
                refresh_worker: false,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn jobs_without_id_get_one() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), 8, 8)?;
        let work = temp.path().join("jobs");
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::inline(), &work);

        let response = handle_job(
            &ctx,
            &Job {
                id: None,
                input: json!({"prompt": "x", "image": source}),
            },
        );
        assert!(response.is_success());
        assert!(dir_is_empty(&work)?);
        Ok(())
    }

    #[test]
    fn distinct_ids_never_share_a_directory_or_upload_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = write_source(temp.path(), 8, 8)?;
        let store = KeyedStore::default();
        let ctx = HandlerContext::new(
            Arc::new(DryrunModel),
            Materializer::with_store(store.clone()),
            temp.path().join("jobs"),
        );

        let ids = ["작업1", "업무1", "a.b", "a/b", "a_b"];
        let mut urls = Vec::new();
        for id in ids {
            let response = handle_job(&ctx, &job(id, json!({"prompt": "x", "image": source})));
            let JobResponse::Success { image_url, .. } = response else {
                panic!("expected success for {id}, got {response:?}");
            };
            urls.push(image_url);
        }

        let uploads = store.uploads.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        let keys: HashSet<&str> = uploads.iter().map(|(key, _)| key.as_str()).collect();
        let dirs: HashSet<&PathBuf> = uploads.iter().map(|(_, dir)| dir).collect();
        let unique_urls: HashSet<&String> = urls.iter().collect();
        assert_eq!(keys.len(), ids.len());
        assert_eq!(dirs.len(), ids.len());
        assert_eq!(unique_urls.len(), ids.len());
        assert!(keys.contains("a_b"));
        Ok(())
    }

    #[test]
    fn failed_upload_is_a_storage_error_and_cleans_up() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let work = temp.path().join("jobs");
        let source = write_source(temp.path(), 8, 8)?;
        let store = KeyedStore {
            fail: true,
            ..KeyedStore::default()
        };
        let ctx = HandlerContext::new(Arc::new(DryrunModel), Materializer::with_store(store), &work);

        let response = handle_job(&ctx, &job("job-upload", json!({"prompt": "x", "image": source})));
        let value = serde_json::to_value(&response)?;
        assert!(value["error"]
            .as_str()
            .is_some_and(|error| error.contains("bucket rejected the upload")));
        assert!(value.get("refresh_worker").is_none());
        assert!(dir_is_empty(&work)?);
        Ok(())
    }

    #[test]
    fn model_panic_requests_refresh_and_cleans_up() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let work = temp.path().join("jobs");
        let source = write_source(temp.path(), 8, 8)?;
        let ctx = HandlerContext::new(Arc::new(PanickingModel), Materializer::inline(), &work);

        let response = handle_job(&ctx, &job("job-panic", json!({"prompt": "x", "image": source})));
        let JobResponse::Failure {
            error: ErrorDetail::Message(message),
            refresh_worker,
        } = response
        else {
            panic!("expected a failure message, got {response:?}");
        };
        assert!(refresh_worker);
        assert!(message.contains("attention kernel index out of range"));
        assert!(dir_is_empty(&work)?);
        Ok(())
    }
}
