//! Pipeline orchestration: build the visa-wait and immigration artifacts in memory,
//! then publish them to the output directory in one pass.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vtrack_adapters::bulletin::{self, fetch_bulletin};
use vtrack_adapters::gazetteer::{self, load_gazetteer};
use vtrack_adapters::processing::{self, fetch_processing_times};
use vtrack_adapters::wait_times::{self, fetch_wait_times};
use vtrack_adapters::AdapterContext;
use vtrack_core::{
    BulletinSnapshot, DataQualityWarning, MatchPass, ProcessingQueueRecord, ResolvedWaitTimeRecord,
    ReviewSummary, SourceRef, WaitTimeFormat,
};
use vtrack_storage::{ArtifactStore, FetchRequest, HttpFetcher, PageSource};

pub mod config;
pub mod export;
pub mod reference;
pub mod resolve;

pub use config::PipelineConfig;
pub use reference::ReferenceData;

use export::{EncodedArtifact, SnapshotManifestFile};
use resolve::CityResolver;

pub const CRATE_NAME: &str = "vtrack-sync";

/// Which artifacts a run builds and publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunScope {
    All,
    VisaWait,
    Immigration,
}

impl RunScope {
    fn includes_visa_wait(self) -> bool {
        matches!(self, RunScope::All | RunScope::VisaWait)
    }

    fn includes_immigration(self) -> bool {
        matches!(self, RunScope::All | RunScope::Immigration)
    }
}

/// Geocoded wait times, one row per resolved post.
#[derive(Debug, Clone, Serialize)]
pub struct VisaWaitArtifact {
    pub format: WaitTimeFormat,
    pub update_date: Option<NaiveDate>,
    pub gazetteer_member: String,
    pub records: Vec<ResolvedWaitTimeRecord>,
    pub unresolved: Vec<String>,
    pub warnings: Vec<DataQualityWarning>,
    pub provenance: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImmigrationArtifact {
    pub bulletin: BulletinSnapshot,
    pub queue: Vec<ProcessingQueueRecord>,
    pub review: ReviewSummary,
    pub warnings: Vec<DataQualityWarning>,
    pub provenance: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub scope: RunScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub visa_wait_rows: usize,
    pub unresolved_cities: usize,
    pub bulletin_rows: usize,
    pub queue_rows: usize,
    pub warnings: usize,
    pub output_dir: String,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    run_id: Uuid,
    scope: RunScope,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    visa_wait: Option<VisaWaitReport<'a>>,
    immigration: Option<ImmigrationReport<'a>>,
    warnings: Vec<&'a DataQualityWarning>,
    files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Serialize)]
struct VisaWaitReport<'a> {
    format: &'static str,
    update_date: Option<NaiveDate>,
    gazetteer_member: &'a str,
    resolved_rows: usize,
    alias_matches: usize,
    unresolved: &'a [String],
    provenance: &'a [SourceRef],
}

#[derive(Debug, Serialize)]
struct ImmigrationReport<'a> {
    bulletin: &'a BulletinSnapshot,
    queue_rows: usize,
    review: &'a ReviewSummary,
    provenance: &'a [SourceRef],
}

pub struct Pipeline {
    config: PipelineConfig,
    reference: ReferenceData,
    store: ArtifactStore,
    source: Arc<dyn PageSource>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, reference: ReferenceData) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_source(config, reference, Arc::new(http)))
    }

    /// Same pipeline over any page source (fixtures in tests).
    pub fn with_source(
        config: PipelineConfig,
        reference: ReferenceData,
        source: Arc<dyn PageSource>,
    ) -> Self {
        let store = ArtifactStore::new(config.output_dir.clone());
        Self {
            config,
            reference,
            store,
            source,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn build_visa_wait_artifact(&self, ctx: &AdapterContext) -> Result<VisaWaitArtifact> {
        let urls = &self.config.urls;
        let source = self.source.as_ref();

        let gazetteer_request = FetchRequest::get(&urls.gazetteer)
            .with_browser_headers(&self.config.user_agent, &urls.gazetteer_referer);
        let gazetteer = load_gazetteer(source, ctx, &gazetteer_request, &self.config.gazetteer_member)
            .await
            .context("loading gazetteer")?;

        let page = fetch_wait_times(
            source,
            ctx,
            &urls.wait_times,
            &self.reference.codes,
            self.config.wait_time_format,
        )
        .await
        .context("extracting wait-time table")?;

        let resolver = CityResolver::new(&gazetteer.cities, &self.reference.aliases);
        let resolution = resolver.resolve(page.records.iter().map(|r| r.city_post.as_str()));

        let mut records = Vec::new();
        for pass in [MatchPass::Direct, MatchPass::Alias] {
            for record in &page.records {
                let Some(hit) = resolution.matches.get(&record.city_post) else {
                    continue;
                };
                if hit.pass != pass {
                    continue;
                }
                records.push(ResolvedWaitTimeRecord {
                    record: record.clone(),
                    ascii_name: hit.record.ascii_name.clone(),
                    country: hit.record.country.clone(),
                    iso2: hit.record.iso2.clone(),
                    lat: hit.record.lat,
                    lng: hit.record.lng,
                    match_pass: hit.pass,
                });
            }
        }

        let mut warnings = gazetteer.warnings;
        warnings.extend(page.warnings);
        warnings.extend(resolver.unresolved_warnings(&resolution));

        info!(
            resolved = records.len(),
            unresolved = resolution.unresolved.len(),
            "visa-wait artifact built"
        );
        Ok(VisaWaitArtifact {
            format: page.format,
            update_date: page.update_date,
            gazetteer_member: gazetteer.member,
            records,
            unresolved: resolution.unresolved,
            warnings,
            provenance: vec![
                source_ref(gazetteer::SOURCE_ID, &urls.gazetteer, ctx),
                source_ref(wait_times::SOURCE_ID, &urls.wait_times, ctx),
            ],
        })
    }

    pub async fn build_immigration_artifact(&self, ctx: &AdapterContext) -> Result<ImmigrationArtifact> {
        let urls = &self.config.urls;
        let source = self.source.as_ref();

        let bulletin = fetch_bulletin(source, ctx, &urls.bulletin_index)
            .await
            .context("extracting visa bulletin")?;
        let processing =
            fetch_processing_times(source, ctx, &urls.processing_times, self.config.processing_layout)
                .await
                .context("extracting processing times")?;

        let mut warnings = bulletin.warnings;
        warnings.extend(processing.warnings);

        let provenance = vec![
            source_ref(bulletin::SOURCE_ID, &urls.bulletin_index, ctx),
            source_ref(bulletin::SOURCE_ID, &bulletin.snapshot.source_url, ctx),
            source_ref(processing::SOURCE_ID, &urls.processing_times, ctx),
        ];
        info!(
            bulletin_rows = bulletin.snapshot.records.len(),
            queue_rows = processing.queue.len(),
            "immigration artifact built"
        );
        Ok(ImmigrationArtifact {
            bulletin: bulletin.snapshot,
            queue: processing.queue,
            review: processing.review,
            warnings,
            provenance,
        })
    }

    /// Build every artifact in `scope`, then publish. A failing stage leaves the
    /// output directory untouched.
    pub async fn run_once(&self, scope: RunScope) -> Result<RunSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(started_at);
        let span = info_span!("pipeline_run", run_id = %ctx.run_id, ?scope);

        async {
            let visa_wait = if scope.includes_visa_wait() {
                Some(self.build_visa_wait_artifact(&ctx).await?)
            } else {
                None
            };
            let immigration = if scope.includes_immigration() {
                Some(self.build_immigration_artifact(&ctx).await?)
            } else {
                None
            };

            let warnings = visa_wait
                .iter()
                .flat_map(|a| a.warnings.iter())
                .chain(immigration.iter().flat_map(|a| a.warnings.iter()))
                .collect::<Vec<_>>();
            for warning in &warnings {
                warn!(%warning, "data-quality warning");
            }

            let mut tables = Vec::new();
            let mut snapshots = Vec::new();
            if let Some(artifact) = &visa_wait {
                tables.push(EncodedArtifact::new(
                    "visa_wait_times",
                    export::VISA_WAIT_CSV,
                    export::visa_wait_csv(&artifact.records)?,
                ));
                snapshots.push(EncodedArtifact::new(
                    "visa_wait_times",
                    export::snapshot_path("visa_wait_times.parquet"),
                    export::visa_wait_parquet(&artifact.records)?,
                ));
            }
            if let Some(artifact) = &immigration {
                tables.push(EncodedArtifact::new(
                    "visa_bulletin",
                    export::VISA_BULLETIN_CSV,
                    export::visa_bulletin_csv(&artifact.bulletin.records)?,
                ));
                tables.push(EncodedArtifact::new(
                    "processing_queue",
                    export::PROCESSING_QUEUE_CSV,
                    export::processing_queue_csv(&artifact.queue)?,
                ));
                tables.push(EncodedArtifact::new(
                    "review_summary",
                    export::REVIEW_SUMMARY_JSON,
                    export::review_summary_json(&artifact.review, &artifact.bulletin.title)?,
                ));
                snapshots.push(EncodedArtifact::new(
                    "visa_bulletin",
                    export::snapshot_path("visa_bulletin.parquet"),
                    export::visa_bulletin_parquet(&artifact.bulletin.records)?,
                ));
                snapshots.push(EncodedArtifact::new(
                    "processing_queue",
                    export::snapshot_path("processing_queue.parquet"),
                    export::processing_queue_parquet(&artifact.queue)?,
                ));
            }

            let manifest = export::manifest_for(&snapshots);
            let manifest_bytes =
                serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;

            let finished_at = Utc::now();
            let mut published = tables;
            published.extend(snapshots);
            let report = RunReport {
                run_id: ctx.run_id,
                scope,
                started_at,
                finished_at,
                visa_wait: visa_wait.as_ref().map(|a| VisaWaitReport {
                    format: a.format.version_tag(),
                    update_date: a.update_date,
                    gazetteer_member: &a.gazetteer_member,
                    resolved_rows: a.records.len(),
                    alias_matches: a
                        .records
                        .iter()
                        .filter(|r| r.match_pass == MatchPass::Alias)
                        .count(),
                    unresolved: &a.unresolved,
                    provenance: &a.provenance,
                }),
                immigration: immigration.as_ref().map(|a| ImmigrationReport {
                    bulletin: &a.bulletin,
                    queue_rows: a.queue.len(),
                    review: &a.review,
                    provenance: &a.provenance,
                }),
                warnings: warnings.clone(),
                files: export::manifest_for(&published).files,
            };
            let report_json = serde_json::to_vec_pretty(&report).context("serializing run report")?;
            let report_md = render_run_report_markdown(&report);

            published.push(EncodedArtifact::new(
                "manifest",
                export::snapshot_path(export::MANIFEST_JSON),
                manifest_bytes,
            ));
            published.push(EncodedArtifact::new("run_report", export::RUN_REPORT_JSON, report_json));
            published.push(EncodedArtifact::new(
                "run_report_md",
                export::RUN_REPORT_MD,
                report_md.into_bytes(),
            ));

            let mut files = Vec::with_capacity(published.len());
            for artifact in &published {
                let stored = self
                    .store
                    .replace_bytes(&artifact.relative_path, &artifact.bytes)
                    .await
                    .with_context(|| format!("publishing {}", artifact.relative_path))?;
                files.push(stored.relative_path.display().to_string());
            }

            let summary = RunSummary {
                run_id: ctx.run_id,
                scope,
                started_at,
                finished_at,
                visa_wait_rows: visa_wait.as_ref().map_or(0, |a| a.records.len()),
                unresolved_cities: visa_wait.as_ref().map_or(0, |a| a.unresolved.len()),
                bulletin_rows: immigration.as_ref().map_or(0, |a| a.bulletin.records.len()),
                queue_rows: immigration.as_ref().map_or(0, |a| a.queue.len()),
                warnings: warnings.len(),
                output_dir: self.store.root().display().to_string(),
                files,
            };
            info!(files = summary.files.len(), warnings = summary.warnings, "run published");
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Cron-driven re-runs, when enabled in config. Each tick is an independent run.
    pub async fn maybe_build_scheduler(self: Arc<Self>, scope: RunScope) -> Result<Option<JobScheduler>> {
        if !self.config.schedule.enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.schedule.cron;
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(scope).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
                    Err(err) => error!(error = ?err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn source_ref(source_id: &str, url: &str, ctx: &AdapterContext) -> SourceRef {
    SourceRef {
        source_id: source_id.to_string(),
        url: url.to_string(),
        fetched_at: ctx.fetched_at,
    }
}

fn render_run_report_markdown(report: &RunReport<'_>) -> String {
    let mut lines = vec![
        "# Visa Tracker Run Report".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Scope: {:?}", report.scope),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
    ];
    if let Some(v) = &report.visa_wait {
        lines.push(String::new());
        lines.push("## Visa wait times".to_string());
        lines.push(format!("- Format: {}", v.format));
        lines.push(format!(
            "- Page updated: {}",
            v.update_date.map_or_else(|| "unknown".to_string(), |d| d.to_string())
        ));
        lines.push(format!("- Gazetteer member: `{}`", v.gazetteer_member));
        lines.push(format!(
            "- Resolved posts: {} ({} via alias)",
            v.resolved_rows, v.alias_matches
        ));
        lines.push(format!("- Unresolved posts: {}", v.unresolved.len()));
    }
    if let Some(i) = &report.immigration {
        lines.push(String::new());
        lines.push(format!("## {}", i.bulletin.title));
        lines.push(format!("- Bulletin rows: {}", i.bulletin.records.len()));
        lines.push(format!("- Receipt months: {}", i.queue_rows));
        lines.push(format!(
            "- Analyst review priority date: {}",
            i.review.review_priority_date
        ));
        lines.push(format!(
            "- Average processing days ({}): {}",
            i.review.as_of_label, i.review.average_processing_days
        ));
    }
    lines.push(String::new());
    lines.push(format!("## Warnings ({})", report.warnings.len()));
    lines.extend(report.warnings.iter().map(|w| format!("- {w}")));
    lines.push(String::new());
    lines.push("## Files".to_string());
    lines.extend(
        report
            .files
            .iter()
            .map(|f| format!("- `{}` {} bytes sha256 `{}`", f.path, f.bytes, f.sha256)),
    );
    lines.push(String::new());
    lines.join("\n")
}

pub async fn run_once_from_workspace(workspace_root: &Path, scope: RunScope) -> Result<RunSummary> {
    let config = PipelineConfig::load(workspace_root)?;
    let reference = ReferenceData::load(&config.reference_dir)?;
    Pipeline::new(config, reference)?.run_once(scope).await
}

/// Run the scheduler until Ctrl-C. Returns immediately when scheduling is disabled.
pub async fn run_scheduled_from_workspace(workspace_root: &Path, scope: RunScope) -> Result<()> {
    let config = PipelineConfig::load(workspace_root)?;
    let reference = ReferenceData::load(&config.reference_dir)?;
    let pipeline = Arc::new(Pipeline::new(config, reference)?);

    let Some(mut sched) = pipeline.maybe_build_scheduler(scope).await? else {
        warn!("schedule.enabled is false in pipeline.yaml; nothing to do");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_selects_artifacts() {
        assert!(RunScope::All.includes_visa_wait() && RunScope::All.includes_immigration());
        assert!(RunScope::VisaWait.includes_visa_wait());
        assert!(!RunScope::VisaWait.includes_immigration());
        assert!(!RunScope::Immigration.includes_visa_wait());
    }

    #[tokio::test]
    async fn disabled_schedule_builds_no_scheduler() {
        let pipeline = Arc::new(Pipeline::with_source(
            PipelineConfig::default(),
            ReferenceData::default(),
            Arc::new(vtrack_storage::StaticPageSource::new()),
        ));
        assert!(pipeline.maybe_build_scheduler(RunScope::All).await.unwrap().is_none());
    }
}
