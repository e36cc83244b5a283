//! One-shot commands: `deploy` and `preview`.

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args};
use flowgrid_core::ResolvedSettings;
use flowgrid_recurrence::{BoundsOverride, Schedule, ScheduleSpec, evaluate};
use flowgrid_state::{Deployment, StateStore};
use tracing::info;

use crate::serve::scheduling_bounds;

/// Schedule definition shared by `deploy` and `preview`.
#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("recurrence").args(["every", "cron", "rrule"])))]
pub struct ScheduleArgs {
    /// Fixed interval in seconds.
    #[arg(long)]
    every: Option<u64>,

    /// Interval alignment point (RFC 3339). Defaults to the Unix epoch.
    #[arg(long, requires = "every")]
    anchor: Option<DateTime<Utc>>,

    /// Cron expression, 5 or 6 fields.
    #[arg(long)]
    cron: Option<String>,

    /// RRULE, optionally preceded by a DTSTART line.
    #[arg(long)]
    rrule: Option<String>,

    #[arg(long)]
    start: Option<DateTime<Utc>>,

    #[arg(long)]
    end: Option<DateTime<Utc>>,
}

impl ScheduleArgs {
    fn spec(&self) -> Option<ScheduleSpec> {
        let spec = if let Some(every) = self.every {
            let spec = ScheduleSpec::interval(every);
            match self.anchor {
                Some(anchor) => spec.anchored_at(anchor),
                None => spec,
            }
        } else if let Some(expression) = &self.cron {
            ScheduleSpec::cron(expression.clone())
        } else if let Some(rule) = &self.rrule {
            ScheduleSpec::rrule(rule.clone())
        } else {
            return None;
        };
        let spec = match self.start {
            Some(start) => spec.starting(start),
            None => spec,
        };
        Some(match self.end {
            Some(end) => spec.ending(end),
            None => spec,
        })
    }

    fn build(&self) -> anyhow::Result<Option<Schedule>> {
        Ok(self.spec().map(ScheduleSpec::build).transpose()?)
    }
}

/// Per-deployment bound overrides.
#[derive(Args, Debug, Clone, Default)]
pub struct BoundsArgs {
    #[arg(long)]
    min_runs: Option<usize>,

    #[arg(long)]
    max_runs: Option<usize>,

    #[arg(long)]
    min_scheduled_time_seconds: Option<u64>,

    #[arg(long)]
    max_scheduled_time_seconds: Option<u64>,
}

impl From<BoundsArgs> for BoundsOverride {
    fn from(args: BoundsArgs) -> Self {
        Self {
            min_runs: args.min_runs,
            max_runs: args.max_runs,
            min_scheduled_time_seconds: args.min_scheduled_time_seconds,
            max_scheduled_time_seconds: args.max_scheduled_time_seconds,
        }
    }
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Deployment id; an existing deployment with this id is replaced.
    id: String,

    /// Display name. Defaults to the id.
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    schedule: ScheduleArgs,

    #[command(flatten)]
    bounds: BoundsArgs,

    /// Copied onto every materialized run. Repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,

    #[arg(long)]
    paused: bool,

    #[arg(long)]
    concurrency_limit: Option<u32>,
}

impl DeployArgs {
    fn into_deployment(self, now: DateTime<Utc>) -> anyhow::Result<Deployment> {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut deployment = Deployment::new(self.id.clone(), name, now);
        deployment.schedule = self.schedule.build()?;
        deployment.bounds = self.bounds.into();
        deployment.tags = self.tags;
        deployment.paused = self.paused;
        deployment.concurrency_limit = self.concurrency_limit;
        Ok(deployment)
    }
}

pub fn deploy(settings: &ResolvedSettings, args: DeployArgs) -> anyhow::Result<()> {
    if let Some(parent) = settings.store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&settings.store_path)?;

    let now = Utc::now();
    let mut deployment = args.into_deployment(now)?;
    if let Some(existing) = store.get_deployment(&deployment.id)? {
        deployment.created_at = existing.created_at;
    }
    store.put_deployment(&deployment)?;

    info!(
        deployment_id = %deployment.id,
        schedulable = deployment.is_schedulable(),
        "deployment registered"
    );
    println!("{}", serde_json::to_string_pretty(&deployment)?);
    Ok(())
}

#[derive(Args, Debug)]
pub struct PreviewArgs {
    #[command(flatten)]
    schedule: ScheduleArgs,

    #[command(flatten)]
    bounds: BoundsArgs,

    /// Reference time (RFC 3339). Defaults to now.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
}

pub fn preview(settings: &ResolvedSettings, args: PreviewArgs) -> anyhow::Result<()> {
    for at in preview_times(settings, args)? {
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}

fn preview_times(
    settings: &ResolvedSettings,
    args: PreviewArgs,
) -> anyhow::Result<Vec<DateTime<Utc>>> {
    let schedule = args
        .schedule
        .build()?
        .ok_or_else(|| anyhow::anyhow!("one of --every, --cron or --rrule is required"))?;
    let base = scheduling_bounds(&settings.services.scheduler)?;
    let bounds = BoundsOverride::from(args.bounds).apply(&base);
    let now = args.now.unwrap_or_else(Utc::now);
    Ok(evaluate(&schedule, now, &bounds))
}
