//! Usage commands
//!
//! Inspect the persisted usage ledger.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use shopgauge_core::services::governor::{
    EndpointUsage, UsageAnalyticsSummary, UsageBucket, UsageRecord,
};

use super::{or_dash, Context};
use crate::output::{print_json, print_output, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum UsageAction {
    /// Usage summary (current bucket, totals, averages)
    Summary,

    /// Most recent usage records
    Records {
        /// Number of records to show
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },

    /// Successful cost per hour
    Hourly,

    /// Successful cost per day
    Daily,

    /// Requests and cost per endpoint
    Endpoints,

    /// Delete the usage history (the current bucket state is kept)
    Clear,
}

/// Key/value row for the summary table
#[derive(Debug, Serialize, Tabled)]
pub struct MetricRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

/// Usage record row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct RecordRow {
    #[tabled(rename = "Time")]
    pub time: String,
    #[tabled(rename = "Endpoint")]
    pub endpoint: String,
    #[tabled(rename = "Operation")]
    pub operation: String,
    #[tabled(rename = "Requested")]
    pub requested: String,
    #[tabled(rename = "Actual")]
    pub actual: String,
    #[tabled(rename = "Available")]
    pub available: String,
    #[tabled(rename = "OK")]
    pub success: bool,
    #[tabled(rename = "Throttled")]
    pub throttled: bool,
}

impl From<&UsageRecord> for RecordRow {
    fn from(record: &UsageRecord) -> Self {
        Self {
            time: record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            endpoint: or_dash(record.endpoint.as_deref()),
            operation: or_dash(record.operation.as_deref()),
            requested: format!("{:.0}", record.requested_cost),
            actual: format!("{:.0}", record.actual_cost),
            available: format!(
                "{:.0}/{:.0}",
                record.throttle_status.currently_available,
                record.throttle_status.maximum_available
            ),
            success: record.success,
            throttled: record.throttled,
        }
    }
}

/// Aggregate bucket row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct BucketRow {
    #[tabled(rename = "Window Start")]
    pub window_start: String,
    #[tabled(rename = "Total Cost")]
    pub total_cost: String,
    #[tabled(rename = "Requests")]
    pub count: u64,
}

impl BucketRow {
    fn new(bucket: &UsageBucket, pattern: &str) -> Self {
        Self {
            window_start: bucket.window_start.format(pattern).to_string(),
            total_cost: format!("{:.0}", bucket.total_cost),
            count: bucket.count,
        }
    }
}

/// Endpoint row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct EndpointRow {
    #[tabled(rename = "Endpoint")]
    pub endpoint: String,
    #[tabled(rename = "Requests")]
    pub requests: u64,
    #[tabled(rename = "Cost")]
    pub successful_cost: String,
    #[tabled(rename = "Throttled")]
    pub throttled: u64,
}

impl From<&EndpointUsage> for EndpointRow {
    fn from(usage: &EndpointUsage) -> Self {
        Self {
            endpoint: usage.endpoint.clone(),
            requests: usage.requests,
            successful_cost: format!("{:.0}", usage.successful_cost),
            throttled: usage.throttled,
        }
    }
}

pub async fn execute(ctx: &Context, action: UsageAction) -> Result<()> {
    match action {
        UsageAction::Summary => show_summary(ctx).await,
        UsageAction::Records { limit } => list_records(ctx, limit).await,
        UsageAction::Hourly => show_buckets(ctx, false).await,
        UsageAction::Daily => show_buckets(ctx, true).await,
        UsageAction::Endpoints => show_endpoints(ctx).await,
        UsageAction::Clear => clear_history(ctx).await,
    }
}

async fn show_summary(ctx: &Context) -> Result<()> {
    let summary = ctx.analytics().await.get_summary().await;

    match ctx.format {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Table => print_output(&summary_rows(&summary), ctx.format),
    }
}

fn summary_rows(summary: &UsageAnalyticsSummary) -> Vec<MetricRow> {
    let row = |metric: &str, value: String| MetricRow {
        metric: metric.to_string(),
        value,
    };

    let bucket = match &summary.current_status {
        Some(status) => format!(
            "{:.0}/{:.0} available (+{:.0}/s)",
            status.currently_available, status.maximum_available, status.restore_rate
        ),
        None => "No cost data observed".to_string(),
    };

    vec![
        row("Bucket", bucket),
        row("Usage", format!("{:.1}%", summary.usage_percentage)),
        row("Total requests", summary.total_requests.to_string()),
        row("Throttled requests", summary.throttled_requests.to_string()),
        row("Average query cost", format!("{:.2}", summary.average_query_cost)),
        row("Active hours", summary.hourly_usage.len().to_string()),
        row("Active days", summary.daily_usage.len().to_string()),
    ]
}

async fn list_records(ctx: &Context, limit: usize) -> Result<()> {
    let records = ctx.analytics().await.get_records().await;
    let records: Vec<&UsageRecord> = records.iter().take(limit).collect();

    match ctx.format {
        OutputFormat::Json => print_json(&records),
        OutputFormat::Table => {
            let rows: Vec<RecordRow> = records.into_iter().map(RecordRow::from).collect();
            print_output(&rows, ctx.format)
        }
    }
}

async fn show_buckets(ctx: &Context, daily: bool) -> Result<()> {
    let summary = ctx.analytics().await.get_summary().await;
    let (buckets, pattern) = if daily {
        (&summary.daily_usage, "%Y-%m-%d")
    } else {
        (&summary.hourly_usage, "%Y-%m-%d %H:00")
    };

    match ctx.format {
        OutputFormat::Json => print_json(buckets),
        OutputFormat::Table => {
            let rows: Vec<BucketRow> = buckets.iter().map(|b| BucketRow::new(b, pattern)).collect();
            print_output(&rows, ctx.format)
        }
    }
}

async fn show_endpoints(ctx: &Context) -> Result<()> {
    let breakdown = ctx.analytics().await.get_endpoint_breakdown().await;
    match ctx.format {
        OutputFormat::Json => print_json(&breakdown),
        OutputFormat::Table => {
            let rows: Vec<EndpointRow> = breakdown.iter().map(EndpointRow::from).collect();
            print_output(&rows, ctx.format)
        }
    }
}

async fn clear_history(ctx: &Context) -> Result<()> {
    let analytics = ctx.analytics().await;
    let cleared = analytics.len().await;
    analytics.clear_history().await;
    print_success(&format!("Cleared {} usage records", cleared), ctx.quiet);
    Ok(())
}
