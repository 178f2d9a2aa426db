//! Plan commands
//!
//! Show and switch the active Shopify plan.

use anyhow::{anyhow, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use shopgauge_core::services::governor::{Plan, DEFAULT_WARNING_PERCENTAGE};

use super::Context;
use crate::output::{
    print_info, print_json, print_output, print_single, print_success, OutputFormat,
};

#[derive(Subcommand)]
pub enum PlanAction {
    /// Show the active plan and its rate limits
    Show,

    /// List every plan and its rate limits
    List,

    /// Switch the active plan
    Set {
        /// Plan name: standard, advanced, plus, enterprise
        plan: String,
    },

    /// Points-per-second budget for a usage percentage
    Threshold {
        /// Percentage of the plan budget
        #[arg(long, short, default_value_t = DEFAULT_WARNING_PERCENTAGE)]
        percentage: f64,
    },
}

/// Plan row for table display
#[derive(Debug, Serialize, Tabled)]
#[serde(rename_all = "camelCase")]
pub struct PlanRow {
    #[tabled(rename = "Plan")]
    pub plan: String,
    #[tabled(rename = "Points/s")]
    pub points_per_second: u32,
    #[tabled(rename = "Max Query Cost")]
    pub max_single_query_cost: u32,
    #[tabled(rename = "Restore Rate")]
    pub restore_rate: u32,
    #[tabled(rename = "Active")]
    pub active: bool,
}

impl PlanRow {
    fn new(plan: Plan, active: Plan) -> Self {
        let limits = plan.rate_limits();
        Self {
            plan: plan.to_string(),
            points_per_second: limits.points_per_second,
            max_single_query_cost: limits.max_single_query_cost,
            restore_rate: limits.restore_rate,
            active: plan == active,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThresholdOutput {
    plan: String,
    percentage: f64,
    threshold: u32,
}

pub async fn execute(ctx: &Context, action: PlanAction) -> Result<()> {
    match action {
        PlanAction::Show => show_plan(ctx).await,
        PlanAction::List => list_plans(ctx).await,
        PlanAction::Set { plan } => set_plan(ctx, plan).await,
        PlanAction::Threshold { percentage } => show_threshold(ctx, percentage).await,
    }
}

async fn show_plan(ctx: &Context) -> Result<()> {
    let active = ctx.plan_config().await.get_current_plan().await;
    print_single(&PlanRow::new(active, active), ctx.format)
}

async fn list_plans(ctx: &Context) -> Result<()> {
    let active = ctx.plan_config().await.get_current_plan().await;
    let rows: Vec<PlanRow> = Plan::ALL
        .iter()
        .map(|plan| PlanRow::new(*plan, active))
        .collect();
    print_output(&rows, ctx.format)
}

async fn set_plan(ctx: &Context, plan: String) -> Result<()> {
    let plan: Plan = plan.parse().map_err(|e: String| anyhow!(e))?;
    let config = ctx.plan_config().await;

    if !config.update_plan(plan).await {
        print_info(&format!("Plan is already {}", plan), ctx.quiet);
        return Ok(());
    }

    let notifications = ctx.notifications().await;
    notifications
        .notify_plan_changed(plan, &plan.rate_limits())
        .await;

    print_success(&format!("Plan set to {}", plan), ctx.quiet);
    Ok(())
}

async fn show_threshold(ctx: &Context, percentage: f64) -> Result<()> {
    let config = ctx.plan_config().await;
    let plan = config.get_current_plan().await;
    let threshold = config.get_warning_threshold(percentage).await;

    match ctx.format {
        OutputFormat::Json => {
            let output = ThresholdOutput {
                plan: plan.to_string(),
                percentage,
                threshold,
            };
            print_json(&output)?;
        }
        OutputFormat::Table => {
            println!(
                "{}% of the {} plan budget = {} points/s",
                percentage, plan, threshold
            );
        }
    }
    Ok(())
}
